//! ssh helpers shared by the secondary link, rsync and the find tool

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use nix::unistd::{getuid, User};

use crate::config::TransferConfig;

/// Name of the user running this process
pub fn current_user() -> String {
    match User::from_uid(getuid()) {
        Ok(Some(user)) => user.name,
        _ => getuid().to_string(),
    }
}

/// ssh program and options, without the destination
pub fn ssh_argv(config: &TransferConfig) -> Vec<String> {
    let mut argv = vec![config.ssh_command.clone()];
    argv.extend(config.ssh_options.iter().cloned());
    argv.push("-p".to_string());
    argv.push(config.ssh_port.to_string());
    argv
}

/// Whether `host` accepts TCP connections on `port` within `timeout`
pub fn reachable(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(a) => a,
        Err(e) => {
            tracing::debug!("cannot resolve {}: {}", host, e);
            return false;
        }
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, timeout).is_ok() {
            return true;
        }
    }
    false
}
