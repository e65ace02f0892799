//! Secondary node selection
//!
//! Bricks are spread across the configured secondary nodes round-robin.
//! Before each spawn the assigned node is probed on the ssh port; when it
//! is down a random reachable node takes its place.

use std::time::Duration;

use rand::seq::SliceRandom;

use crate::config::{BrickConfig, GeorepConfig};
use crate::resource::ssh::reachable;
use crate::resource::Resource;

/// Connect timeout of one reachability probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Node assigned to the brick at `idx`
pub fn assigned_node(nodes: &[String], idx: usize) -> Option<&str> {
    if nodes.is_empty() {
        return None;
    }
    Some(nodes[idx % nodes.len()].as_str())
}

/// Secondary URL the worker for brick `idx` should use next
pub async fn choose_secondary(config: &GeorepConfig, idx: usize, brick: &BrickConfig) -> String {
    let url = config.secondary_for(brick).to_string();
    let nodes = config.session.secondary_nodes.clone();
    let port = config.transfer.ssh_port;

    let resource = match Resource::parse(&url) {
        Ok(r) if r.remote_host().is_some() => r,
        // local secondaries and bad URLs go to the worker unchanged
        _ => return url,
    };
    let Some(preferred) = assigned_node(&nodes, idx).map(str::to_string) else {
        return url;
    };

    let chosen = tokio::task::spawn_blocking(move || {
        if reachable(&preferred, port, PROBE_TIMEOUT) {
            return Some(preferred);
        }
        let up: Vec<String> = nodes
            .into_iter()
            .filter(|n| *n != preferred && reachable(n, port, PROBE_TIMEOUT))
            .collect();
        match up.choose(&mut rand::thread_rng()) {
            Some(node) => {
                tracing::warn!("secondary node {} is down, using {}", preferred, node);
                Some(node.clone())
            }
            None => {
                tracing::warn!("no secondary node reachable, keeping {}", preferred);
                Some(preferred)
            }
        }
    })
    .await
    .ok()
    .flatten();

    match chosen {
        Some(host) => resource.with_host(&host).canonical_url(),
        None => url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::path::PathBuf;

    #[test]
    fn test_round_robin_assignment() {
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(assigned_node(&nodes, 0), Some("a"));
        assert_eq!(assigned_node(&nodes, 4), Some("b"));
        assert_eq!(assigned_node(&[], 1), None);
    }

    #[tokio::test]
    async fn test_unreachable_node_is_replaced() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = GeorepConfig::default();
        config.session.secondary = "geo@down.invalid::gv1".into();
        config.session.secondary_nodes = vec!["down.invalid".into(), "127.0.0.1".into()];
        config.transfer.ssh_port = listener.local_addr().unwrap().port();
        let brick = BrickConfig {
            path: PathBuf::from("/bricks/b1"),
            secondary: None,
        };

        let url = choose_secondary(&config, 0, &brick).await;
        assert_eq!(url, "ssh://geo@127.0.0.1:gluster://localhost:gv1");

        // a local secondary is never rewritten
        config.session.secondary = "file:///srv/replica".into();
        assert_eq!(choose_secondary(&config, 0, &brick).await, "file:///srv/replica");
    }
}
