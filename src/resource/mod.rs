//! Resource Connector
//!
//! A secondary is named by URL and is one of three kinds: a local
//! directory, a local gluster volume, or either of those on a remote host
//! reached over ssh. Parsing, canonical naming and the secondary id live
//! here; connecting lives in [`link`], the serving side in [`secondary`]
//! and the data path in [`transfer`].

pub mod link;
pub mod secondary;
pub mod ssh;
pub mod transfer;

pub use link::{PendingLink, SecondaryLink, TransferTarget};
pub use secondary::{EntryFailure, EntryOp, MetaOp, SecondaryService};
pub use transfer::{engine_for, CopyEngine, RsyncEngine, TransferEngine};

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{Error, Result};

/// Host serving the volume named by an ssh URL, as seen from the far end
const LOCAL_HOST: &str = "localhost";

/// A replication endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Local directory
    File { path: PathBuf },
    /// Gluster volume served by `host`
    Gluster { host: String, volume: String },
    /// `inner` on a remote host, reached over ssh
    Ssh {
        user: Option<String>,
        host: String,
        inner: Box<Resource>,
    },
}

impl Resource {
    /// Parse a resource URL.
    ///
    /// Accepted forms: `file:///abs/path`, `/abs/path`,
    /// `gluster://host:volume`, `host:volume`, `ssh://[user@]host:/path`,
    /// `ssh://[user@]host::volume` and `[user@]host::volume`.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if let Some(rest) = url.strip_prefix("file://") {
            return Self::file(rest, url);
        }
        if let Some(rest) = url.strip_prefix("gluster://") {
            return Self::gluster(rest, url);
        }
        if let Some(rest) = url.strip_prefix("ssh://") {
            return Self::ssh(rest, url);
        }
        if url.contains("://") {
            return Err(Error::UnsupportedUrl(url.to_string()));
        }
        if url.starts_with('/') {
            return Self::file(url, url);
        }
        if url.contains("::") {
            return Self::ssh(url, url);
        }
        if url.contains(':') {
            return Self::gluster(url, url);
        }
        Err(Error::UnsupportedUrl(url.to_string()))
    }

    fn file(path: &str, url: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.is_absolute() {
            return Err(Error::UnsupportedUrl(format!("{} (path must be absolute)", url)));
        }
        Ok(Resource::File {
            path: path.to_path_buf(),
        })
    }

    fn gluster(rest: &str, url: &str) -> Result<Self> {
        match rest.split_once(':') {
            Some((host, volume)) if is_host_name(host) && is_volume_name(volume) => Ok(Resource::Gluster {
                host: host.to_string(),
                volume: volume.to_string(),
            }),
            _ => Err(Error::UnsupportedUrl(url.to_string())),
        }
    }

    fn ssh(rest: &str, url: &str) -> Result<Self> {
        let (address, inner) = if let Some((address, volume)) = rest.split_once("::") {
            if !is_volume_name(volume) {
                return Err(Error::UnsupportedUrl(url.to_string()));
            }
            let inner = Resource::Gluster {
                host: LOCAL_HOST.to_string(),
                volume: volume.to_string(),
            };
            (address, inner)
        } else if let Some((address, path)) = rest.split_once(':') {
            let inner = Resource::parse(path)?;
            if matches!(inner, Resource::Ssh { .. }) {
                return Err(Error::UnsupportedUrl(format!("{} (nested ssh)", url)));
            }
            (address, inner)
        } else {
            return Err(Error::UnsupportedUrl(url.to_string()));
        };

        let (user, host) = match address.split_once('@') {
            Some((user, host)) => (Some(user.to_string()), host),
            None => (None, address),
        };
        if !is_host_name(host) {
            return Err(Error::UnsupportedUrl(url.to_string()));
        }
        Ok(Resource::Ssh {
            user,
            host: host.to_string(),
            inner: Box::new(inner),
        })
    }

    /// Canonical URL, used to identify the secondary
    pub fn canonical_url(&self) -> String {
        match self {
            Resource::File { path } => format!("file://{}", path.display()),
            Resource::Gluster { host, volume } => format!("gluster://{}:{}", host, volume),
            Resource::Ssh { user, host, inner } => {
                let user = user.clone().unwrap_or_else(ssh::current_user);
                format!("ssh://{}@{}:{}", user, host, inner.canonical_url())
            }
        }
    }

    /// Stable id derived from the canonical URL
    pub fn uuid(&self) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, self.canonical_url().as_bytes())
    }

    /// Whether this resource can act as the near end of a link to `peer`
    pub fn can_connect_to(&self, peer: &Resource) -> bool {
        !matches!((self, peer), (Resource::Ssh { .. }, Resource::Ssh { .. }))
    }

    /// Host an ssh resource points at
    pub fn remote_host(&self) -> Option<&str> {
        match self {
            Resource::Ssh { host, .. } => Some(host),
            _ => None,
        }
    }

    /// `user@host` as passed to ssh
    pub fn remote_address(&self) -> Option<String> {
        match self {
            Resource::Ssh { user: Some(user), host, .. } => Some(format!("{}@{}", user, host)),
            Resource::Ssh { user: None, host, .. } => Some(host.clone()),
            _ => None,
        }
    }

    /// Same resource on a different remote host
    pub fn with_host(&self, new_host: &str) -> Resource {
        match self {
            Resource::Ssh { user, inner, .. } => Resource::Ssh {
                user: user.clone(),
                host: new_host.to_string(),
                inner: inner.clone(),
            },
            other => other.clone(),
        }
    }

    /// URL the far end is started with
    pub fn inner_url(&self) -> String {
        match self {
            Resource::Ssh { inner, .. } => inner.canonical_url(),
            other => other.canonical_url(),
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical_url())
    }
}

fn is_host_name(s: &str) -> bool {
    !s.is_empty() && !s.contains(|c: char| matches!(c, ':' | '/' | '@'))
}

fn is_volume_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
