//! Daemon configuration.

use std::io;
use std::net;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use corpora::sync::WatchedSource;

/// Default address the tail server binds to.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8383";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to read configuration at `{path}`: {err}")]
    Io {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("failed to parse configuration at `{path}`: {err}")]
    Parse {
        path: PathBuf,
        #[source]
        err: serde_json::Error,
    },
}

/// Node configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Directory holding the mutation log.
    pub data_dir: PathBuf,
    /// Address of the tail server.
    #[serde(default = "default_listen")]
    pub listen: net::SocketAddr,
    /// Leader to follow. When set, the node runs as a follower and
    /// `sources` is ignored.
    #[serde(default)]
    pub follow: Option<String>,
    /// Upstreams to sync from (leader mode).
    #[serde(default)]
    pub sources: Vec<WatchedSource>,
}

fn default_listen() -> net::SocketAddr {
    DEFAULT_LISTEN.parse().expect("config: default address is valid")
}

impl Config {
    /// Load a configuration from disk.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|err| Error::Io {
            path: path.to_path_buf(),
            err,
        })?;
        serde_json::from_str(&contents).map_err(|err| Error::Parse {
            path: path.to_path_buf(),
            err,
        })
    }

    /// A default configuration rooted at `data_dir`.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            listen: default_listen(),
            follow: None,
            sources: Vec::new(),
        }
    }

    /// Path of the mutation log file.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(corpora::log::LOG_FILE)
    }
}
