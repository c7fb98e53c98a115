//! Filesystem layout shared by the IPC directory and the datagram ingest.
//!
//! The daemon consumes no environment variables and no command-line flags;
//! everything hangs off one socket root. Tests relocate the root into a
//! temporary directory.

use std::path::{Path, PathBuf};

/// Default socket root for a system install.
pub const DEFAULT_SOCKET_ROOT: &str = "/run/statsd";

/// File name of the datagram ingest endpoint under the socket root.
pub const EVENT_SOCKET_NAME: &str = "events.sock";

/// Socket layout configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding every socket this process binds or resolves.
    pub socket_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_root: PathBuf::from(DEFAULT_SOCKET_ROOT),
        }
    }
}

impl Config {
    /// Configuration rooted at an arbitrary directory.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self {
            socket_root: root.as_ref().to_path_buf(),
        }
    }

    /// Stream socket path publishing `name` in the service directory.
    #[must_use]
    pub fn service_socket(&self, name: &str) -> PathBuf {
        self.socket_root.join(format!("{name}.sock"))
    }

    /// Datagram socket path the ingest listener binds.
    #[must_use]
    pub fn event_socket(&self) -> PathBuf {
        self.socket_root.join(EVENT_SOCKET_NAME)
    }
}
