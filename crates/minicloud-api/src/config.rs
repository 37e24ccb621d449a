//! Server configuration from environment variables.
//!
//! Variables carry the `MINICLOUD_` prefix with dashes mapped to
//! underscores and uppercased.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use minicloud_core::{Error, Result};

/// Static server configuration (dynamic options live in the backend).
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordination-backend endpoints (`MINICLOUD_ETCD_ENDPOINTS`,
    /// comma-separated, default `127.0.0.1:2379`).
    pub etcd_endpoints: Vec<String>,
    /// Backend dial timeout (`MINICLOUD_ETCD_DIAL_TIMEOUT`, milliseconds,
    /// default 500).
    pub etcd_dial_timeout: Duration,
    /// HTTP bind address (`MINICLOUD_LISTEN_ADDR`, default
    /// `127.0.0.1:1959`).
    pub listen_addr: SocketAddr,
    /// Root directory for per-VM state (`MINICLOUD_VM_ROOT`, default
    /// `/var/lib/minicloud/vm`).
    pub vm_root: PathBuf,
    /// Emit JSON logs (`MINICLOUD_LOG_JSON`, default off).
    pub log_json: bool,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("MINICLOUD_{name}")).ok()
}

impl Config {
    /// Loads configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a variable is present but unparsable.
    pub fn from_env() -> Result<Self> {
        let etcd_endpoints = env_var("ETCD_ENDPOINTS")
            .unwrap_or_else(|| "127.0.0.1:2379".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let etcd_dial_timeout = match env_var("ETCD_DIAL_TIMEOUT") {
            Some(raw) => Duration::from_millis(raw.parse().map_err(|e| {
                Error::backend(format!("invalid MINICLOUD_ETCD_DIAL_TIMEOUT: {e}"))
            })?),
            None => Duration::from_millis(500),
        };

        let listen_addr = match env_var("LISTEN_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::backend(format!("invalid MINICLOUD_LISTEN_ADDR: {e}")))?,
            None => SocketAddr::from(([127, 0, 0, 1], 1959)),
        };

        let vm_root = env_var("VM_ROOT")
            .map_or_else(|| PathBuf::from("/var/lib/minicloud/vm"), PathBuf::from);

        let log_json = env_var("LOG_JSON")
            .is_some_and(|raw| matches!(raw.as_str(), "1" | "true" | "yes"));

        Ok(Self {
            etcd_endpoints,
            etcd_dial_timeout,
            listen_addr,
            vm_root,
            log_json,
        })
    }
}
