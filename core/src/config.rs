//! Service configuration: defaults, environment overrides, CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use crate::events::{DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_SUBSCRIBER_CAPACITY};
use crate::replay::{DEFAULT_REPLAY_TTL, DEFAULT_UPSTREAM_TIMEOUT};
use crate::storage::DEFAULT_MAX_ROWS;

pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

pub const ENV_STORAGE: &str = "FLOWSCOPE_STORAGE";
pub const ENV_BIND: &str = "FLOWSCOPE_BIND";
pub const ENV_PORT: &str = "FLOWSCOPE_PORT";
pub const ENV_MAX_ROWS: &str = "FLOWSCOPE_MAX_ROWS";

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Directory holding the database and release-build logs
    pub storage_path: PathBuf,
    pub bind_address: String,
    pub port: u16,
    pub max_rows: usize,
    pub replay_ttl: Duration,
    pub upstream_timeout: Duration,
    pub subscriber_capacity: usize,
    pub keepalive_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            max_rows: DEFAULT_MAX_ROWS,
            replay_ttl: DEFAULT_REPLAY_TTL,
            upstream_timeout: DEFAULT_UPSTREAM_TIMEOUT,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

impl ServiceConfig {
    /// Defaults with `FLOWSCOPE_*` overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from any key lookup. Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_STORAGE).filter(|v| !v.trim().is_empty()) {
            self.storage_path = PathBuf::from(path.trim());
        }
        if let Some(bind) = lookup(ENV_BIND).filter(|v| !v.trim().is_empty()) {
            self.bind_address = bind.trim().to_string();
        }
        if let Some(port) = lookup(ENV_PORT) {
            match port.trim().parse::<u16>() {
                Ok(port) => self.port = port,
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", ENV_PORT, port, e),
            }
        }
        if let Some(rows) = lookup(ENV_MAX_ROWS) {
            match rows.trim().parse::<usize>() {
                Ok(rows) if rows > 0 => self.max_rows = rows,
                Ok(_) => tracing::warn!("Ignoring {}=0", ENV_MAX_ROWS),
                Err(e) => tracing::warn!("Ignoring {}={:?}: {}", ENV_MAX_ROWS, rows, e),
            }
        }
    }

    /// `host:port` to listen on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

fn default_storage_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("flowscope"))
        .unwrap_or_else(|| PathBuf::from("flowscope_data"))
}
