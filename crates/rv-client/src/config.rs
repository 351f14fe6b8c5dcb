//! Upload client configuration.
//!
//! The client reads the `client` section of the same JSON file the server
//! uses; every other section is ignored here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the server, e.g. `http://localhost:8080`.
    pub server_url: String,
    /// Chunk transfers in flight at once.
    pub concurrency: usize,
    /// Attempts per chunk for rate-limited requests, including the first.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// JSON file holding resumable upload state.
    pub state_path: PathBuf,
}

/// The parts of a shared config file the client cares about.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    client: ClientConfig,
}

impl ClientConfig {
    /// Parse the `client` section of a JSON configuration string.
    pub fn from_json(json_str: &str) -> serde_json::Result<Self> {
        serde_json::from_str::<ConfigFile>(json_str).map(|f| f.client)
    }

    /// Load from a config file, falling back to defaults if the path is
    /// `None`, the file is missing or it does not parse.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config file at {}; using client defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn worker_count(&self) -> usize {
        self.concurrency.max(1)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".into(),
            concurrency: 3,
            max_attempts: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            request_timeout_secs: 300,
            state_path: PathBuf::from("~/.reelvault/uploads.json"),
        }
    }
}
