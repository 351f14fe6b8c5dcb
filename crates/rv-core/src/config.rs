//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the server, uploads, transcoding, rate limiting and
//! external tools. Every section defaults sensibly so a completely empty
//! `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

const MIB: u64 = 1024 * 1024;

/// Upper bound for second counts converted to `chrono::Duration`.
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub upload: UploadConfig,
    pub transcode: TranscodeConfig,
    pub rate_limit: RateLimitConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Parse a JSON configuration string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
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
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Check the configuration for suspicious values.
    ///
    /// Returns human-readable warnings; an empty vector means the config is
    /// fine. Nothing here is fatal, the server clamps values where needed.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        let up = &self.upload;
        if up.allowed_extensions.is_empty() {
            warnings.push("upload.allowed_extensions is empty; every upload will be rejected".into());
        }
        if up.min_chunk_size > up.max_chunk_size {
            warnings.push(format!(
                "upload.min_chunk_size ({}) exceeds upload.max_chunk_size ({})",
                up.min_chunk_size, up.max_chunk_size
            ));
        }
        if up.default_chunk_size < up.min_chunk_size || up.default_chunk_size > up.max_chunk_size {
            warnings.push(format!(
                "upload.default_chunk_size ({}) is outside [{}, {}]",
                up.default_chunk_size, up.min_chunk_size, up.max_chunk_size
            ));
        }
        if up.session_ttl_secs == 0 {
            warnings.push("upload.session_ttl_secs is 0; sessions expire immediately".into());
        }

        if self.transcode.max_concurrent == 0 {
            warnings.push("transcode.max_concurrent is 0; 1 worker will be used".into());
        }
        if self.transcode.max_attempts == 0 {
            warnings.push("transcode.max_attempts is 0; each job gets a single attempt".into());
        }

        if self.rate_limit.chunk_per_minute != 0
            && self.rate_limit.chunk_per_minute < self.rate_limit.api_per_minute
        {
            warnings.push(
                "rate_limit.chunk_per_minute is lower than rate_limit.api_per_minute".into(),
            );
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// HTTP server and storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Root for scratch chunks and finished media.
    pub data_dir: PathBuf,
}

impl ServerConfig {
    /// Directory holding one subdirectory of chunk files per active session.
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join("scratch")
    }

    /// Directory holding one subdirectory per asset (source + derived files).
    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            db_path: PathBuf::from("./data/reelvault.db"),
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Chunked upload limits and session lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Session lifetime measured from creation.
    pub session_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long expired session rows are kept before being purged.
    pub tombstone_retention_secs: u64,
    pub default_chunk_size: u64,
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_file_size: u64,
    /// Lowercase extensions without the dot.
    pub allowed_extensions: Vec<String>,
}

impl UploadConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.session_ttl_secs.min(MAX_DURATION_SECS) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn tombstone_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.tombstone_retention_secs.min(MAX_DURATION_SECS) as i64)
    }

    /// Whether `ext` (any case, no dot) is accepted.
    pub fn allows_extension(&self, ext: &str) -> bool {
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 5 * 60,
            tombstone_retention_secs: 7 * 24 * 60 * 60,
            default_chunk_size: 10 * MIB,
            min_chunk_size: 256 * 1024,
            max_chunk_size: 100 * MIB,
            max_file_size: 100 * 1024 * MIB,
            allowed_extensions: ["mp4", "mkv", "mov", "avi", "webm", "m4v"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Admission control and ffmpeg settings for transcoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// Maximum number of simultaneous ffmpeg invocations.
    pub max_concurrent: usize,
    /// Total attempts per job, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub retry_base_delay_secs: u64,
    pub poll_interval_secs: u64,
    /// Timestamp of the extracted still image.
    pub still_offset_secs: f64,
    pub segment_duration_secs: u32,
    pub video_crf: u32,
    pub video_preset: String,
    pub audio_bitrate: String,
    /// Upper bound on a single ffmpeg run.
    pub timeout_secs: u64,
}

impl TranscodeConfig {
    pub fn worker_count(&self) -> usize {
        self.max_concurrent.max(1)
    }

    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    /// Backoff before attempt `attempts + 1`, given `attempts` already made.
    pub fn retry_delay(&self, attempts: u32) -> chrono::Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let secs = self.retry_base_delay_secs.saturating_mul(1u64 << exp);
        chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_attempts: 3,
            retry_base_delay_secs: 30,
            poll_interval_secs: 5,
            still_offset_secs: 10.0,
            segment_duration_secs: 6,
            video_crf: 21,
            video_preset: "veryfast".into(),
            audio_bitrate: "160k".into(),
            timeout_secs: 6 * 60 * 60,
        }
    }
}

/// Ingress rate limits, in requests per minute. 0 disables a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub api_per_minute: u32,
    pub chunk_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            api_per_minute: 300,
            chunk_per_minute: 6000,
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}
