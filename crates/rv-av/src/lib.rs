//! # rv-av
//!
//! External tool management and transcoding for reelvault.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout,
//!   line-by-line stderr streaming and cancellation.
//! - **Probing** ([`probe_duration`]) -- container duration via ffprobe.
//! - **Transcoding** ([`Transcoder`], [`FfmpegTranscoder`]) -- one still
//!   image plus an HLS VOD manifest and segments per source file, with
//!   fractional progress reporting.

pub mod command;
pub mod probe;
pub mod tools;
pub mod transcode;

// ---- Re-exports for convenience ----

pub use command::{ToolCommand, ToolOutput};
pub use probe::probe_duration;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use transcode::{
    FfmpegTranscoder, ProgressSink, TranscodeOutput, TranscodeRequest, Transcoder,
};
