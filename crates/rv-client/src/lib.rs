//! rv-client: resumable upload client for a reelvault server.
//!
//! - [`UploadApi`] / [`HttpUploadApi`] -- the five upload endpoints over
//!   `reqwest`, with HTTP errors mapped back onto [`ClientError`].
//! - [`UploadController`] -- drives one upload through a bounded pool of
//!   chunk transfers with pause, resume and cancel.
//! - [`ClientStateStore`] -- durable record of acknowledged chunks so an
//!   upload can resume after the process exits.
//! - [`RetryPolicy`] -- backoff for rate-limited requests.

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod retry;
pub mod state;

pub use api::{HttpUploadApi, UploadApi};
pub use config::ClientConfig;
pub use controller::{Progress, RunOutcome, UploadController, UploadOptions, UploadPhase};
pub use error::{ClientError, Result};
pub use retry::RetryPolicy;
pub use state::{upload_id_for, ClientStateStore, ClientUploadState};
