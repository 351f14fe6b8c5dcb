//! Query modules, one per table group.
//!
//! Every function takes a `&Connection` so callers can run it on a pooled
//! connection or inside a transaction.

pub mod assets;
pub mod sessions;
pub mod transcode_jobs;
