//! rv-core: shared types, IDs, errors, configuration, and wire DTOs.
//!
//! This crate is the foundational dependency for all other rv-* crates,
//! providing type-safe identifiers, a unified error type, lifecycle enums
//! for uploads, assets and transcode jobs, application configuration, and
//! the JSON request/response shapes shared by the server and the upload
//! client.

pub mod api;
pub mod config;
pub mod error;
pub mod ids;
pub mod plan;
pub mod status;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use plan::ChunkPlan;
pub use status::*;
