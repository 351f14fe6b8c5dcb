//! Resumable chunked uploads: session registry, per-session gates, chunk
//! assembly and the expiry sweep.

pub mod assembler;
pub mod gate;
pub mod registry;
pub mod sweep;

pub use registry::{ChunkAck, SessionRegistry, SweepReport};
