//! Transcode admission: a durable FIFO of jobs drained by at most K
//! concurrent workers.

pub mod queue;

pub use queue::TranscodeQueue;
