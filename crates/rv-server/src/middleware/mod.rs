//! HTTP middleware: request ID and rate limiting.

pub mod rate_limit;
pub mod request_id;
