//! Route handlers for the HTTP API.

pub mod assets;
pub mod delivery;
pub mod health;
pub mod uploads;

use std::str::FromStr;

use crate::error::AppError;

/// Parse a path identifier; a malformed id cannot name anything, so it is
/// reported the same way as an unknown one.
pub(crate) fn parse_id<T: FromStr>(raw: &str, entity: &str) -> Result<T, AppError> {
    raw.parse::<T>()
        .map_err(|_| rv_core::Error::not_found(entity, raw).into())
}
