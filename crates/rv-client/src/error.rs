//! Client-side error taxonomy.
//!
//! HTTP failures are mapped back onto the server's error codes so callers
//! can tell a gone session from a transient rate limit.

use std::time::Duration;

use rv_core::api::ErrorBody;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The server rejected the request as malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The session is unknown, cancelled or already completed.
    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    /// The session passed its deadline and was swept.
    #[error("Upload session expired: {0}")]
    SessionExpired(String),

    /// Completion was refused because chunks are missing.
    #[error("Upload incomplete: {} chunk(s) missing", missing.len())]
    IncompleteUpload { missing: Vec<u32> },

    /// HTTP 429; `retry_after` carries the server hint when present.
    #[error("Rate limited by server")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other non-success response.
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Local state is missing, corrupt, or inconsistent with the source file.
    #[error("Client state error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Map a non-success response onto the taxonomy.
    pub fn from_response(status: u16, body: Option<ErrorBody>, retry_after: Option<Duration>) -> Self {
        let message = body
            .as_ref()
            .map(|b| b.error.clone())
            .unwrap_or_else(|| format!("HTTP {status}"));
        let code = body.as_ref().map(|b| b.code.as_str()).unwrap_or("");

        match status {
            429 => ClientError::RateLimited { retry_after },
            404 => ClientError::SessionNotFound(message),
            410 => ClientError::SessionExpired(message),
            400 if code == "incomplete_upload" => ClientError::IncompleteUpload {
                missing: body.and_then(|b| b.missing).unwrap_or_default(),
            },
            400 | 413 => ClientError::Validation(message),
            _ => ClientError::Server { status, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(code: &str, missing: Option<Vec<u32>>) -> Option<ErrorBody> {
        Some(ErrorBody {
            error: "boom".into(),
            code: code.into(),
            request_id: None,
            missing,
        })
    }

    #[test]
    fn maps_statuses() {
        assert!(matches!(
            ClientError::from_response(404, body("not_found", None), None),
            ClientError::SessionNotFound(_)
        ));
        assert!(matches!(
            ClientError::from_response(410, body("session_expired", None), None),
            ClientError::SessionExpired(_)
        ));
        assert!(matches!(
            ClientError::from_response(400, body("validation_error", None), None),
            ClientError::Validation(_)
        ));
        assert!(matches!(
            ClientError::from_response(503, None, None),
            ClientError::Server { status: 503, .. }
        ));
    }

    #[test]
    fn incomplete_carries_missing() {
        match ClientError::from_response(400, body("incomplete_upload", Some(vec![2, 5])), None) {
            ClientError::IncompleteUpload { missing } => assert_eq!(missing, vec![2, 5]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rate_limit_keeps_retry_hint() {
        match ClientError::from_response(429, None, Some(Duration::from_secs(2))) {
            ClientError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(2)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
