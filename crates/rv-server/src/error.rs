//! Error-to-HTTP response conversion.
//!
//! Implements `IntoResponse` for [`rv_core::Error`] so that route handlers
//! can return `Result<T, AppError>` and use `?` on library calls.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rv_core::api::ErrorBody;

use crate::middleware::request_id;

/// Wrapper so we can implement `IntoResponse` for an external type.
pub struct AppError {
    inner: rv_core::Error,
    request_id: Option<String>,
}

impl AppError {
    pub fn new(inner: rv_core::Error) -> Self {
        Self {
            inner,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }
}

impl From<rv_core::Error> for AppError {
    fn from(e: rv_core::Error) -> Self {
        Self::new(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(
                status = %status,
                error = %self.inner,
                "Server error in API handler"
            );
        }

        let missing = match &self.inner {
            rv_core::Error::IncompleteUpload { missing, .. } => Some(missing.clone()),
            _ => None,
        };

        let body = ErrorBody {
            error: self.inner.to_string(),
            code: self.inner.code().to_string(),
            request_id: self.request_id.or_else(request_id::current),
            missing,
        };

        (status, axum::Json(body)).into_response()
    }
}
