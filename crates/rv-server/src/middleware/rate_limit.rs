//! Governor-based rate limiting middleware.
//!
//! Two independent pools guard ingress: the general API pool
//! (`rate_limit.api_per_minute`) and the chunk pool
//! (`rate_limit.chunk_per_minute`), so a fast chunk stream cannot starve
//! status polls and vice versa.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rv_core::api::ErrorBody;

use super::request_id;

/// A shared rate limiter instance.
pub type SharedLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Create a rate limiter with the given requests-per-minute quota.
///
/// Returns `None` for a quota of 0, which disables the pool.
pub fn create_limiter(requests_per_minute: u32) -> Option<SharedLimiter> {
    let per_minute = NonZeroU32::new(requests_per_minute)?;
    Some(Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))))
}

/// Rate limiting middleware. Returns 429 Too Many Requests with a
/// `Retry-After` header when the pool is exhausted.
pub async fn rate_limit_middleware(
    State(limiter): State<SharedLimiter>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(()) => next.run(request).await,
        Err(not_until) => {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            too_many_requests(secs.max(1))
        }
    }
}

fn too_many_requests(retry_after_secs: u64) -> Response {
    let body = ErrorBody {
        error: "Rate limit exceeded".into(),
        code: "rate_limited".into(),
        request_id: request_id::current(),
        missing: None,
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, v);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_quota_disables_pool() {
        assert!(create_limiter(0).is_none());
        assert!(create_limiter(60).is_some());
    }

    #[test]
    fn burst_is_the_per_minute_quota() {
        let limiter = create_limiter(3).unwrap();
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn rejection_carries_retry_after() {
        let response = too_many_requests(7);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }
}
