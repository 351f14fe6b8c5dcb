//! Axum router construction.
//!
//! Builds the full application router with all route groups, middleware
//! layers, and the OpenAPI document.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::context::AppContext;
use crate::middleware::rate_limit::{create_limiter, rate_limit_middleware};
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::health::health_check,
        routes::uploads::start_upload,
        routes::uploads::get_upload,
        routes::uploads::put_chunk,
        routes::uploads::complete_upload,
        routes::uploads::cancel_upload,
        routes::assets::list_assets,
        routes::assets::get_asset,
        routes::delivery::get_source,
        routes::delivery::get_still,
        routes::delivery::get_manifest,
        routes::delivery::get_segment,
    ),
    components(schemas(
        rv_core::api::StartUploadRequest,
        rv_core::api::StartUploadResponse,
        rv_core::api::ChunkAcceptedResponse,
        rv_core::api::UploadStatusResponse,
        rv_core::api::CompleteUploadResponse,
        rv_core::api::CancelUploadResponse,
        rv_core::api::AssetResponse,
        rv_core::api::AssetUrls,
        rv_core::api::ErrorBody,
        rv_core::SessionStatus,
        rv_core::AssetStatus,
        routes::health::HealthResponse,
        rv_av::ToolInfo,
    ))
)]
pub struct ApiDoc;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let limits = &ctx.config.rate_limit;

    // Session and catalog routes share the general API pool.
    let mut control_routes = Router::new()
        .route("/uploads", post(routes::uploads::start_upload))
        .route(
            "/uploads/{id}",
            get(routes::uploads::get_upload).delete(routes::uploads::cancel_upload),
        )
        .route(
            "/uploads/{id}/complete",
            post(routes::uploads::complete_upload),
        )
        .route("/assets", get(routes::assets::list_assets))
        .route("/assets/{id}", get(routes::assets::get_asset));
    if let Some(limiter) = create_limiter(limits.api_per_minute) {
        control_routes = control_routes
            .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));
    }

    // Chunk bodies are far above axum's default body limit.
    let max_chunk = usize::try_from(ctx.config.upload.max_chunk_size).unwrap_or(usize::MAX);
    let mut chunk_routes = Router::new()
        .route(
            "/uploads/{id}/chunks/{index}",
            put(routes::uploads::put_chunk),
        )
        .layer(DefaultBodyLimit::max(max_chunk));
    if let Some(limiter) = create_limiter(limits.chunk_per_minute) {
        chunk_routes = chunk_routes
            .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));
    }

    let delivery_routes = Router::new()
        .route("/assets/{id}/source", get(routes::delivery::get_source))
        .route("/assets/{id}/still.jpg", get(routes::delivery::get_still))
        .route(
            "/assets/{id}/hls/index.m3u8",
            get(routes::delivery::get_manifest),
        )
        .route(
            "/assets/{id}/hls/{segment}",
            get(routes::delivery::get_segment),
        );

    let api = control_routes.merge(chunk_routes).merge(delivery_routes);

    Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/api", api)
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use rv_av::{ProgressSink, ToolRegistry, TranscodeOutput, TranscodeRequest, Transcoder};
    use rv_core::config::Config;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Unused;

    #[async_trait]
    impl Transcoder for Unused {
        async fn transcode(
            &self,
            _request: &TranscodeRequest,
            _progress: ProgressSink,
            _cancel: CancellationToken,
        ) -> rv_core::Result<TranscodeOutput> {
            Err(rv_core::Error::Internal("not used".into()))
        }
    }

    fn app(tweak: impl FnOnce(&mut Config)) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.server.data_dir = dir.path().to_path_buf();
        tweak(&mut config);
        let db = rv_db::pool::init_memory_pool().unwrap();
        let ctx = AppContext::new(
            db,
            config,
            Arc::new(ToolRegistry::default()),
            Arc::new(Unused),
        );
        (build_router(ctx), dir)
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_echoes_request_id() {
        let (app, _dir) = app(|_| {});
        let response = app
            .oneshot(
                Request::get("/health")
                    .header("x-request-id", "req-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-request-id"], "req-1");
        let body = json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["transcodingAvailable"], false);
    }

    #[tokio::test]
    async fn unknown_session_is_json_404() {
        let (app, _dir) = app(|_| {});
        let response = app
            .oneshot(
                Request::get("/api/uploads/not-a-uuid")
                    .header("x-request-id", "req-2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = json(response).await;
        assert_eq!(body["code"], "not_found");
        assert_eq!(body["request_id"], "req-2");
    }

    #[tokio::test]
    async fn chunk_pool_rejects_with_retry_after() {
        let (app, _dir) = app(|c| c.rate_limit.chunk_per_minute = 1);
        let uri = format!("/api/uploads/{}/chunks/0", uuid::Uuid::new_v4());

        let first = app
            .clone()
            .oneshot(Request::put(&uri).body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);

        let second = app
            .oneshot(Request::put(&uri).body(Body::from("x")).unwrap())
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
        assert_eq!(json(second).await["code"], "rate_limited");
    }

    #[tokio::test]
    async fn chunk_pool_does_not_drain_api_pool() {
        let (app, _dir) = app(|c| {
            c.rate_limit.chunk_per_minute = 1;
            c.rate_limit.api_per_minute = 100;
        });
        for _ in 0..3 {
            let _ = app
                .clone()
                .oneshot(
                    Request::put(format!("/api/uploads/{}/chunks/0", uuid::Uuid::new_v4()))
                        .body(Body::from("x"))
                        .unwrap(),
                )
                .await
                .unwrap();
        }
        let status = app
            .oneshot(Request::get("/api/assets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(status.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chunk_body_limit_follows_config() {
        let (app, _dir) = app(|c| c.upload.max_chunk_size = 4);
        let response = app
            .oneshot(
                Request::put(format!("/api/uploads/{}/chunks/0", uuid::Uuid::new_v4()))
                    .body(Body::from("0123456789"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let (app, _dir) = app(|_| {});
        let response = app
            .oneshot(
                Request::get("/api-docs/openapi.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let doc = json(response).await;
        assert!(doc["paths"]["/api/uploads/{id}/chunks/{index}"].is_object());
    }
}
