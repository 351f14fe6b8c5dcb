//! Resumable upload route handlers.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use rv_core::api::{
    percent, CancelUploadResponse, ChunkAcceptedResponse, CompleteUploadResponse,
    StartUploadRequest, StartUploadResponse, UploadStatusResponse,
};
use rv_core::SessionId;

use super::parse_id;
use crate::context::AppContext;
use crate::error::AppError;

/// POST /api/uploads
#[utoipa::path(
    post,
    path = "/api/uploads",
    request_body = StartUploadRequest,
    responses(
        (status = 201, description = "Upload session created", body = StartUploadResponse),
        (status = 400, description = "Invalid declaration", body = rv_core::api::ErrorBody)
    )
)]
pub async fn start_upload(
    State(ctx): State<AppContext>,
    Json(payload): Json<StartUploadRequest>,
) -> Result<impl IntoResponse, AppError> {
    let session = ctx.uploads.start_session(&payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(StartUploadResponse {
            session_id: session.id,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            expires_at: session.expires_at,
        }),
    ))
}

/// GET /api/uploads/{id}
#[utoipa::path(
    get,
    path = "/api/uploads/{id}",
    params(("id" = String, Path, description = "Upload session ID")),
    responses(
        (status = 200, description = "Session status", body = UploadStatusResponse),
        (status = 404, description = "Unknown session", body = rv_core::api::ErrorBody)
    )
)]
pub async fn get_upload(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let id: SessionId = parse_id(&id, "upload_session")?;
    let (session, accepted_chunks) = ctx.uploads.session_status(id)?;

    Ok(Json(UploadStatusResponse {
        session_id: session.id,
        filename: session.filename,
        status: session.status,
        chunk_size: session.chunk_size,
        total_chunks: session.total_chunks,
        total_bytes: session.total_size,
        uploaded_bytes: session.uploaded_bytes,
        accepted_chunks,
        expires_at: session.expires_at,
    }))
}

/// PUT /api/uploads/{id}/chunks/{index}
///
/// The request body is the raw chunk payload.
#[utoipa::path(
    put,
    path = "/api/uploads/{id}/chunks/{index}",
    params(
        ("id" = String, Path, description = "Upload session ID"),
        ("index" = u32, Path, description = "Zero-based chunk index")
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Chunk accepted", body = ChunkAcceptedResponse),
        (status = 400, description = "Bad index or length", body = rv_core::api::ErrorBody),
        (status = 404, description = "Unknown or finished session", body = rv_core::api::ErrorBody),
        (status = 410, description = "Session expired", body = rv_core::api::ErrorBody),
        (status = 429, description = "Rate limited", body = rv_core::api::ErrorBody)
    )
)]
pub async fn put_chunk(
    State(ctx): State<AppContext>,
    Path((id, index)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<ChunkAcceptedResponse>, AppError> {
    let id: SessionId = parse_id(&id, "upload_session")?;
    let index: u32 = index
        .parse()
        .map_err(|_| rv_core::Error::Validation(format!("invalid chunk index '{index}'")))?;

    let ack = ctx.uploads.accept_chunk(id, index, &body[..]).await?;
    Ok(Json(ChunkAcceptedResponse {
        chunk_index: ack.index,
        uploaded_bytes: ack.uploaded_bytes,
        total_bytes: ack.total_bytes,
        progress_percent: percent(ack.uploaded_bytes, ack.total_bytes),
    }))
}

/// POST /api/uploads/{id}/complete
#[utoipa::path(
    post,
    path = "/api/uploads/{id}/complete",
    params(("id" = String, Path, description = "Upload session ID")),
    responses(
        (status = 200, description = "Upload assembled, transcode queued", body = CompleteUploadResponse),
        (status = 400, description = "Chunks missing", body = rv_core::api::ErrorBody),
        (status = 404, description = "Unknown or finished session", body = rv_core::api::ErrorBody),
        (status = 410, description = "Session expired", body = rv_core::api::ErrorBody)
    )
)]
pub async fn complete_upload(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<CompleteUploadResponse>, AppError> {
    let id: SessionId = parse_id(&id, "upload_session")?;
    let (asset, _job) = ctx.uploads.complete_session(id).await?;
    Ok(Json(CompleteUploadResponse {
        asset_id: asset.id,
        status: asset.status,
    }))
}

/// DELETE /api/uploads/{id}
#[utoipa::path(
    delete,
    path = "/api/uploads/{id}",
    params(("id" = String, Path, description = "Upload session ID")),
    responses(
        (status = 200, description = "Session cancelled (idempotent)", body = CancelUploadResponse)
    )
)]
pub async fn cancel_upload(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<CancelUploadResponse>, AppError> {
    let id: SessionId = parse_id(&id, "upload_session")?;
    ctx.uploads.cancel_session(id).await?;
    Ok(Json(CancelUploadResponse {
        session_id: id,
        cancelled: true,
    }))
}
