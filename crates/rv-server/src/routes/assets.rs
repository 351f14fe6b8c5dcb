//! Asset catalog route handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use rv_core::api::{AssetResponse, AssetUrls};
use rv_core::{AssetId, AssetStatus};
use rv_db::models::Asset;
use serde::Deserialize;

use super::parse_id;
use crate::context::AppContext;
use crate::error::AppError;

/// Query parameters for listing assets.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListAssetsParams {
    /// One of `uploading`, `processing`, `ready`, `error`.
    pub status: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

pub(crate) fn asset_response(asset: &Asset) -> AssetResponse {
    let base = format!("/api/assets/{}", asset.id);
    let ready = asset.status == AssetStatus::Ready;
    AssetResponse {
        id: asset.id,
        title: asset.title.clone(),
        year: asset.year,
        filename: asset.filename.clone(),
        status: asset.status,
        size_bytes: asset.size_bytes,
        duration_secs: asset.duration_secs,
        progress_percent: asset.progress_pct,
        error: asset.error.clone(),
        created_at: asset.created_at,
        updated_at: asset.updated_at,
        urls: AssetUrls {
            source: format!("{base}/source"),
            still: (ready && asset.still_path.is_some()).then(|| format!("{base}/still.jpg")),
            manifest: (ready && asset.manifest_path.is_some())
                .then(|| format!("{base}/hls/index.m3u8")),
        },
    }
}

/// GET /api/assets
#[utoipa::path(
    get,
    path = "/api/assets",
    params(ListAssetsParams),
    responses(
        (status = 200, description = "List assets, newest first", body = Vec<AssetResponse>),
        (status = 400, description = "Unknown status filter", body = rv_core::api::ErrorBody)
    )
)]
pub async fn list_assets(
    State(ctx): State<AppContext>,
    Query(params): Query<ListAssetsParams>,
) -> Result<Json<Vec<AssetResponse>>, AppError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<AssetStatus>)
        .transpose()?;

    let conn = rv_db::pool::get_conn(&ctx.db)?;
    let assets = rv_db::queries::assets::list_assets(
        &conn,
        status,
        params.offset.max(0),
        params.limit.clamp(1, 500),
    )?;
    Ok(Json(assets.iter().map(asset_response).collect()))
}

/// GET /api/assets/{id}
#[utoipa::path(
    get,
    path = "/api/assets/{id}",
    params(("id" = String, Path, description = "Asset ID")),
    responses(
        (status = 200, description = "Asset record", body = AssetResponse),
        (status = 404, description = "Unknown asset", body = rv_core::api::ErrorBody)
    )
)]
pub async fn get_asset(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<AssetResponse>, AppError> {
    let id: AssetId = parse_id(&id, "asset")?;
    let conn = rv_db::pool::get_conn(&ctx.db)?;
    let asset = rv_db::queries::assets::get_asset(&conn, id)?
        .ok_or_else(|| rv_core::Error::not_found("asset", id))?;
    Ok(Json(asset_response(&asset)))
}
