//! Byte-range delivery of source artifacts, stills, manifests and segments.
//!
//! Every request opens its own file handle and streams through a bounded
//! `ReaderStream`, so concurrent overlapping ranges against one file never
//! share state and memory stays flat regardless of file size.

use std::path::{Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use rv_core::AssetId;
use rv_db::models::Asset;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use super::parse_id;
use crate::context::AppContext;
use crate::error::AppError;

const STREAM_BUFFER: usize = 64 * 1024;
const STILL_CACHE_CONTROL: &str = "public, max-age=86400";
const MANIFEST_CACHE_CONTROL: &str = "public, max-age=300";

/// A single parsed `Range: bytes=` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=start-end` or `bytes=start-`.
    FromTo(u64, Option<u64>),
    /// `bytes=-n`: the last `n` bytes.
    Suffix(u64),
}

/// Byte window to serve, resolved against the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedRange {
    Full,
    /// Inclusive bounds.
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a `Range` header value.
///
/// Only a single `bytes=` range is understood; anything else (multiple
/// ranges, other units, garbage) yields `None` and the caller serves the
/// full body.
pub fn parse_range(value: &str) -> Option<RangeSpec> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        return end.parse().ok().map(RangeSpec::Suffix);
    }

    let start: u64 = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some(RangeSpec::FromTo(start, end))
}

/// Resolve a parsed range against a file of `size` bytes.
pub fn resolve_range(range: Option<RangeSpec>, size: u64) -> ResolvedRange {
    let Some(range) = range else {
        return ResolvedRange::Full;
    };
    if size == 0 {
        return ResolvedRange::Unsatisfiable;
    }

    match range {
        RangeSpec::FromTo(start, end) => {
            let end = end.unwrap_or(size - 1);
            if start > end || start >= size || end >= size {
                ResolvedRange::Unsatisfiable
            } else {
                ResolvedRange::Partial { start, end }
            }
        }
        RangeSpec::Suffix(0) => ResolvedRange::Unsatisfiable,
        RangeSpec::Suffix(n) => ResolvedRange::Partial {
            start: size.saturating_sub(n),
            end: size - 1,
        },
    }
}

/// Guess the MIME type of a source artifact from its extension.
pub fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "ts" => "video/mp2t",
        _ => "application/octet-stream",
    }
}

/// Stream `path`, honoring an optional `Range` header.
pub async fn serve_file(
    path: &FsPath,
    content_type: &'static str,
    range_header: Option<&str>,
    cache_control: Option<&'static str>,
) -> Result<Response, rv_core::Error> {
    let missing = || {
        rv_core::Error::not_found(
            "file",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )
    };

    let mut file = tokio::fs::File::open(path).await.map_err(|_| missing())?;
    let size = file.metadata().await?.len();

    let mut response = match resolve_range(range_header.and_then(parse_range), size) {
        ResolvedRange::Unsatisfiable => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [
                (header::CONTENT_RANGE, format!("bytes */{size}")),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            Body::empty(),
        )
            .into_response(),
        ResolvedRange::Partial { start, end } => {
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start)).await?;
            let body = Body::from_stream(ReaderStream::with_capacity(
                file.take(length),
                STREAM_BUFFER,
            ));
            (
                StatusCode::PARTIAL_CONTENT,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}")),
                    (header::CONTENT_LENGTH, length.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                body,
            )
                .into_response()
        }
        ResolvedRange::Full => {
            let body = Body::from_stream(ReaderStream::with_capacity(file, STREAM_BUFFER));
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (header::CONTENT_LENGTH, size.to_string()),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
                body,
            )
                .into_response()
        }
    };

    if let Some(cache_control) = cache_control {
        response
            .headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }
    Ok(response)
}

/// Segment names come from our own playlists: `seg00042.ts` style basenames.
fn is_segment_name(name: &str) -> bool {
    name.ends_with(".ts")
        && name.len() > 3
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn range_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::RANGE).and_then(|v| v.to_str().ok())
}

fn load_asset(ctx: &AppContext, raw_id: &str) -> Result<Asset, AppError> {
    let id: AssetId = parse_id(raw_id, "asset")?;
    let conn = rv_db::pool::get_conn(&ctx.db)?;
    let asset = rv_db::queries::assets::get_asset(&conn, id)?
        .ok_or_else(|| rv_core::Error::not_found("asset", id))?;
    Ok(asset)
}

fn artifact(path: Option<&PathBuf>, kind: &str, id: AssetId) -> Result<PathBuf, AppError> {
    path.cloned()
        .ok_or_else(|| rv_core::Error::not_found(kind, id).into())
}

/// GET /api/assets/{id}/source
#[utoipa::path(
    get,
    path = "/api/assets/{id}/source",
    params(
        ("id" = String, Path, description = "Asset ID"),
        ("Range" = Option<String>, Header, description = "Single byte range")
    ),
    responses(
        (status = 200, description = "Full source artifact"),
        (status = 206, description = "Requested byte range"),
        (status = 404, description = "Unknown asset", body = rv_core::api::ErrorBody),
        (status = 416, description = "Range not satisfiable")
    )
)]
pub async fn get_source(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let asset = load_asset(&ctx, &id)?;
    let content_type = guess_content_type(&asset.filename);
    Ok(serve_file(&asset.source_path, content_type, range_header(&headers), None).await?)
}

/// GET /api/assets/{id}/still.jpg
#[utoipa::path(
    get,
    path = "/api/assets/{id}/still.jpg",
    params(("id" = String, Path, description = "Asset ID")),
    responses(
        (status = 200, description = "Still image", content_type = "image/jpeg"),
        (status = 206, description = "Requested byte range"),
        (status = 404, description = "Unknown asset or not yet transcoded", body = rv_core::api::ErrorBody),
        (status = 416, description = "Range not satisfiable")
    )
)]
pub async fn get_still(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let asset = load_asset(&ctx, &id)?;
    let path = artifact(asset.still_path.as_ref(), "still", asset.id)?;
    Ok(serve_file(
        &path,
        "image/jpeg",
        range_header(&headers),
        Some(STILL_CACHE_CONTROL),
    )
    .await?)
}

/// GET /api/assets/{id}/hls/index.m3u8
#[utoipa::path(
    get,
    path = "/api/assets/{id}/hls/index.m3u8",
    params(("id" = String, Path, description = "Asset ID")),
    responses(
        (status = 200, description = "HLS VOD playlist", content_type = "application/vnd.apple.mpegurl"),
        (status = 206, description = "Requested byte range"),
        (status = 404, description = "Unknown asset or not yet transcoded", body = rv_core::api::ErrorBody),
        (status = 416, description = "Range not satisfiable")
    )
)]
pub async fn get_manifest(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let asset = load_asset(&ctx, &id)?;
    let path = artifact(asset.manifest_path.as_ref(), "manifest", asset.id)?;
    Ok(serve_file(
        &path,
        "application/vnd.apple.mpegurl",
        range_header(&headers),
        Some(MANIFEST_CACHE_CONTROL),
    )
    .await?)
}

/// GET /api/assets/{id}/hls/{segment}
#[utoipa::path(
    get,
    path = "/api/assets/{id}/hls/{segment}",
    params(
        ("id" = String, Path, description = "Asset ID"),
        ("segment" = String, Path, description = "Segment file name from the playlist")
    ),
    responses(
        (status = 200, description = "MPEG-TS segment", content_type = "video/mp2t"),
        (status = 206, description = "Requested byte range"),
        (status = 404, description = "Unknown asset or segment", body = rv_core::api::ErrorBody),
        (status = 416, description = "Range not satisfiable")
    )
)]
pub async fn get_segment(
    State(ctx): State<AppContext>,
    Path((id, segment)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let asset = load_asset(&ctx, &id)?;
    if !is_segment_name(&segment) {
        return Err(rv_core::Error::not_found("segment", &segment).into());
    }
    let manifest = artifact(asset.manifest_path.as_ref(), "manifest", asset.id)?;
    let Some(hls_dir) = manifest.parent() else {
        return Err(rv_core::Error::not_found("segment", &segment).into());
    };
    Ok(serve_file(
        &hls_dir.join(&segment),
        "video/mp2t",
        range_header(&headers),
        None,
    )
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_forms() {
        assert_eq!(parse_range("bytes=0-999"), Some(RangeSpec::FromTo(0, Some(999))));
        assert_eq!(parse_range("bytes=500-"), Some(RangeSpec::FromTo(500, None)));
        assert_eq!(parse_range("bytes=-200"), Some(RangeSpec::Suffix(200)));
        assert_eq!(parse_range(" bytes=10 - 20 "), Some(RangeSpec::FromTo(10, Some(20))));
    }

    #[test]
    fn parse_range_rejects_unsupported() {
        assert!(parse_range("invalid").is_none());
        assert!(parse_range("bytes=abc-def").is_none());
        assert!(parse_range("bytes=0-1,5-9").is_none());
        assert!(parse_range("items=0-1").is_none());
        assert!(parse_range("bytes=-").is_none());
        assert!(parse_range("bytes=5").is_none());
    }

    #[test]
    fn resolve_window() {
        assert_eq!(resolve_range(None, 1000), ResolvedRange::Full);
        assert_eq!(
            resolve_range(Some(RangeSpec::FromTo(0, Some(99))), 1000),
            ResolvedRange::Partial { start: 0, end: 99 }
        );
        assert_eq!(
            resolve_range(Some(RangeSpec::FromTo(900, None)), 1000),
            ResolvedRange::Partial { start: 900, end: 999 }
        );
        assert_eq!(
            resolve_range(Some(RangeSpec::Suffix(100)), 1000),
            ResolvedRange::Partial { start: 900, end: 999 }
        );
        assert_eq!(
            resolve_range(Some(RangeSpec::Suffix(5000)), 1000),
            ResolvedRange::Partial { start: 0, end: 999 }
        );
    }

    #[test]
    fn resolve_unsatisfiable() {
        let cases = [
            RangeSpec::FromTo(100, Some(99)),
            RangeSpec::FromTo(1000, None),
            RangeSpec::FromTo(0, Some(1000)),
            RangeSpec::Suffix(0),
        ];
        for case in cases {
            assert_eq!(resolve_range(Some(case), 1000), ResolvedRange::Unsatisfiable, "{case:?}");
        }
        assert_eq!(
            resolve_range(Some(RangeSpec::FromTo(0, None)), 0),
            ResolvedRange::Unsatisfiable
        );
    }

    #[test]
    fn segment_names() {
        assert!(is_segment_name("seg00001.ts"));
        assert!(!is_segment_name("../index.m3u8"));
        assert!(!is_segment_name("..ts"));
        assert!(!is_segment_name("a/b.ts"));
        assert!(!is_segment_name("index.m3u8"));
        assert!(!is_segment_name(".ts"));
    }

    #[test]
    fn content_types() {
        assert_eq!(guess_content_type("movie.MKV"), "video/x-matroska");
        assert_eq!(guess_content_type("movie.mp4"), "video/mp4");
        assert_eq!(guess_content_type("noext"), "application/octet-stream");
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    #[tokio::test]
    async fn serve_file_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let full = serve_file(&path, "video/mp4", None, None).await.unwrap();
        assert_eq!(full.status(), StatusCode::OK);
        assert_eq!(full.headers()[header::CONTENT_LENGTH], "1000");
        assert_eq!(body_bytes(full).await, data);

        let part = serve_file(&path, "video/mp4", Some("bytes=0-99"), None)
            .await
            .unwrap();
        assert_eq!(part.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(part.headers()[header::CONTENT_RANGE], "bytes 0-99/1000");
        assert_eq!(part.headers()[header::CONTENT_LENGTH], "100");
        assert_eq!(body_bytes(part).await, &data[..100]);

        let bad = serve_file(&path, "video/mp4", Some("bytes=1000-"), Some(STILL_CACHE_CONTROL))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(bad.headers()[header::CONTENT_RANGE], "bytes */1000");
        assert_eq!(bad.headers()[header::CACHE_CONTROL], STILL_CACHE_CONTROL);
        assert!(body_bytes(bad).await.is_empty());
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = serve_file(&dir.path().join("nope"), "video/mp4", None, None)
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }
}
