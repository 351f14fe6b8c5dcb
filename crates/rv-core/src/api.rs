//! JSON request and response bodies of the HTTP API.
//!
//! Shared by the server routes and the upload client so both sides agree on
//! field names. Fields are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::{AssetId, AssetStatus, SessionId, SessionStatus};

/// Body of `POST /api/uploads`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadRequest {
    pub filename: String,
    pub file_size: u64,
    /// Server default when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartUploadResponse {
    #[schema(value_type = String)]
    pub session_id: SessionId,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub expires_at: DateTime<Utc>,
}

/// Acknowledgement of one accepted chunk.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAcceptedResponse {
    pub chunk_index: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub progress_percent: f64,
}

/// Current server-side view of an upload session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    #[schema(value_type = String)]
    pub session_id: SessionId,
    pub filename: String,
    pub status: SessionStatus,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    pub accepted_chunks: Vec<u32>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    #[schema(value_type = String)]
    pub asset_id: AssetId,
    pub status: AssetStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadResponse {
    #[schema(value_type = String)]
    pub session_id: SessionId,
    pub cancelled: bool,
}

/// Delivery URLs of an asset. Derived artifacts are absent until ready.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssetUrls {
    pub source: String,
    pub still: Option<String>,
    pub manifest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssetResponse {
    #[schema(value_type = String)]
    pub id: AssetId,
    pub title: String,
    pub year: Option<i32>,
    pub filename: String,
    pub status: AssetStatus,
    pub size_bytes: u64,
    pub duration_secs: Option<f64>,
    pub progress_percent: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub urls: AssetUrls,
}

/// JSON body of every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
    #[serde(default)]
    pub request_id: Option<String>,
    /// Missing chunk indices, only for `incomplete_upload`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<u32>>,
}

/// Percentage with one decimal of precision; 0 for an empty total.
pub fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let pct = done as f64 * 100.0 / total as f64;
    (pct * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_request_is_camel_case() {
        let req: StartUploadRequest =
            serde_json::from_str(r#"{"filename":"a.mp4","fileSize":42,"chunkSize":8}"#).unwrap();
        assert_eq!(req.file_size, 42);
        assert_eq!(req.chunk_size, Some(8));
        assert!(req.title.is_none());
    }

    #[test]
    fn complete_response_shape() {
        let resp = CompleteUploadResponse {
            asset_id: AssetId::new(),
            status: AssetStatus::Processing,
        };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["status"], "processing");
        assert!(value.get("assetId").is_some());
    }

    #[test]
    fn percent_rounds() {
        assert_eq!(percent(1, 3), 33.3);
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(10, 10), 100.0);
    }
}
