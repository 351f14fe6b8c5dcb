//! Upload endpoints as a trait, plus the reqwest implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use rv_core::api::{
    ChunkAcceptedResponse, CompleteUploadResponse, ErrorBody, StartUploadRequest,
    StartUploadResponse, UploadStatusResponse,
};
use rv_core::SessionId;
use serde::de::DeserializeOwned;

use crate::error::{ClientError, Result};

/// The server operations an upload needs.
#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn start_session(&self, request: &StartUploadRequest) -> Result<StartUploadResponse>;

    async fn session_status(&self, id: SessionId) -> Result<UploadStatusResponse>;

    async fn put_chunk(&self, id: SessionId, index: u32, data: Bytes)
        -> Result<ChunkAcceptedResponse>;

    async fn complete_session(&self, id: SessionId) -> Result<CompleteUploadResponse>;

    /// Idempotent on the server.
    async fn cancel_session(&self, id: SessionId) -> Result<()>;
}

/// [`UploadApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: Client,
    base_url: String,
}

impl HttpUploadApi {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        Err(Self::failure(response).await)
    }

    async fn failure(response: Response) -> ClientError {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.json::<ErrorBody>().await.ok();
        ClientError::from_response(status, body, retry_after)
    }
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn start_session(&self, request: &StartUploadRequest) -> Result<StartUploadResponse> {
        let response = self
            .client
            .post(self.url("/uploads"))
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn session_status(&self, id: SessionId) -> Result<UploadStatusResponse> {
        let response = self
            .client
            .get(self.url(&format!("/uploads/{id}")))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn put_chunk(
        &self,
        id: SessionId,
        index: u32,
        data: Bytes,
    ) -> Result<ChunkAcceptedResponse> {
        let response = self
            .client
            .put(self.url(&format!("/uploads/{id}/chunks/{index}")))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn complete_session(&self, id: SessionId) -> Result<CompleteUploadResponse> {
        let response = self
            .client
            .post(self.url(&format!("/uploads/{id}/complete")))
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn cancel_session(&self, id: SessionId) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/uploads/{id}")))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::failure(response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api(server: &MockServer) -> HttpUploadApi {
        HttpUploadApi::new(&format!("{}/", server.uri()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn start_session_decodes_camel_case() {
        let server = MockServer::start().await;
        let id = SessionId::new();
        Mock::given(method("POST"))
            .and(path("/api/uploads"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "sessionId": id.to_string(),
                "chunkSize": 4,
                "totalChunks": 3,
                "expiresAt": "2030-01-01T00:00:00Z"
            })))
            .mount(&server)
            .await;

        let started = api(&server)
            .start_session(&StartUploadRequest {
                filename: "a.mp4".into(),
                file_size: 10,
                chunk_size: Some(4),
                title: None,
                year: None,
            })
            .await
            .unwrap();
        assert_eq!(started.session_id, id);
        assert_eq!(started.total_chunks, 3);
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        let id = SessionId::new();
        Mock::given(method("PUT"))
            .and(path(format!("/api/uploads/{id}/chunks/0")))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "7")
                    .set_body_json(serde_json::json!({
                        "error": "Rate limit exceeded",
                        "code": "rate_limited",
                        "request_id": null
                    })),
            )
            .mount(&server)
            .await;

        let err = api(&server)
            .put_chunk(id, 0, Bytes::from_static(b"data"))
            .await
            .unwrap_err();
        match err {
            ClientError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn gone_session_maps_to_expired() {
        let server = MockServer::start().await;
        let id = SessionId::new();
        Mock::given(method("POST"))
            .and(path(format!("/api/uploads/{id}/complete")))
            .respond_with(ResponseTemplate::new(410).set_body_json(serde_json::json!({
                "error": "upload session expired",
                "code": "session_expired",
                "request_id": "r"
            })))
            .mount(&server)
            .await;

        let err = api(&server).complete_session(id).await.unwrap_err();
        assert!(matches!(err, ClientError::SessionExpired(_)));
    }
}
