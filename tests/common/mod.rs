//! Shared test harness for integration tests.
//!
//! [`TestHarness`] builds a full [`AppContext`] over an in-memory DB and a
//! temporary data directory, runs the transcode dispatcher with a
//! [`FakeTranscoder`], and serves the router on a random local port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rv_av::transcode::{HLS_DIR, MANIFEST_FILE, STILL_FILE};
use rv_av::{ProgressSink, ToolRegistry, TranscodeOutput, TranscodeRequest, Transcoder};
use rv_core::api::{CompleteUploadResponse, StartUploadResponse};
use rv_core::config::Config;
use rv_core::{AssetId, AssetStatus};
use rv_db::pool::{init_memory_pool, DbPool};
use rv_server::context::AppContext;
use rv_server::router::build_router;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Bytes written as the fake segment.
pub const SEGMENT_BYTES: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Transcoder double that writes small artifacts instead of running ffmpeg.
#[derive(Default)]
pub struct FakeTranscoder {
    pub delay: Duration,
    pub fail: bool,
    pub calls: AtomicUsize,
    current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl FakeTranscoder {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        mut progress: ProgressSink,
        cancel: CancellationToken,
    ) -> rv_core::Result<TranscodeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        progress(0.5);
        tokio::select! {
            _ = tokio::time::sleep(self.delay) => {}
            _ = cancel.cancelled() => {}
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.fail {
            return Err(rv_core::Error::Tool {
                tool: "ffmpeg".into(),
                message: "exited with status 1: invalid data found".into(),
            });
        }

        let hls = request.output_dir.join(HLS_DIR);
        tokio::fs::create_dir_all(&hls).await?;
        let still = request.output_dir.join(STILL_FILE);
        let manifest = hls.join(MANIFEST_FILE);
        tokio::fs::write(&still, b"\xFF\xD8fake-jpeg\xFF\xD9").await?;
        tokio::fs::write(
            &manifest,
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-PLAYLIST-TYPE:VOD\n#EXTINF:6.0,\nseg00000.ts\n#EXT-X-ENDLIST\n",
        )
        .await?;
        tokio::fs::write(hls.join("seg00000.ts"), SEGMENT_BYTES).await?;
        progress(1.0);

        Ok(TranscodeOutput {
            still_path: still,
            manifest_path: manifest,
            duration_secs: Some(6.0),
        })
    }
}

/// Config tuned for tests: tiny chunks allowed, no rate limits, fast retries.
pub fn test_config(data_dir: PathBuf) -> Config {
    let mut config = Config::default();
    config.server.data_dir = data_dir.clone();
    config.server.db_path = data_dir.join("unused.db");
    config.upload.min_chunk_size = 1;
    config.upload.sweep_interval_secs = 3600;
    config.rate_limit.api_per_minute = 0;
    config.rate_limit.chunk_per_minute = 0;
    config.transcode.retry_base_delay_secs = 0;
    config.transcode.poll_interval_secs = 1;
    config
}

pub struct TestHarness {
    pub ctx: AppContext,
    pub db: DbPool,
    pub addr: SocketAddr,
    pub http: reqwest::Client,
    pub transcoder: Arc<FakeTranscoder>,
    cancel: CancellationToken,
    _data_dir: TempDir,
}

impl TestHarness {
    pub async fn start() -> Self {
        Self::start_with(|_| {}, FakeTranscoder::ok()).await
    }

    /// Start with a config tweak and a specific transcoder double.
    pub async fn start_with(tweak: impl FnOnce(&mut Config), transcoder: FakeTranscoder) -> Self {
        let data_dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = test_config(data_dir.path().to_path_buf());
        tweak(&mut config);
        rv_server::prepare_dirs(&config).expect("failed to prepare dirs");

        let db = init_memory_pool().expect("failed to create in-memory pool");
        let transcoder = Arc::new(transcoder);
        let ctx = AppContext::new(
            db.clone(),
            config,
            Arc::new(ToolRegistry::default()),
            transcoder.clone(),
        );

        let cancel = CancellationToken::new();
        let queue = ctx.queue.clone();
        let queue_cancel = cancel.clone();
        tokio::spawn(async move { queue.run(queue_cancel).await });

        let app = build_router(ctx.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");
        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await
                .ok();
        });

        Self {
            ctx,
            db,
            addr,
            http: reqwest::Client::new(),
            transcoder,
            cancel,
            _data_dir: data_dir,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.ctx.config.server.data_dir.clone()
    }

    /// Get a database connection from the pool. Drop it before awaiting.
    pub fn conn(&self) -> rv_db::pool::PooledConnection {
        rv_db::pool::get_conn(&self.db).expect("failed to get db connection")
    }

    pub async fn start_upload(&self, filename: &str, size: u64, chunk: u64) -> StartUploadResponse {
        let resp = self
            .http
            .post(self.url("/api/uploads"))
            .json(&serde_json::json!({
                "filename": filename,
                "fileSize": size,
                "chunkSize": chunk,
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    pub async fn put_chunk(&self, session: &str, index: u32, data: &[u8]) -> reqwest::Response {
        self.http
            .put(self.url(&format!("/api/uploads/{session}/chunks/{index}")))
            .body(data.to_vec())
            .send()
            .await
            .unwrap()
    }

    pub async fn complete(&self, session: &str) -> reqwest::Response {
        self.http
            .post(self.url(&format!("/api/uploads/{session}/complete")))
            .send()
            .await
            .unwrap()
    }

    /// Upload `data` in order and complete it.
    pub async fn upload(&self, filename: &str, data: &[u8], chunk: u64) -> CompleteUploadResponse {
        let started = self.start_upload(filename, data.len() as u64, chunk).await;
        let session = started.session_id.to_string();
        for (i, part) in data.chunks(chunk as usize).enumerate() {
            let resp = self.put_chunk(&session, i as u32, part).await;
            assert_eq!(resp.status(), 200);
        }
        let resp = self.complete(&session).await;
        assert_eq!(resp.status(), 200);
        resp.json().await.unwrap()
    }

    /// Poll until the asset leaves `processing`.
    pub async fn wait_for_terminal(&self, id: AssetId) -> rv_db::models::Asset {
        for _ in 0..500 {
            let asset = {
                let conn = self.conn();
                rv_db::queries::assets::get_asset(&conn, id)
                    .unwrap()
                    .expect("asset should exist")
            };
            if matches!(asset.status, AssetStatus::Ready | AssetStatus::Error) {
                return asset;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("asset {id} did not reach a terminal state");
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
