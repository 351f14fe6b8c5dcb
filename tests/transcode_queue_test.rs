//! Transcode admission control driven by real uploads.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{payload, FakeTranscoder, TestHarness};
use rv_core::{AssetStatus, JobState};
use rv_db::queries::transcode_jobs;
use serde_json::Value;

#[tokio::test]
async fn concurrent_transcodes_stay_within_capacity() {
    let h = TestHarness::start_with(
        |c| c.transcode.max_concurrent = 2,
        FakeTranscoder::slow(Duration::from_millis(200)),
    )
    .await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let done = h.upload(&format!("movie{i}.mp4"), &payload(100), 50).await;
        ids.push(done.asset_id);
    }

    for id in ids {
        let asset = h.wait_for_terminal(id).await;
        assert_eq!(asset.status, AssetStatus::Ready);
        assert_eq!(asset.progress_pct, 100.0);
        assert!(asset.still_path.is_some());
        assert!(asset.manifest_path.is_some());
    }

    let peak = h.transcoder.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "peak concurrency was {peak}");
    assert!(peak >= 1);
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn failures_retry_then_mark_the_asset() {
    let h = TestHarness::start_with(
        |c| c.transcode.max_attempts = 2,
        FakeTranscoder::failing(),
    )
    .await;

    let done = h.upload("broken.mkv", &payload(64), 64).await;
    let asset = h.wait_for_terminal(done.asset_id).await;

    assert_eq!(asset.status, AssetStatus::Error);
    let message = asset.error.unwrap_or_default();
    assert!(
        message.starts_with("transcode failed after 2 attempts"),
        "{message}"
    );
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 2);

    let (active, failed) = {
        let conn = h.conn();
        (
            transcode_jobs::count_in_state(&conn, JobState::Active).unwrap(),
            transcode_jobs::list_jobs_in_state(&conn, JobState::Failed).unwrap(),
        )
    };
    assert_eq!(active, 0);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);
    assert_eq!(failed[0].asset_id, done.asset_id);
    assert!(failed[0].error.is_some());

    // The failure is visible through the catalog.
    let body: Value = h
        .http
        .get(h.url(&format!("/api/assets/{}", done.asset_id)))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "error");
    assert!(body["urls"]["manifest"].is_null());
    assert!(body["error"].as_str().unwrap().contains("ffmpeg"));
}

#[tokio::test]
async fn catalog_lists_and_filters_assets() {
    let h = TestHarness::start().await;
    let first = h.upload("alpha.mp4", &payload(10), 10).await;
    let second = h.upload("beta.mp4", &payload(10), 10).await;
    h.wait_for_terminal(first.asset_id).await;
    h.wait_for_terminal(second.asset_id).await;

    let all: Value = h
        .http
        .get(h.url("/api/assets"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all.as_array().unwrap().len(), 2);

    let ready: Value = h
        .http
        .get(h.url("/api/assets?status=ready&limit=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ready = ready.as_array().unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0]["status"], "ready");
    let id = ready[0]["id"].as_str().unwrap();
    assert_eq!(
        ready[0]["urls"]["manifest"],
        format!("/api/assets/{id}/hls/index.m3u8")
    );

    let none: Value = h
        .http
        .get(h.url("/api/assets?status=error"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(none.as_array().unwrap().is_empty());
}
