//! Bounded-concurrency transcode admission queue.
//!
//! Jobs live in the `transcode_jobs` table and are dispatched in insertion
//! order. The dispatcher only claims a job while holding one of K semaphore
//! permits, and the permit moves into the job task, so at most K external
//! processes run at any time. A wakeup from [`TranscodeQueue::wake`], the
//! poll interval, or the next retry deadline triggers another claim attempt.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rv_av::{ProgressSink, TranscodeOutput, TranscodeRequest, Transcoder};
use rv_core::config::TranscodeConfig;
use rv_core::{AssetId, Error, Result, TranscodeJobId};
use rv_db::models::TranscodeJob;
use rv_db::pool::{get_conn, DbPool};
use rv_db::queries::{assets, transcode_jobs};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Smallest sleep between claim attempts while idle.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(10);

pub struct TranscodeQueue {
    db: DbPool,
    config: TranscodeConfig,
    transcoder: Arc<dyn Transcoder>,
    permits: Arc<Semaphore>,
    wake: Arc<Notify>,
    running: Mutex<HashSet<TranscodeJobId>>,
    worker_id: String,
}

impl TranscodeQueue {
    pub fn new(db: DbPool, config: TranscodeConfig, transcoder: Arc<dyn Transcoder>) -> Self {
        let workers = config.worker_count();
        Self {
            db,
            config,
            transcoder,
            permits: Arc::new(Semaphore::new(workers)),
            wake: Arc::new(Notify::new()),
            running: Mutex::new(HashSet::new()),
            worker_id: format!("rv-transcode-{}", std::process::id()),
        }
    }

    /// Handle other components use to wake the dispatcher.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Settle jobs a crashed process left `active`. Returns how many went
    /// back to the queue.
    pub fn recover(&self) -> Result<usize> {
        let report = transcode_jobs::reset_orphaned_jobs(&*get_conn(&self.db)?)?;
        if report.failed > 0 {
            tracing::warn!(
                "Failed {} transcode job(s) interrupted on their last attempt",
                report.failed
            );
        }
        if report.requeued > 0 {
            tracing::warn!(
                "Re-queued {} transcode job(s) interrupted by a restart",
                report.requeued
            );
        }
        Ok(report.requeued)
    }

    /// Jobs currently holding a permit.
    pub fn active_jobs(&self) -> Vec<TranscodeJobId> {
        self.running.lock().iter().copied().collect()
    }

    /// Dispatcher loop. Runs until `cancel` fires, then cancels running
    /// jobs and waits for them to hand their rows back.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            "Transcode dispatcher started ({} concurrent)",
            self.config.worker_count()
        );
        let tracker = TaskTracker::new();

        loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => break,
            };

            match self.claim() {
                Ok(Some(job)) => {
                    let queue = self.clone();
                    let job_cancel = cancel.child_token();
                    tracker.spawn(async move {
                        queue.run_job(job, permit, job_cancel).await;
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to claim transcode job: {e}"),
            }
            drop(permit);

            let wait = self.idle_wait();
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => break,
            }
        }

        tracker.close();
        tracker.wait().await;
        tracing::info!("Transcode dispatcher stopped");
    }

    fn claim(&self) -> Result<Option<TranscodeJob>> {
        let conn = get_conn(&self.db)?;
        transcode_jobs::claim_next_job(&conn, &self.worker_id, Utc::now())
    }

    /// How long to sleep when nothing is due: until the earliest retry, but
    /// never longer than the poll interval.
    fn idle_wait(&self) -> Duration {
        let poll = self.config.poll_interval();
        let next_due = get_conn(&self.db).and_then(|conn| transcode_jobs::next_due_at(&conn));
        match next_due {
            Ok(Some(at)) => (at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_IDLE_WAIT, poll),
            _ => poll,
        }
    }

    async fn run_job(
        self: Arc<Self>,
        job: TranscodeJob,
        _permit: OwnedSemaphorePermit,
        cancel: CancellationToken,
    ) {
        let job_id = job.id;
        self.running.lock().insert(job_id);
        tracing::info!(
            job_id = %job_id,
            asset_id = %job.asset_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Transcode started"
        );

        let request = TranscodeRequest {
            input: job.input_path.clone(),
            output_dir: job.output_dir.clone(),
        };
        let progress = progress_sink(self.db.clone(), job_id, job.asset_id);
        let result = self
            .transcoder
            .transcode(&request, progress, cancel.clone())
            .await;

        let settled = match result {
            Ok(output) => self.succeed(&job, &output),
            Err(e) if cancel.is_cancelled() => {
                tracing::info!(job_id = %job_id, "Transcode interrupted by shutdown: {e}");
                get_conn(&self.db)
                    .and_then(|conn| transcode_jobs::release_job(&conn, job_id))
                    .map(|_| ())
            }
            Err(e) => self.fail(&job, &e),
        };
        if let Err(e) = settled {
            tracing::error!(job_id = %job_id, "Failed to record transcode outcome: {e}");
        }

        self.running.lock().remove(&job_id);
        // The permit drops with this task; let the dispatcher claim again.
        self.wake();
    }

    fn succeed(&self, job: &TranscodeJob, output: &TranscodeOutput) -> Result<()> {
        let conn = get_conn(&self.db)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;
        transcode_jobs::complete_job(&tx, job.id)?;
        assets::mark_ready(
            &tx,
            job.asset_id,
            &output.still_path,
            &output.manifest_path,
            output.duration_secs,
        )?;
        tx.commit().map_err(|e| Error::database(e.to_string()))?;

        tracing::info!(job_id = %job.id, asset_id = %job.asset_id, "Transcode succeeded");
        Ok(())
    }

    fn fail(&self, job: &TranscodeJob, error: &Error) -> Result<()> {
        let message = error.to_string();
        let conn = get_conn(&self.db)?;

        if job.has_attempts_left() {
            let delay = self.config.retry_delay(job.attempts);
            transcode_jobs::requeue_job(&conn, job.id, &message, Utc::now() + delay)?;
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempts,
                retry_in_secs = delay.num_seconds(),
                "Transcode failed, will retry: {message}"
            );
            return Ok(());
        }

        let detail = format!("transcode failed after {} attempts: {message}", job.attempts);
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;
        transcode_jobs::fail_job(&tx, job.id, &message)?;
        assets::mark_error(&tx, job.asset_id, &detail)?;
        tx.commit().map_err(|e| Error::database(e.to_string()))?;

        tracing::error!(job_id = %job.id, asset_id = %job.asset_id, "{detail}");
        Ok(())
    }
}

/// Persist progress on whole-percent steps.
fn progress_sink(db: DbPool, job_id: TranscodeJobId, asset_id: AssetId) -> ProgressSink {
    let mut last = 0.0_f64;
    Box::new(move |fraction: f64| {
        let pct = (fraction.clamp(0.0, 1.0) * 1000.0).round() / 10.0;
        if pct - last < 1.0 && pct < 100.0 {
            return;
        }
        last = pct;
        let written = get_conn(&db).and_then(|conn| {
            transcode_jobs::update_job_progress(&conn, job_id, pct)?;
            assets::update_progress(&conn, asset_id, pct)
        });
        if let Err(e) = written {
            tracing::debug!(job_id = %job_id, "Failed to record progress: {e}");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rv_core::{AssetStatus, JobState};
    use rv_db::queries::assets::NewAsset;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Sleeps, tracks peak concurrency and optionally fails.
    #[derive(Default)]
    struct FakeTranscoder {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn transcode(
            &self,
            request: &TranscodeRequest,
            mut progress: ProgressSink,
            cancel: CancellationToken,
        ) -> Result<TranscodeOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            progress(0.5);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                _ = cancel.cancelled() => {}
            }
            self.current.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(Error::tool("ffmpeg", "exited with status 1: boom"));
            }
            Ok(TranscodeOutput {
                still_path: request.output_dir.join("still.jpg"),
                manifest_path: request.output_dir.join("hls/index.m3u8"),
                duration_secs: Some(12.0),
            })
        }
    }

    fn config(max_concurrent: usize, max_attempts: u32) -> TranscodeConfig {
        TranscodeConfig {
            max_concurrent,
            max_attempts,
            retry_base_delay_secs: 0,
            poll_interval_secs: 1,
            ..TranscodeConfig::default()
        }
    }

    fn seed(queue: &TranscodeQueue, db: &DbPool) -> AssetId {
        let id = AssetId::new();
        let src = PathBuf::from(format!("/media/{id}/source.mp4"));
        assets::create_asset(
            &get_conn(db).unwrap(),
            &NewAsset {
                id,
                title: "t",
                year: None,
                filename: "t.mp4",
                source_path: &src,
                size_bytes: 1,
            },
        )
        .unwrap();
        transcode_jobs::enqueue_job(
            &get_conn(db).unwrap(),
            id,
            &src,
            Path::new(&format!("/media/{id}")),
            queue.config.attempt_budget(),
        )
        .unwrap();
        queue.wake();
        id
    }

    async fn wait_for(db: &DbPool, state: JobState, n: i64) {
        for _ in 0..500 {
            let count = transcode_jobs::count_in_state(&get_conn(db).unwrap(), state).unwrap();
            if count == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {n} job(s) in {state}");
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let db = rv_db::pool::init_memory_pool().unwrap();
        let fake = Arc::new(FakeTranscoder::default());
        let queue = Arc::new(TranscodeQueue::new(db.clone(), config(2, 3), fake.clone()));

        let ids: Vec<AssetId> = (0..6).map(|_| seed(&queue, &db)).collect();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(cancel.clone()));
        wait_for(&db, JobState::Succeeded, 6).await;

        assert_eq!(fake.peak.load(Ordering::SeqCst), 2);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 6);
        for id in ids {
            let asset = assets::get_asset(&get_conn(&db).unwrap(), id).unwrap().unwrap();
            assert_eq!(asset.status, AssetStatus::Ready);
            assert_eq!(asset.duration_secs, Some(12.0));
        }

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_retries_mark_asset_error() {
        let db = rv_db::pool::init_memory_pool().unwrap();
        let fake = Arc::new(FakeTranscoder {
            fail: true,
            ..Default::default()
        });
        let queue = Arc::new(TranscodeQueue::new(db.clone(), config(1, 3), fake.clone()));
        let id = seed(&queue, &db);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(cancel.clone()));
        wait_for(&db, JobState::Failed, 1).await;

        let conn = get_conn(&db).unwrap();
        assert_eq!(transcode_jobs::count_in_state(&conn, JobState::Active).unwrap(), 0);
        let asset = assets::get_asset(&conn, id).unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::Error);
        let message = asset.error.unwrap();
        assert!(message.starts_with("transcode failed after 3 attempts"), "{message}");
        drop(conn);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn recover_requeues_orphans() {
        let db = rv_db::pool::init_memory_pool().unwrap();
        let queue = TranscodeQueue::new(db.clone(), config(1, 3), Arc::new(FakeTranscoder::default()));
        seed(&queue, &db);
        transcode_jobs::claim_next_job(&get_conn(&db).unwrap(), "old", Utc::now())
            .unwrap()
            .unwrap();

        assert_eq!(queue.recover().unwrap(), 1);
        let conn = get_conn(&db).unwrap();
        assert_eq!(transcode_jobs::count_in_state(&conn, JobState::Queued).unwrap(), 1);
    }

    #[tokio::test]
    async fn recover_does_not_exceed_attempt_budget() {
        let db = rv_db::pool::init_memory_pool().unwrap();
        let fake = Arc::new(FakeTranscoder::default());
        let queue = Arc::new(TranscodeQueue::new(db.clone(), config(1, 1), fake.clone()));
        let id = seed(&queue, &db);
        transcode_jobs::claim_next_job(&get_conn(&db).unwrap(), "old", Utc::now())
            .unwrap()
            .unwrap();

        assert_eq!(queue.recover().unwrap(), 0);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(queue.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
        let conn = get_conn(&db).unwrap();
        assert_eq!(transcode_jobs::count_in_state(&conn, JobState::Failed).unwrap(), 1);
        let asset = assets::get_asset(&conn, id).unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::Error);
    }

    #[test]
    fn progress_sink_rounds_to_tenths() {
        let db = rv_db::pool::init_memory_pool().unwrap();
        let queue = TranscodeQueue::new(db.clone(), config(1, 3), Arc::new(FakeTranscoder::default()));
        let asset_id = seed(&queue, &db);
        let job = transcode_jobs::claim_next_job(&get_conn(&db).unwrap(), "w", Utc::now())
            .unwrap()
            .unwrap();

        let mut sink = progress_sink(db.clone(), job.id, asset_id);
        sink(0.4567);
        let asset = assets::get_asset(&get_conn(&db).unwrap(), asset_id).unwrap().unwrap();
        assert_eq!(asset.progress_pct, 45.7);
    }
}
