//! Upload controller: bounded chunk pool with pause, resume and cancel.
//!
//! A run transfers every unacknowledged chunk through at most
//! `concurrency` simultaneous requests. Each run is a batch identified by a
//! generation number and guarded by a [`CancellationToken`]. Pausing cancels
//! the token and bumps the generation, so acknowledgements that arrive for
//! the old batch are dropped instead of committed. The local state file is
//! updated after every committed acknowledgement, and the server's view is
//! authoritative whenever an upload is restored.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use rv_core::api::{percent, CompleteUploadResponse, StartUploadRequest};
use rv_core::{ChunkPlan, SessionId};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{watch, OnceCell};
use tokio_util::sync::CancellationToken;

use crate::api::UploadApi;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use crate::state::{upload_id_for, ClientStateStore, ClientUploadState};

/// Optional fields of a new upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub title: Option<String>,
    pub year: Option<i32>,
    /// Server default when `None`.
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Paused,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Snapshot published on the progress channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub phase: UploadPhase,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        percent(self.uploaded_bytes, self.total_bytes)
    }
}

/// How a call to [`UploadController::run`] ended without error.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(CompleteUploadResponse),
    /// The batch was paused or superseded before every chunk landed.
    Paused,
}

enum ChunkOutcome {
    Acked,
    Interrupted,
    Failed(ClientError),
}

struct Batch {
    token: CancellationToken,
    generation: u64,
    phase: UploadPhase,
}

pub struct UploadController {
    api: Arc<dyn UploadApi>,
    store: Arc<ClientStateStore>,
    retry: RetryPolicy,
    concurrency: usize,
    upload_id: String,
    session_id: SessionId,
    source_path: PathBuf,
    plan: ChunkPlan,
    batch: Mutex<Batch>,
    progress: watch::Sender<Progress>,
    completion: OnceCell<CompleteUploadResponse>,
}

impl UploadController {
    /// Open a server session for `path` and record it locally.
    pub async fn start(
        api: Arc<dyn UploadApi>,
        store: Arc<ClientStateStore>,
        config: &ClientConfig,
        path: &Path,
        options: UploadOptions,
    ) -> Result<Self> {
        let upload_id = upload_id_for(path)?;
        if store.get(&upload_id).is_some() {
            return Err(ClientError::State(format!(
                "{} already has an upload in progress ({upload_id}); resume it instead",
                path.display()
            )));
        }

        let file_size = tokio::fs::metadata(path).await?.len();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ClientError::State(format!("{} has no file name", path.display())))?;

        let started = api
            .start_session(&StartUploadRequest {
                filename,
                file_size,
                chunk_size: options.chunk_size,
                title: options.title,
                year: options.year,
            })
            .await?;

        let state = ClientUploadState {
            session_id: started.session_id,
            source_path: path.to_path_buf(),
            file_size,
            chunk_size: started.chunk_size,
            total_chunks: started.total_chunks,
            accepted_chunks: Default::default(),
        };
        store.put(&upload_id, state.clone());
        store.save().await?;

        tracing::info!(
            upload_id = %upload_id,
            session_id = %state.session_id,
            total_chunks = state.total_chunks,
            "Upload session started"
        );
        Ok(Self::from_state(api, store, config, upload_id, &state))
    }

    /// Reload a recorded upload and reconcile it with the server.
    ///
    /// A session the server no longer knows is removed from local state and
    /// the server error is returned.
    pub async fn restore(
        api: Arc<dyn UploadApi>,
        store: Arc<ClientStateStore>,
        config: &ClientConfig,
        upload_id: &str,
    ) -> Result<Self> {
        let mut state = store
            .get(upload_id)
            .ok_or_else(|| ClientError::State(format!("no recorded upload {upload_id}")))?;

        let status = match api.session_status(state.session_id).await {
            Ok(status) => status,
            Err(e @ (ClientError::SessionNotFound(_) | ClientError::SessionExpired(_))) => {
                store.remove(upload_id);
                store.save().await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let size_now = tokio::fs::metadata(&state.source_path).await?.len();
        if size_now != state.file_size || status.total_bytes != state.file_size {
            return Err(ClientError::State(format!(
                "{} changed since the upload started",
                state.source_path.display()
            )));
        }

        state.accepted_chunks = status
            .accepted_chunks
            .into_iter()
            .filter(|i| *i < state.total_chunks)
            .collect();
        store.put(upload_id, state.clone());
        store.save().await?;

        tracing::info!(
            upload_id = %upload_id,
            session_id = %state.session_id,
            accepted = state.accepted_chunks.len(),
            total_chunks = state.total_chunks,
            "Upload restored"
        );
        Ok(Self::from_state(api, store, config, upload_id.to_string(), &state))
    }

    fn from_state(
        api: Arc<dyn UploadApi>,
        store: Arc<ClientStateStore>,
        config: &ClientConfig,
        upload_id: String,
        state: &ClientUploadState,
    ) -> Self {
        let (progress, _) = watch::channel(Progress {
            uploaded_bytes: state.acknowledged_bytes(),
            total_bytes: state.file_size,
            phase: UploadPhase::Paused,
        });
        Self {
            api,
            store,
            retry: config.retry_policy(),
            concurrency: config.worker_count(),
            upload_id,
            session_id: state.session_id,
            source_path: state.source_path.clone(),
            plan: state.plan(),
            batch: Mutex::new(Batch {
                token: CancellationToken::new(),
                generation: 0,
                phase: UploadPhase::Paused,
            }),
            progress,
            completion: OnceCell::new(),
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn phase(&self) -> UploadPhase {
        self.batch.lock().phase
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Chunks not yet acknowledged, ascending.
    pub fn pending_chunks(&self) -> Vec<u32> {
        self.store
            .get(&self.upload_id)
            .map(|s| s.pending())
            .unwrap_or_default()
    }

    /// Transfer every pending chunk, then complete the session.
    ///
    /// Returns [`RunOutcome::Paused`] if [`pause`](Self::pause) interrupts
    /// the batch. Any non-retryable error fails the upload; local state is
    /// kept so it can be resumed later.
    pub async fn run(&self) -> Result<RunOutcome> {
        if let Some(done) = self.completion.get() {
            return Ok(RunOutcome::Completed(done.clone()));
        }

        let (token, generation) = {
            let mut batch = self.batch.lock();
            if batch.phase == UploadPhase::Cancelled {
                return Err(ClientError::State("upload was cancelled".into()));
            }
            batch.token.cancel();
            batch.token = CancellationToken::new();
            batch.generation += 1;
            batch.phase = UploadPhase::Running;
            (batch.token.clone(), batch.generation)
        };
        self.publish(UploadPhase::Running);

        let pending = self.pending_chunks();
        tracing::debug!(
            upload_id = %self.upload_id,
            generation,
            pending = pending.len(),
            "Starting chunk batch"
        );

        let mut results = stream::iter(pending)
            .map(|index| {
                let token = token.clone();
                async move { (index, self.transfer(index, token).await) }
            })
            .buffer_unordered(self.concurrency);

        while let Some((index, outcome)) = results.next().await {
            match outcome {
                ChunkOutcome::Acked => {
                    if !self.commit(index, generation).await? {
                        break;
                    }
                }
                ChunkOutcome::Interrupted => {}
                ChunkOutcome::Failed(e) => {
                    token.cancel();
                    self.set_phase_if_current(generation, UploadPhase::Failed);
                    tracing::warn!(
                        upload_id = %self.upload_id,
                        chunk = index,
                        error = %e,
                        "Chunk transfer failed"
                    );
                    return Err(e);
                }
            }
        }
        drop(results);

        if token.is_cancelled() || self.batch.lock().generation != generation {
            return Ok(RunOutcome::Paused);
        }

        let done = self
            .store
            .get(&self.upload_id)
            .map(|s| s.is_fully_acknowledged())
            .unwrap_or(false);
        if !done {
            self.set_phase_if_current(generation, UploadPhase::Failed);
            return Err(ClientError::IncompleteUpload {
                missing: self.pending_chunks(),
            });
        }

        match self.finish().await {
            Ok(response) => Ok(RunOutcome::Completed(response)),
            Err(e) => {
                self.set_phase_if_current(generation, UploadPhase::Failed);
                Err(e)
            }
        }
    }

    /// Stop the current batch. Acknowledged chunks stay committed.
    pub fn pause(&self) {
        let mut batch = self.batch.lock();
        if batch.phase != UploadPhase::Running {
            return;
        }
        batch.token.cancel();
        batch.generation += 1;
        batch.phase = UploadPhase::Paused;
        drop(batch);
        self.publish(UploadPhase::Paused);
        tracing::info!(upload_id = %self.upload_id, "Upload paused");
    }

    /// Start a new batch over the chunks still pending.
    pub async fn resume(&self) -> Result<RunOutcome> {
        tracing::info!(upload_id = %self.upload_id, "Upload resumed");
        self.run().await
    }

    /// Abort the batch, cancel the server session and forget local state.
    pub async fn cancel(&self) -> Result<()> {
        {
            let mut batch = self.batch.lock();
            batch.token.cancel();
            batch.generation += 1;
            batch.phase = UploadPhase::Cancelled;
        }
        self.publish(UploadPhase::Cancelled);

        match self.api.cancel_session(self.session_id).await {
            Ok(()) | Err(ClientError::SessionNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.remove(&self.upload_id);
        self.store.save().await?;
        tracing::info!(upload_id = %self.upload_id, "Upload cancelled");
        Ok(())
    }

    /// Complete the session exactly once, however many callers race here.
    async fn finish(&self) -> Result<CompleteUploadResponse> {
        let response = self
            .completion
            .get_or_try_init(|| async {
                let response = self.api.complete_session(self.session_id).await?;
                self.store.remove(&self.upload_id);
                self.store.save().await?;
                tracing::info!(
                    upload_id = %self.upload_id,
                    asset_id = %response.asset_id,
                    "Upload complete"
                );
                Ok::<_, ClientError>(response)
            })
            .await?
            .clone();

        self.batch.lock().phase = UploadPhase::Completed;
        self.publish(UploadPhase::Completed);
        Ok(response)
    }

    async fn transfer(&self, index: u32, token: CancellationToken) -> ChunkOutcome {
        if token.is_cancelled() {
            return ChunkOutcome::Interrupted;
        }

        let work = async {
            let data = read_slice(&self.source_path, &self.plan, index).await?;
            self.retry
                .run(|_| self.api.put_chunk(self.session_id, index, data.clone()))
                .await
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => ChunkOutcome::Interrupted,
            result = work => match result {
                Ok(_) => ChunkOutcome::Acked,
                Err(e) => ChunkOutcome::Failed(e),
            },
        }
    }

    /// Record an acknowledgement if its batch is still current.
    ///
    /// Returns false when the batch has been superseded.
    async fn commit(&self, index: u32, generation: u64) -> Result<bool> {
        {
            let batch = self.batch.lock();
            if batch.generation != generation {
                return Ok(false);
            }
            self.store.record_chunk(&self.upload_id, index);
        }
        self.store.save().await?;

        let uploaded = self
            .store
            .get(&self.upload_id)
            .map(|s| s.acknowledged_bytes())
            .unwrap_or(0);
        self.progress.send_modify(|p| {
            p.uploaded_bytes = p.uploaded_bytes.max(uploaded);
        });
        Ok(true)
    }

    fn set_phase_if_current(&self, generation: u64, phase: UploadPhase) {
        let mut batch = self.batch.lock();
        if batch.generation == generation {
            batch.phase = phase;
            drop(batch);
            self.publish(phase);
        }
    }

    fn publish(&self, phase: UploadPhase) {
        self.progress.send_modify(|p| p.phase = phase);
    }
}

/// Read chunk `index` of `path` through its own file handle.
async fn read_slice(path: &Path, plan: &ChunkPlan, index: u32) -> Result<Bytes> {
    let range = plan
        .range(index)
        .ok_or_else(|| ClientError::State(format!("chunk {index} is outside the plan")))?;
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(range.start)).await?;
    let len = usize::try_from(range.end - range.start)
        .map_err(|_| ClientError::State(format!("chunk {index} is too large")))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
