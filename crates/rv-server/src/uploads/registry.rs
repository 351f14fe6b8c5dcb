//! Upload session registry.
//!
//! Owns the lifecycle of upload sessions: `active -> completed | cancelled |
//! expired`. Session rows and chunk rows live in SQLite, payloads in
//! `<data_dir>/scratch/<session_id>/`. On completion the chunks are
//! assembled into `<data_dir>/media/<asset_id>/source.<ext>` and ownership
//! moves to the asset store in a single transaction.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rv_core::api::StartUploadRequest;
use rv_core::config::Config;
use rv_core::{AssetId, ChunkPlan, Error, Result, SessionId, SessionStatus};
use rv_db::models::{Asset, TranscodeJob, UploadSession};
use rv_db::pool::{get_conn, DbPool};
use rv_db::queries::assets::NewAsset;
use rv_db::queries::sessions::{self, NewSession};
use tokio::io::AsyncRead;
use tokio::sync::Notify;

use super::assembler;
use super::gate::{CloseReason, GateMap, GateState};

/// Result of a successful chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub index: u32,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub orphans_removed: usize,
    pub tombstones_purged: usize,
}

pub struct SessionRegistry {
    db: DbPool,
    config: Arc<Config>,
    gates: GateMap,
    /// Wakes the transcode dispatcher after a job is appended.
    queue_wake: Arc<Notify>,
}

impl SessionRegistry {
    pub fn new(db: DbPool, config: Arc<Config>, queue_wake: Arc<Notify>) -> Self {
        Self {
            db,
            config,
            gates: GateMap::default(),
            queue_wake,
        }
    }

    fn scratch_root(&self) -> PathBuf {
        self.config.server.scratch_dir()
    }

    /// Open a new session and allocate its scratch directory.
    pub async fn start_session(&self, req: &StartUploadRequest) -> Result<UploadSession> {
        let upload = &self.config.upload;

        let filename = Path::new(req.filename.trim())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::Validation("filename is required".into()))?;

        let ext = extension_of(&filename)
            .ok_or_else(|| Error::Validation(format!("'{filename}' has no file extension")))?;
        if !upload.allows_extension(&ext) {
            return Err(Error::Validation(format!(
                "file type '.{ext}' is not accepted (allowed: {})",
                upload.allowed_extensions.join(", ")
            )));
        }

        if req.file_size == 0 {
            return Err(Error::Validation("fileSize must be greater than zero".into()));
        }
        if req.file_size > upload.max_file_size {
            return Err(Error::Validation(format!(
                "fileSize {} exceeds the limit of {} bytes",
                req.file_size, upload.max_file_size
            )));
        }

        let chunk_size = req.chunk_size.unwrap_or(upload.default_chunk_size);
        if chunk_size < upload.min_chunk_size || chunk_size > upload.max_chunk_size {
            return Err(Error::Validation(format!(
                "chunkSize {chunk_size} is outside [{}, {}]",
                upload.min_chunk_size, upload.max_chunk_size
            )));
        }
        let plan = ChunkPlan::new(req.file_size, chunk_size)?;

        let id = SessionId::new();
        let scratch_dir = self.scratch_root().join(id.to_string());
        let now = Utc::now();
        let title = req.title.as_deref().map(str::trim).filter(|t| !t.is_empty());

        // Row first: the sweep only reclaims scratch directories it cannot
        // match to an active row.
        let session = {
            let conn = get_conn(&self.db)?;
            sessions::create_session(
                &conn,
                &NewSession {
                    id,
                    filename: &filename,
                    title,
                    year: req.year,
                    total_size: plan.total_size,
                    chunk_size: plan.chunk_size,
                    total_chunks: plan.total_chunks,
                    scratch_dir: &scratch_dir,
                    created_at: now,
                    expires_at: now + upload.session_ttl(),
                },
            )?
        };

        if let Err(e) = tokio::fs::create_dir_all(&scratch_dir).await {
            let conn = get_conn(&self.db)?;
            sessions::delete_session(&conn, id)?;
            return Err(e.into());
        }

        tracing::info!(
            session_id = %id,
            filename = %session.filename,
            total_size = session.total_size,
            total_chunks = session.total_chunks,
            "Upload session started"
        );
        Ok(session)
    }

    /// Session row plus accepted chunk indices.
    pub fn session_status(&self, id: SessionId) -> Result<(UploadSession, Vec<u32>)> {
        let conn = get_conn(&self.db)?;
        let session = sessions::get_session(&conn, id)?
            .ok_or_else(|| Error::not_found("upload_session", id))?;
        let accepted = sessions::accepted_chunks(&conn, id)?;
        Ok((session, accepted))
    }

    fn load_writable(&self, id: SessionId, now: DateTime<Utc>) -> Result<UploadSession> {
        let conn = get_conn(&self.db)?;
        let session = sessions::get_session(&conn, id)?
            .ok_or_else(|| Error::not_found("upload_session", id))?;
        match session.status {
            SessionStatus::Active if session.is_past_deadline(now) => {
                Err(Error::session_expired(id))
            }
            SessionStatus::Active => Ok(session),
            SessionStatus::Expired => Err(Error::session_expired(id)),
            SessionStatus::Completed | SessionStatus::Cancelled => {
                Err(Error::not_found("upload_session", id))
            }
        }
    }

    /// Accept the payload of chunk `index`.
    ///
    /// Safe to call concurrently and out of order. Re-accepting an index
    /// replaces its payload; the byte counter is recomputed from the chunk
    /// rows so identical bytes leave it unchanged.
    pub async fn accept_chunk<R>(&self, id: SessionId, index: u32, body: R) -> Result<ChunkAck>
    where
        R: AsyncRead + Unpin,
    {
        let session = self.load_writable(id, Utc::now())?;
        let plan = session.plan();

        let expected = plan.chunk_len(index).ok_or_else(|| {
            Error::Validation(format!(
                "chunk index {index} is out of range (0..{})",
                plan.total_chunks
            ))
        })?;

        let gate = self.gates.get(id);
        let state = gate.state.read().await;
        state.check(id)?;

        let path = match assembler::write_chunk(&session.scratch_dir, index, body, expected).await {
            Ok(p) => p,
            Err(Error::Io { source }) if source.kind() == std::io::ErrorKind::NotFound => {
                // Scratch removed underneath us: the session finished elsewhere.
                drop(state);
                return Err(self.gone_error(id));
            }
            Err(e) => return Err(e),
        };

        let recorded = {
            let conn = get_conn(&self.db)?;
            sessions::record_chunk(&conn, id, index, expected)?
        };
        drop(state);

        match recorded {
            Some(uploaded_bytes) => {
                tracing::debug!(session_id = %id, chunk = index, uploaded_bytes, "Chunk accepted");
                Ok(ChunkAck {
                    index,
                    uploaded_bytes,
                    total_bytes: session.total_size,
                })
            }
            None => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(self.gone_error(id))
            }
        }
    }

    /// Error for a session that vanished or turned terminal mid-request.
    fn gone_error(&self, id: SessionId) -> Error {
        self.gates.forget(id);
        let expired = get_conn(&self.db)
            .and_then(|conn| sessions::get_session(&conn, id))
            .ok()
            .flatten()
            .is_some_and(|s| s.status == SessionStatus::Expired);
        if expired {
            Error::session_expired(id)
        } else {
            Error::not_found("upload_session", id)
        }
    }

    /// Active, in-deadline session eligible for completion.
    fn load_completable(&self, id: SessionId) -> Result<UploadSession> {
        let conn = get_conn(&self.db)?;
        let session = sessions::get_session(&conn, id)?
            .filter(|s| s.status == SessionStatus::Active)
            .ok_or_else(|| Error::not_found("upload_session", id))?;
        if session.is_past_deadline(Utc::now()) {
            return Err(Error::session_expired(id));
        }
        Ok(session)
    }

    /// Assemble the artifact and hand the upload over to the asset store.
    pub async fn complete_session(&self, id: SessionId) -> Result<(Asset, TranscodeJob)> {
        self.load_completable(id)?;

        let gate = self.gates.get(id);
        let mut state = gate.state.write().await;
        if *state != GateState::Open {
            return Err(Error::not_found("upload_session", id));
        }

        // Re-read under the exclusive gate; no chunk write is in flight now.
        let session = self.load_completable(id)?;
        let accepted = sessions::accepted_chunks(&*get_conn(&self.db)?, id)?;

        let plan = session.plan();
        let accepted: HashSet<u32> = accepted.into_iter().collect();
        let missing: Vec<u32> = plan.indices().filter(|i| !accepted.contains(i)).collect();
        if !missing.is_empty() {
            return Err(Error::IncompleteUpload {
                id: id.to_string(),
                missing,
            });
        }

        let asset_id = AssetId::new();
        let output_dir = self.config.server.media_dir().join(asset_id.to_string());
        let ext = extension_of(&session.filename).unwrap_or_else(|| "bin".into());
        let source_path = output_dir.join(format!("source.{ext}"));

        if let Err(e) = assembler::assemble(&session.scratch_dir, &plan, &source_path).await {
            let _ = assembler::remove_dir_if_exists(&output_dir).await;
            return Err(e);
        }

        let title = session
            .title
            .clone()
            .unwrap_or_else(|| title_from_filename(&session.filename));

        let finalized = {
            let conn = get_conn(&self.db)?;
            sessions::finalize_session(
                &conn,
                id,
                &NewAsset {
                    id: asset_id,
                    title: &title,
                    year: session.year,
                    filename: &session.filename,
                    source_path: &source_path,
                    size_bytes: session.total_size,
                },
                &output_dir,
                self.config.transcode.attempt_budget(),
            )
        };
        let (asset, job) = match finalized {
            Ok(v) => v,
            Err(e) => {
                let _ = assembler::remove_dir_if_exists(&output_dir).await;
                return Err(e);
            }
        };

        // Committed: the scratch copy is no longer needed. The gate is
        // forgotten only once the directory is gone.
        *state = GateState::Closed(CloseReason::Completed);
        if let Err(e) = assembler::remove_dir_if_exists(&session.scratch_dir).await {
            tracing::warn!(session_id = %id, "Failed to remove scratch directory: {e}");
        }
        drop(state);
        self.gates.forget(id);
        self.queue_wake.notify_one();

        tracing::info!(
            session_id = %id,
            asset_id = %asset.id,
            job_id = %job.id,
            size = asset.size_bytes,
            "Upload completed"
        );
        Ok((asset, job))
    }

    /// Cancel a session. Idempotent: unknown or finished sessions succeed.
    pub async fn cancel_session(&self, id: SessionId) -> Result<()> {
        let gate = self.gates.get(id);
        let mut state = gate.state.write().await;
        if *state == GateState::Open {
            *state = GateState::Closed(CloseReason::Cancelled);
        }

        let session = {
            let conn = get_conn(&self.db)?;
            let session = sessions::get_session(&conn, id)?;
            if session.is_some() {
                sessions::delete_session(&conn, id)?;
            }
            session
        };

        let scratch = session
            .map(|s| s.scratch_dir)
            .unwrap_or_else(|| self.scratch_root().join(id.to_string()));
        if let Err(e) = assembler::remove_dir_if_exists(&scratch).await {
            tracing::warn!(session_id = %id, "Failed to remove scratch directory: {e}");
        }
        drop(state);
        self.gates.forget(id);
        tracing::info!(session_id = %id, "Upload cancelled");
        Ok(())
    }

    /// Expire overdue sessions, reclaim orphaned scratch storage and purge
    /// old tombstones.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        let overdue = sessions::list_past_deadline(&*get_conn(&self.db)?, now)?;
        for session in overdue {
            let gate = self.gates.get(session.id);
            let mut state = gate.state.write().await;
            if *state != GateState::Open {
                continue;
            }
            *state = GateState::Closed(CloseReason::Expired);

            let expired = sessions::expire_session(&*get_conn(&self.db)?, session.id)?;
            if let Err(e) = assembler::remove_dir_if_exists(&session.scratch_dir).await {
                tracing::warn!(session_id = %session.id, "Failed to remove scratch directory: {e}");
            }
            drop(state);
            self.gates.forget(session.id);
            if expired {
                report.expired += 1;
                tracing::info!(session_id = %session.id, "Upload session expired");
            }
        }

        report.orphans_removed = self.reclaim_orphans().await?;

        let cutoff = now - self.config.upload.tombstone_retention();
        report.tombstones_purged = sessions::purge_expired(&*get_conn(&self.db)?, cutoff)?;

        Ok(report)
    }

    /// Remove scratch directories that belong to no active session.
    async fn reclaim_orphans(&self) -> Result<usize> {
        let root = self.scratch_root();

        // List the directory before the active ids so a session created in
        // between is never mistaken for an orphan.
        let mut candidates = Vec::new();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                candidates.push(entry.path());
            }
        }

        let active: HashSet<SessionId> =
            sessions::list_active_ids(&*get_conn(&self.db)?)?.into_iter().collect();

        let mut removed = 0;
        for dir in candidates {
            let owner = dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.parse::<SessionId>().ok());
            if owner.is_some_and(|id| active.contains(&id)) {
                continue;
            }
            match assembler::remove_dir_if_exists(&dir).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!("Removed orphaned scratch directory {}", dir.display());
                }
                Err(e) => tracing::warn!("Failed to remove {}: {e}", dir.display()),
            }
        }
        Ok(removed)
    }
}

/// Lowercase extension without the dot.
fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| e.to_ascii_lowercase())
}

/// Default title: the file stem.
fn title_from_filename(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| filename.to_string())
}
