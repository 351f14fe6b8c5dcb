//! Durable transcode job log.
//!
//! A job row is written when an upload is finalized and stays until it
//! reaches `succeeded` or `failed`, so a restart never loses queued work.
//! Dispatch order is insertion order (`rowid`).

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use rv_core::{AssetId, Error, JobState, Result, TranscodeJobId};

use crate::models::{ts, TranscodeJob};
use crate::queries::assets;

const COLS: &str = "id, asset_id, input_path, output_dir, state, progress_pct,
    attempts, max_attempts, next_attempt_at, error, locked_by,
    created_at, started_at, completed_at";

/// Append a queued job for `asset_id`, due immediately.
pub fn enqueue_job(
    conn: &Connection,
    asset_id: AssetId,
    input_path: &Path,
    output_dir: &Path,
    max_attempts: u32,
) -> Result<TranscodeJob> {
    let id = TranscodeJobId::new();
    let now = ts(Utc::now());

    conn.execute(
        "INSERT INTO transcode_jobs (id, asset_id, input_path, output_dir, state,
                                     max_attempts, next_attempt_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?6)",
        rusqlite::params![
            id.to_string(),
            asset_id.to_string(),
            input_path.to_string_lossy().into_owned(),
            output_dir.to_string_lossy().into_owned(),
            max_attempts.max(1),
            now,
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    get_job(conn, id)?.ok_or_else(|| Error::not_found("transcode_job", id))
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: TranscodeJobId) -> Result<Option<TranscodeJob>> {
    let q = format!("SELECT {COLS} FROM transcode_jobs WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], TranscodeJob::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// List jobs in a state, in dispatch order.
pub fn list_jobs_in_state(conn: &Connection, state: JobState) -> Result<Vec<TranscodeJob>> {
    let q = format!("SELECT {COLS} FROM transcode_jobs WHERE state = ?1 ORDER BY rowid ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([state.as_str()], TranscodeJob::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Count jobs in a state.
pub fn count_in_state(conn: &Connection, state: JobState) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM transcode_jobs WHERE state = ?1",
        [state.as_str()],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Atomically claim the oldest queued job that is due at `now`.
///
/// Sets `state='active'`, `locked_by`, `started_at`, resets progress and
/// counts the attempt.
pub fn claim_next_job(
    conn: &Connection,
    worker: &str,
    now: DateTime<Utc>,
) -> Result<Option<TranscodeJob>> {
    let now = ts(now);
    let q = format!(
        "UPDATE transcode_jobs
            SET state = 'active', locked_by = ?1, started_at = ?2,
                attempts = attempts + 1, progress_pct = 0
         WHERE rowid = (
             SELECT rowid FROM transcode_jobs
             WHERE state = 'queued' AND next_attempt_at <= ?2
             ORDER BY rowid ASC LIMIT 1
         )
         RETURNING {COLS}"
    );

    conn.query_row(&q, rusqlite::params![worker, now], TranscodeJob::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Earliest `next_attempt_at` among queued jobs.
pub fn next_due_at(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let s: Option<String> = conn
        .query_row(
            "SELECT MIN(next_attempt_at) FROM transcode_jobs WHERE state = 'queued'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| Error::database(e.to_string()))?;

    s.map(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| Error::database(e.to_string()))
    })
    .transpose()
}

/// Update progress of an active job.
pub fn update_job_progress(conn: &Connection, id: TranscodeJobId, pct: f64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE transcode_jobs SET progress_pct = ?1 WHERE id = ?2 AND state = 'active'",
            rusqlite::params![pct.clamp(0.0, 100.0), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark an active job as succeeded.
pub fn complete_job(conn: &Connection, id: TranscodeJobId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE transcode_jobs SET state = 'succeeded', progress_pct = 100.0, error = NULL,
                locked_by = NULL, completed_at = ?1
             WHERE id = ?2 AND state = 'active'",
            rusqlite::params![ts(Utc::now()), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Put an active job back in the queue after a failed attempt.
pub fn requeue_job(
    conn: &Connection,
    id: TranscodeJobId,
    error: &str,
    next_attempt_at: DateTime<Utc>,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE transcode_jobs SET state = 'queued', error = ?1, next_attempt_at = ?2,
                locked_by = NULL
             WHERE id = ?3 AND state = 'active'",
            rusqlite::params![error, ts(next_attempt_at), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark an active job as permanently failed.
pub fn fail_job(conn: &Connection, id: TranscodeJobId, error: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE transcode_jobs SET state = 'failed', error = ?1, locked_by = NULL,
                completed_at = ?2
             WHERE id = ?3 AND state = 'active'",
            rusqlite::params![error, ts(Utc::now()), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Hand an interrupted job back to the queue without charging the attempt.
///
/// Used when the worker is stopped by shutdown rather than by a failure.
pub fn release_job(conn: &Connection, id: TranscodeJobId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE transcode_jobs SET state = 'queued', locked_by = NULL, started_at = NULL,
                attempts = MAX(attempts - 1, 0), next_attempt_at = ?1
             WHERE id = ?2 AND state = 'active'",
            rusqlite::params![ts(Utc::now()), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Error recorded on a job whose last attempt was cut short by a restart.
pub const INTERRUPTED: &str = "interrupted by a restart";

/// Outcome of [`reset_orphaned_jobs`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanReport {
    pub requeued: usize,
    pub failed: usize,
}

/// Settle jobs left `active` by a previous process.
///
/// Called once at startup before any worker runs. The interrupted attempt
/// still counts against the budget: a job that has used every attempt is
/// failed together with its asset, the rest return to the queue.
pub fn reset_orphaned_jobs(conn: &Connection) -> Result<OrphanReport> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    let q = format!(
        "SELECT {COLS} FROM transcode_jobs
         WHERE state = 'active' AND attempts >= max_attempts ORDER BY rowid ASC"
    );
    let exhausted = {
        let mut stmt = tx.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
        let rows = stmt
            .query_map([], TranscodeJob::from_row)
            .map_err(|e| Error::database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::database(e.to_string()))?;
        rows
    };
    for job in &exhausted {
        fail_job(&tx, job.id, INTERRUPTED)?;
        assets::mark_error(
            &tx,
            job.asset_id,
            &format!("transcode failed after {} attempts: {INTERRUPTED}", job.attempts),
        )?;
    }

    let requeued = tx
        .execute(
            "UPDATE transcode_jobs SET state = 'queued', locked_by = NULL, started_at = NULL
             WHERE state = 'active'",
            [],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    tx.commit().map_err(|e| Error::database(e.to_string()))?;

    Ok(OrphanReport {
        requeued,
        failed: exhausted.len(),
    })
}
