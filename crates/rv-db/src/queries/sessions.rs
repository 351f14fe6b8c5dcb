//! Upload session records and their accepted chunks.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use rv_core::{Error, Result, SessionId, SessionStatus};

use crate::models::{ts, Asset, TranscodeJob, UploadSession};
use crate::queries::{assets, transcode_jobs};

const COLS: &str = "id, filename, title, year, total_size, chunk_size, total_chunks,
    uploaded_bytes, status, scratch_dir, created_at, expires_at, updated_at";

/// Fields supplied at `start_session`.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub id: SessionId,
    pub filename: &'a str,
    pub title: Option<&'a str>,
    pub year: Option<i32>,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub scratch_dir: &'a Path,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Insert an `active` session.
pub fn create_session(conn: &Connection, new: &NewSession<'_>) -> Result<UploadSession> {
    let created = ts(new.created_at);
    conn.execute(
        "INSERT INTO upload_sessions (id, filename, title, year, total_size, chunk_size,
                                      total_chunks, uploaded_bytes, status, scratch_dir,
                                      created_at, expires_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 'active', ?8, ?9, ?10, ?9)",
        rusqlite::params![
            new.id.to_string(),
            new.filename,
            new.title,
            new.year,
            new.total_size as i64,
            new.chunk_size as i64,
            new.total_chunks,
            new.scratch_dir.to_string_lossy().into_owned(),
            created,
            ts(new.expires_at),
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    get_session(conn, new.id)?.ok_or_else(|| Error::not_found("upload_session", new.id))
}

/// Get a session by ID, in any state.
pub fn get_session(conn: &Connection, id: SessionId) -> Result<Option<UploadSession>> {
    let q = format!("SELECT {COLS} FROM upload_sessions WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], UploadSession::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Accepted chunk indices, ascending.
pub fn accepted_chunks(conn: &Connection, id: SessionId) -> Result<Vec<u32>> {
    let mut stmt = conn
        .prepare(
            "SELECT chunk_index FROM upload_chunks WHERE session_id = ?1 ORDER BY chunk_index",
        )
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([id.to_string()], |row| row.get::<_, u32>(0))
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Record an accepted chunk and return the session's new byte counter.
///
/// The upsert and the counter recomputation run in one transaction, so the
/// counter always equals the sum of accepted chunk sizes. Only `active`
/// sessions are updated; `None` means the session is gone or terminal.
pub fn record_chunk(
    conn: &Connection,
    id: SessionId,
    index: u32,
    size: u64,
) -> Result<Option<u64>> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;
    let now = ts(Utc::now());

    let active: bool = tx
        .query_row(
            "SELECT COUNT(*) > 0 FROM upload_sessions WHERE id = ?1 AND status = 'active'",
            [id.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| Error::database(e.to_string()))?;
    if !active {
        return Ok(None);
    }

    tx.execute(
        "INSERT INTO upload_chunks (session_id, chunk_index, size, accepted_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(session_id, chunk_index) DO UPDATE SET size = excluded.size,
             accepted_at = excluded.accepted_at",
        rusqlite::params![id.to_string(), index, size as i64, &now],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    let uploaded: i64 = tx
        .query_row(
            "UPDATE upload_sessions
                SET uploaded_bytes = (SELECT COALESCE(SUM(size), 0) FROM upload_chunks
                                      WHERE session_id = ?1),
                    updated_at = ?2
             WHERE id = ?1
             RETURNING uploaded_bytes",
            rusqlite::params![id.to_string(), &now],
            |row| row.get(0),
        )
        .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(Some(uploaded.max(0) as u64))
}

/// Delete a session and its chunk rows. Returns true if a row was deleted.
pub fn delete_session(conn: &Connection, id: SessionId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM upload_sessions WHERE id = ?1", [id.to_string()])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Transition `active -> expired` and drop the chunk rows.
pub fn expire_session(conn: &Connection, id: SessionId) -> Result<bool> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;
    let n = tx
        .execute(
            "UPDATE upload_sessions SET status = ?1, uploaded_bytes = 0, updated_at = ?2
             WHERE id = ?3 AND status = 'active'",
            rusqlite::params![SessionStatus::Expired.as_str(), ts(Utc::now()), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    if n > 0 {
        tx.execute(
            "DELETE FROM upload_chunks WHERE session_id = ?1",
            [id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    }
    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Active sessions whose deadline is at or before `now`.
pub fn list_past_deadline(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<UploadSession>> {
    let q = format!(
        "SELECT {COLS} FROM upload_sessions
         WHERE status = 'active' AND expires_at <= ?1
         ORDER BY expires_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([ts(now)], UploadSession::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// IDs of every session still in the `active` state.
pub fn list_active_ids(conn: &Connection) -> Result<Vec<SessionId>> {
    let mut stmt = conn
        .prepare("SELECT id FROM upload_sessions WHERE status = 'active'")
        .map_err(|e| Error::database(e.to_string()))?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(ids.iter().filter_map(|s| s.parse().ok()).collect())
}

/// Delete expired session rows last touched before `before`.
pub fn purge_expired(conn: &Connection, before: DateTime<Utc>) -> Result<usize> {
    conn.execute(
        "DELETE FROM upload_sessions WHERE status = 'expired' AND updated_at < ?1",
        [ts(before)],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Hand a finished upload over to the asset store.
///
/// In one transaction: inserts the asset in `processing`, appends its
/// transcode job, and deletes the session together with its chunk rows.
/// Scratch files are not touched here; the caller removes them only after
/// this commit succeeds.
pub fn finalize_session(
    conn: &Connection,
    id: SessionId,
    asset: &assets::NewAsset<'_>,
    output_dir: &Path,
    max_attempts: u32,
) -> Result<(Asset, TranscodeJob)> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    let asset = assets::create_asset(&tx, asset)?;
    let job = transcode_jobs::enqueue_job(
        &tx,
        asset.id,
        &asset.source_path,
        output_dir,
        max_attempts,
    )?;

    let n = tx
        .execute(
            "DELETE FROM upload_sessions WHERE id = ?1 AND status = 'active'",
            [id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    if n == 0 {
        // Dropping `tx` rolls back the asset and job inserts.
        return Err(Error::not_found("upload_session", id));
    }

    tx.commit().map_err(|e| Error::database(e.to_string()))?;
    Ok((asset, job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, init_memory_pool};
    use rv_core::{AssetId, JobState};
    use std::path::PathBuf;

    fn new_session(conn: &Connection, ttl_secs: i64) -> UploadSession {
        let now = Utc::now();
        let scratch = PathBuf::from("/scratch/x");
        create_session(
            conn,
            &NewSession {
                id: SessionId::new(),
                filename: "movie.mkv",
                title: None,
                year: None,
                total_size: 1000,
                chunk_size: 300,
                total_chunks: 4,
                scratch_dir: &scratch,
                created_at: now,
                expires_at: now + chrono::Duration::seconds(ttl_secs),
            },
        )
        .unwrap()
    }

    #[test]
    fn counter_matches_accepted_sizes() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let s = new_session(&conn, 3600);

        assert_eq!(record_chunk(&conn, s.id, 3, 100).unwrap(), Some(100));
        assert_eq!(record_chunk(&conn, s.id, 0, 300).unwrap(), Some(400));
        // Re-accepting the same index does not double count.
        assert_eq!(record_chunk(&conn, s.id, 0, 300).unwrap(), Some(400));

        assert_eq!(accepted_chunks(&conn, s.id).unwrap(), vec![0, 3]);
        let s = get_session(&conn, s.id).unwrap().unwrap();
        assert_eq!(s.uploaded_bytes, 400);
    }

    #[test]
    fn record_on_missing_session_is_none() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        assert_eq!(record_chunk(&conn, SessionId::new(), 0, 10).unwrap(), None);
    }

    #[test]
    fn expire_is_terminal_and_drops_chunks() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let s = new_session(&conn, -1);
        record_chunk(&conn, s.id, 1, 300).unwrap();

        let due = list_past_deadline(&conn, Utc::now()).unwrap();
        assert_eq!(due.len(), 1);

        assert!(expire_session(&conn, s.id).unwrap());
        assert!(!expire_session(&conn, s.id).unwrap());
        assert_eq!(record_chunk(&conn, s.id, 2, 300).unwrap(), None);
        assert!(accepted_chunks(&conn, s.id).unwrap().is_empty());

        let s = get_session(&conn, s.id).unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Expired);
        assert!(list_active_ids(&conn).unwrap().is_empty());
    }

    #[test]
    fn purge_removes_old_tombstones() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let s = new_session(&conn, -1);
        expire_session(&conn, s.id).unwrap();

        let later = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(purge_expired(&conn, later).unwrap(), 1);
        assert!(get_session(&conn, s.id).unwrap().is_none());
    }

    #[test]
    fn finalize_moves_ownership() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let s = new_session(&conn, 3600);
        record_chunk(&conn, s.id, 0, 300).unwrap();

        let source = PathBuf::from("/media/a/source.mkv");
        let (asset, job) = finalize_session(
            &conn,
            s.id,
            &assets::NewAsset {
                id: AssetId::new(),
                title: "movie",
                year: None,
                filename: "movie.mkv",
                source_path: &source,
                size_bytes: 1000,
            },
            Path::new("/media/a/hls"),
            3,
        )
        .unwrap();

        assert_eq!(job.asset_id, asset.id);
        assert_eq!(job.state, JobState::Queued);
        assert!(get_session(&conn, s.id).unwrap().is_none());
        assert!(accepted_chunks(&conn, s.id).unwrap().is_empty());
    }

    #[test]
    fn finalize_rolls_back_when_session_missing() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let source = PathBuf::from("/media/b/source.mkv");
        let asset_id = AssetId::new();
        let err = finalize_session(
            &conn,
            SessionId::new(),
            &assets::NewAsset {
                id: asset_id,
                title: "ghost",
                year: None,
                filename: "ghost.mkv",
                source_path: &source,
                size_bytes: 1,
            },
            Path::new("/media/b/hls"),
            3,
        )
        .unwrap_err();

        assert!(matches!(err, Error::NotFound { .. }));
        assert!(assets::get_asset(&conn, asset_id).unwrap().is_none());
    }
}
