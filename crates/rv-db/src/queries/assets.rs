//! Asset store operations.

use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use rv_core::{AssetId, AssetStatus, Error, Result};

use crate::models::{ts, Asset};

const COLS: &str = "id, title, year, filename, source_path, still_path, manifest_path,
    status, size_bytes, duration_secs, progress_pct, error, created_at, updated_at";

/// Fields supplied when an upload is finalized.
#[derive(Debug, Clone)]
pub struct NewAsset<'a> {
    pub id: AssetId,
    pub title: &'a str,
    pub year: Option<i32>,
    pub filename: &'a str,
    pub source_path: &'a Path,
    pub size_bytes: u64,
}

/// Insert an asset in the `processing` state.
pub fn create_asset(conn: &Connection, new: &NewAsset<'_>) -> Result<Asset> {
    let now = ts(Utc::now());
    conn.execute(
        "INSERT INTO assets (id, title, year, filename, source_path, status, size_bytes,
                             progress_pct, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)",
        rusqlite::params![
            new.id.to_string(),
            new.title,
            new.year,
            new.filename,
            new.source_path.to_string_lossy().into_owned(),
            AssetStatus::Processing.as_str(),
            new.size_bytes as i64,
            now,
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    get_asset(conn, new.id)?.ok_or_else(|| Error::not_found("asset", new.id))
}

/// Get an asset by ID.
pub fn get_asset(conn: &Connection, id: AssetId) -> Result<Option<Asset>> {
    let q = format!("SELECT {COLS} FROM assets WHERE id = ?1");
    conn.query_row(&q, [id.to_string()], Asset::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// List assets, newest first, with optional status filter and pagination.
pub fn list_assets(
    conn: &Connection,
    status: Option<AssetStatus>,
    offset: i64,
    limit: i64,
) -> Result<Vec<Asset>> {
    let (q, params_vec): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = if let Some(s) = status {
        (
            format!(
                "SELECT {COLS} FROM assets WHERE status = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ),
            vec![
                Box::new(s.as_str().to_string()),
                Box::new(limit),
                Box::new(offset),
            ],
        )
    } else {
        (
            format!("SELECT {COLS} FROM assets ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"),
            vec![Box::new(limit), Box::new(offset)],
        )
    };

    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        params_vec.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params_refs.as_slice(), Asset::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Record transcode progress while the asset is still processing.
pub fn update_progress(conn: &Connection, id: AssetId, pct: f64) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE assets SET progress_pct = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
            rusqlite::params![pct.clamp(0.0, 100.0), ts(Utc::now()), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Transition `processing -> ready` and record the derived artifacts.
pub fn mark_ready(
    conn: &Connection,
    id: AssetId,
    still_path: &Path,
    manifest_path: &Path,
    duration_secs: Option<f64>,
) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE assets SET status = 'ready', still_path = ?1, manifest_path = ?2,
                duration_secs = ?3, progress_pct = 100.0, error = NULL, updated_at = ?4
             WHERE id = ?5 AND status = 'processing'",
            rusqlite::params![
                still_path.to_string_lossy().into_owned(),
                manifest_path.to_string_lossy().into_owned(),
                duration_secs,
                ts(Utc::now()),
                id.to_string()
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Transition `processing -> error` with a human-readable message.
pub fn mark_error(conn: &Connection, id: AssetId, message: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE assets SET status = 'error', error = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'processing'",
            rusqlite::params![message, ts(Utc::now()), id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, init_memory_pool};
    use std::path::PathBuf;

    fn insert(conn: &Connection, title: &str) -> Asset {
        let source = PathBuf::from(format!("/media/{title}/source.mp4"));
        create_asset(
            conn,
            &NewAsset {
                id: AssetId::new(),
                title,
                year: Some(1999),
                filename: "movie.mp4",
                source_path: &source,
                size_bytes: 1234,
            },
        )
        .unwrap()
    }

    #[test]
    fn create_starts_processing() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let asset = insert(&conn, "Heat");
        assert_eq!(asset.status, AssetStatus::Processing);
        assert_eq!(asset.size_bytes, 1234);
        assert!(asset.still_path.is_none());
    }

    #[test]
    fn ready_is_terminal() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let asset = insert(&conn, "Ronin");

        assert!(update_progress(&conn, asset.id, 40.0).unwrap());
        assert!(mark_ready(
            &conn,
            asset.id,
            Path::new("/m/still.jpg"),
            Path::new("/m/hls/index.m3u8"),
            Some(90.5)
        )
        .unwrap());

        // No transitions out of a terminal state.
        assert!(!mark_error(&conn, asset.id, "late failure").unwrap());
        assert!(!update_progress(&conn, asset.id, 10.0).unwrap());

        let asset = get_asset(&conn, asset.id).unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::Ready);
        assert_eq!(asset.progress_pct, 100.0);
        assert_eq!(asset.duration_secs, Some(90.5));
        assert_eq!(asset.manifest_path, Some(PathBuf::from("/m/hls/index.m3u8")));
    }

    #[test]
    fn error_records_message() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let asset = insert(&conn, "Thief");

        assert!(mark_error(&conn, asset.id, "ffmpeg exited with 1").unwrap());
        let asset = get_asset(&conn, asset.id).unwrap().unwrap();
        assert_eq!(asset.status, AssetStatus::Error);
        assert_eq!(asset.error.as_deref(), Some("ffmpeg exited with 1"));
    }

    #[test]
    fn list_filters_by_status() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let a = insert(&conn, "One");
        insert(&conn, "Two");
        mark_error(&conn, a.id, "broken").unwrap();

        assert_eq!(list_assets(&conn, None, 0, 50).unwrap().len(), 2);
        let errored = list_assets(&conn, Some(AssetStatus::Error), 0, 50).unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].id, a.id);
    }

    #[test]
    fn get_missing_returns_none() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        assert!(get_asset(&conn, AssetId::new()).unwrap().is_none());
    }
}
