//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;
use rv_core::{Error, Result};

/// V1: upload sessions, accepted chunks, assets, and the transcode job log.
const V1_INITIAL: &str = r#"
-- Chunked upload sessions
CREATE TABLE upload_sessions (
    id             TEXT PRIMARY KEY,
    filename       TEXT NOT NULL,
    title          TEXT,
    year           INTEGER,
    total_size     INTEGER NOT NULL,
    chunk_size     INTEGER NOT NULL,
    total_chunks   INTEGER NOT NULL,
    uploaded_bytes INTEGER NOT NULL DEFAULT 0,
    status         TEXT NOT NULL DEFAULT 'active',
    scratch_dir    TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    expires_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE INDEX idx_upload_sessions_status_expiry ON upload_sessions(status, expires_at);

CREATE TABLE upload_chunks (
    session_id  TEXT NOT NULL REFERENCES upload_sessions(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    size        INTEGER NOT NULL,
    accepted_at TEXT NOT NULL,
    PRIMARY KEY (session_id, chunk_index)
);

-- Stored movies
CREATE TABLE assets (
    id            TEXT PRIMARY KEY,
    title         TEXT NOT NULL,
    year          INTEGER,
    filename      TEXT NOT NULL,
    source_path   TEXT NOT NULL,
    still_path    TEXT,
    manifest_path TEXT,
    status        TEXT NOT NULL,
    size_bytes    INTEGER NOT NULL,
    duration_secs REAL,
    progress_pct  REAL NOT NULL DEFAULT 0,
    error         TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE INDEX idx_assets_status ON assets(status);

-- Write-ahead log of transcode work; rowid order is FIFO order.
CREATE TABLE transcode_jobs (
    id              TEXT PRIMARY KEY,
    asset_id        TEXT NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    input_path      TEXT NOT NULL,
    output_dir      TEXT NOT NULL,
    state           TEXT NOT NULL DEFAULT 'queued',
    progress_pct    REAL NOT NULL DEFAULT 0,
    attempts        INTEGER NOT NULL DEFAULT 0,
    max_attempts    INTEGER NOT NULL,
    next_attempt_at TEXT NOT NULL,
    error           TEXT,
    locked_by       TEXT,
    created_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT
);

CREATE INDEX idx_transcode_jobs_state ON transcode_jobs(state, next_attempt_at);
CREATE INDEX idx_transcode_jobs_asset ON transcode_jobs(asset_id);
"#;

/// Ordered list of all migrations.
const MIGRATIONS: &[(i64, &str)] = &[(1, V1_INITIAL)];

/// Run all pending migrations against the given connection.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit()
            .map_err(|e| Error::database(e.to_string()))?;

        tracing::debug!(version, "Applied database migration");
    }

    Ok(())
}
