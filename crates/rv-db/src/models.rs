//! Typed rows and the helpers that decode them.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use rv_core::{AssetId, AssetStatus, ChunkPlan, JobState, SessionId, SessionStatus, TranscodeJobId};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Format a timestamp for storage.
///
/// Fixed-width UTC so that string comparison in SQL matches time order.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|v| {
        DateTime::parse_from_rfc3339(&v)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

fn parse_enum<T: std::str::FromStr<Err = rv_core::Error>>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

fn get_u64(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(idx)?.max(0) as u64)
}

fn get_opt_path(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<PathBuf>> {
    Ok(row.get::<_, Option<String>>(idx)?.map(PathBuf::from))
}

// ---------------------------------------------------------------------------
// UploadSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: SessionId,
    pub filename: String,
    pub title: Option<String>,
    pub year: Option<i32>,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub uploaded_bytes: u64,
    pub status: SessionStatus,
    pub scratch_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            filename: row.get(1)?,
            title: row.get(2)?,
            year: row.get(3)?,
            total_size: get_u64(row, 4)?,
            chunk_size: get_u64(row, 5)?,
            total_chunks: row.get(6)?,
            uploaded_bytes: get_u64(row, 7)?,
            status: parse_enum(row, 8)?,
            scratch_dir: PathBuf::from(row.get::<_, String>(9)?),
            created_at: parse_ts(row, 10)?,
            expires_at: parse_ts(row, 11)?,
            updated_at: parse_ts(row, 12)?,
        })
    }

    /// Chunk layout declared at session start.
    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan {
            total_size: self.total_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
        }
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Asset
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Asset {
    pub id: AssetId,
    pub title: String,
    pub year: Option<i32>,
    pub filename: String,
    pub source_path: PathBuf,
    pub still_path: Option<PathBuf>,
    pub manifest_path: Option<PathBuf>,
    pub status: AssetStatus,
    pub size_bytes: u64,
    pub duration_secs: Option<f64>,
    pub progress_pct: f64,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            title: row.get(1)?,
            year: row.get(2)?,
            filename: row.get(3)?,
            source_path: PathBuf::from(row.get::<_, String>(4)?),
            still_path: get_opt_path(row, 5)?,
            manifest_path: get_opt_path(row, 6)?,
            status: parse_enum(row, 7)?,
            size_bytes: get_u64(row, 8)?,
            duration_secs: row.get(9)?,
            progress_pct: row.get::<_, f64>(10).unwrap_or(0.0),
            error: row.get(11)?,
            created_at: parse_ts(row, 12)?,
            updated_at: parse_ts(row, 13)?,
        })
    }
}

// ---------------------------------------------------------------------------
// TranscodeJob
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub id: TranscodeJobId,
    pub asset_id: AssetId,
    pub input_path: PathBuf,
    pub output_dir: PathBuf,
    pub state: JobState,
    pub progress_pct: f64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub error: Option<String>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TranscodeJob {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            asset_id: parse_id(row, 1)?,
            input_path: PathBuf::from(row.get::<_, String>(2)?),
            output_dir: PathBuf::from(row.get::<_, String>(3)?),
            state: parse_enum(row, 4)?,
            progress_pct: row.get::<_, f64>(5).unwrap_or(0.0),
            attempts: row.get(6)?,
            max_attempts: row.get(7)?,
            next_attempt_at: parse_ts(row, 8)?,
            error: row.get(9)?,
            locked_by: row.get(10)?,
            created_at: parse_ts(row, 11)?,
            started_at: parse_opt_ts(row, 12)?,
            completed_at: parse_opt_ts(row, 13)?,
        })
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
