//! SQLite connection pools.
//!
//! The server opens one file database with a small r2d2 pool. Tests use a
//! private in-memory database per pool.

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rv_core::{Error, Result};

use crate::migrations;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Connections for the file database. Chunk writes, sweeps and the
/// transcode workers each hold one only between awaits.
const FILE_POOL_SIZE: u32 = 4;

/// Open (or create) the database at `path` and run pending migrations.
///
/// Every connection gets foreign keys, WAL and a busy timeout so concurrent
/// chunk writers wait for each other instead of failing with SQLITE_BUSY.
pub fn init_pool(path: &Path) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
    });
    build(manager, FILE_POOL_SIZE)
}

/// A fresh in-memory database.
///
/// Shared-cache tables lock instead of waiting on a busy handler, so this
/// pool has exactly one connection. Callers must not hold it across an
/// `.await`.
pub fn init_memory_pool() -> Result<DbPool> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let uri = format!(
        "file:rv_memdb_{}?mode=memory&cache=shared",
        NEXT.fetch_add(1, Ordering::Relaxed)
    );
    let manager = SqliteConnectionManager::file(uri)
        .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
    build(manager, 1)
}

fn build(manager: SqliteConnectionManager, size: u32) -> Result<DbPool> {
    let pool = Pool::builder()
        .max_size(size)
        .build(manager)
        .map_err(|e| Error::database(format!("failed to create connection pool: {e}")))?;
    migrations::run_migrations(&*get_conn(&pool)?)?;
    Ok(pool)
}

pub fn get_conn(pool: &DbPool) -> Result<PooledConnection> {
    pool.get()
        .map_err(|e| Error::database(format!("failed to get connection from pool: {e}")))
}
