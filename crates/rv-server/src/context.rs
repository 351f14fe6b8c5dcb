//! Application context shared by all request handlers via Axum state.

use std::sync::Arc;

use rv_av::{ToolRegistry, Transcoder};
use rv_core::config::Config;
use rv_db::pool::DbPool;

use crate::transcode::TranscodeQueue;
use crate::uploads::SessionRegistry;

/// Cheaply cloneable: every field is a pool handle or an `Arc`.
#[derive(Clone)]
pub struct AppContext {
    /// Database connection pool.
    pub db: DbPool,
    /// Immutable application configuration snapshot.
    pub config: Arc<Config>,
    /// External tool registry.
    pub tools: Arc<ToolRegistry>,
    /// Upload sessions and chunk assembly.
    pub uploads: Arc<SessionRegistry>,
    /// Transcode admission queue.
    pub queue: Arc<TranscodeQueue>,
}

impl AppContext {
    /// Wire the registry and the queue around a shared pool.
    pub fn new(
        db: DbPool,
        config: Config,
        tools: Arc<ToolRegistry>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        let config = Arc::new(config);
        let queue = Arc::new(TranscodeQueue::new(
            db.clone(),
            config.transcode.clone(),
            transcoder,
        ));
        let uploads = Arc::new(SessionRegistry::new(
            db.clone(),
            config.clone(),
            queue.waker(),
        ));

        Self {
            db,
            config,
            tools,
            uploads,
            queue,
        }
    }
}
