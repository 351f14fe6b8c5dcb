//! Durable client-side upload state.
//!
//! One JSON file maps an upload id (a fingerprint of the source file) to
//! the server session and the chunk indices the server has acknowledged.
//! Saves write a synced sibling temp file and rename it over the original
//! so a crash never leaves a truncated file behind.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use rv_core::{ChunkPlan, SessionId};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Resume record for one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientUploadState {
    pub session_id: SessionId,
    pub source_path: PathBuf,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    #[serde(default)]
    pub accepted_chunks: BTreeSet<u32>,
}

impl ClientUploadState {
    pub fn plan(&self) -> ChunkPlan {
        ChunkPlan {
            total_size: self.file_size,
            chunk_size: self.chunk_size,
            total_chunks: self.total_chunks,
        }
    }

    /// Indices not yet acknowledged, ascending.
    pub fn pending(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.accepted_chunks.contains(i))
            .collect()
    }

    /// Bytes covered by acknowledged chunks.
    pub fn acknowledged_bytes(&self) -> u64 {
        let plan = self.plan();
        self.accepted_chunks
            .iter()
            .filter_map(|&i| plan.chunk_len(i))
            .sum()
    }

    pub fn is_fully_acknowledged(&self) -> bool {
        self.accepted_chunks.len() as u64 == u64::from(self.total_chunks)
    }
}

/// Fingerprint a source file as `name-size-mtime`.
pub fn upload_id_for(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| ClientError::State(format!("{} has no file name", path.display())))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Ok(format!("{name}-{}-{mtime}", meta.len()))
}

#[derive(Debug, Default)]
struct Entries {
    map: BTreeMap<String, ClientUploadState>,
    /// Keys this store has put, updated or removed since loading.
    touched: BTreeSet<String>,
}

/// JSON-file backed map of upload id to [`ClientUploadState`].
///
/// Several client processes may share one file. A save only writes back the
/// entries this store touched, merged into the file's current contents under
/// an exclusive lock on `<file>.lock`.
#[derive(Debug)]
pub struct ClientStateStore {
    path: PathBuf,
    entries: Mutex<Entries>,
    saving: tokio::sync::Mutex<()>,
}

impl ClientStateStore {
    /// Load the store; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let map = read_entries(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(Entries {
                map,
                touched: BTreeSet::new(),
            }),
            saving: tokio::sync::Mutex::new(()),
        })
    }

    /// Merge this store's changes into the file.
    pub async fn save(&self) -> Result<()> {
        // Saves run one at a time so a newer snapshot never lands first.
        let _serial = self.saving.lock().await;
        let changes: Vec<(String, Option<ClientUploadState>)> = {
            let entries = self.entries.lock();
            entries
                .touched
                .iter()
                .map(|k| (k.clone(), entries.map.get(k).cloned()))
                .collect()
        };

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_merged(&path, changes))
            .await
            .map_err(|e| ClientError::State(format!("state writer failed: {e}")))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, upload_id: &str) -> Option<ClientUploadState> {
        self.entries.lock().map.get(upload_id).cloned()
    }

    pub fn put(&self, upload_id: &str, state: ClientUploadState) {
        let mut entries = self.entries.lock();
        entries.map.insert(upload_id.to_string(), state);
        entries.touched.insert(upload_id.to_string());
    }

    pub fn remove(&self, upload_id: &str) -> Option<ClientUploadState> {
        let mut entries = self.entries.lock();
        entries.touched.insert(upload_id.to_string());
        entries.map.remove(upload_id)
    }

    /// Mark one chunk acknowledged; false if the upload is unknown.
    pub fn record_chunk(&self, upload_id: &str, index: u32) -> bool {
        let mut entries = self.entries.lock();
        let Entries { map, touched } = &mut *entries;
        match map.get_mut(upload_id) {
            Some(state) => {
                state.accepted_chunks.insert(index);
                touched.insert(upload_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<(String, ClientUploadState)> {
        self.entries
            .lock()
            .map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, ClientUploadState>> {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
            ClientError::State(format!("corrupt state file {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Re-read the file under the lock, apply `changes`, and replace it with a
/// synced temp file.
fn write_merged(path: &Path, changes: Vec<(String, Option<ClientUploadState>)>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let _lock = lock_exclusive(&path.with_extension("json.lock"))?;

    let mut merged = read_entries(path)?;
    for (key, entry) in changes {
        match entry {
            Some(state) => {
                merged.insert(key, state);
            }
            None => {
                merged.remove(&key);
            }
        }
    }
    let json = serde_json::to_vec_pretty(&merged)
        .map_err(|e| ClientError::State(format!("failed to encode state: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(&json)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn lock_exclusive(path: &Path) -> Result<nix::fcntl::Flock<std::fs::File>> {
    let file = open_lock_file(path)?;
    nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive)
        .map_err(|(_, errno)| ClientError::Io(errno.into()))
}

#[cfg(not(unix))]
fn lock_exclusive(path: &Path) -> Result<std::fs::File> {
    open_lock_file(path)
}

fn open_lock_file(path: &Path) -> Result<std::fs::File> {
    Ok(std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?)
}
