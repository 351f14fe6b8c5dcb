//! Scratch chunk storage and artifact assembly.
//!
//! Each accepted chunk lives in `<scratch>/chunk_<index>.part`. Writes go
//! through a uniquely named temp file and a rename, so a reader never sees a
//! half-written chunk and re-accepting an index simply replaces it. A
//! payload of the wrong length never reaches the final name.

use std::path::{Path, PathBuf};

use rv_core::{ChunkPlan, Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

/// Copy buffer used while concatenating chunks.
const ASSEMBLY_BUFFER: usize = 1024 * 1024;

pub fn chunk_path(scratch_dir: &Path, index: u32) -> PathBuf {
    scratch_dir.join(format!("chunk_{index}.part"))
}

/// Persist one chunk payload of exactly `expected` bytes, replacing any
/// earlier copy of the same index.
pub async fn write_chunk<R>(
    scratch_dir: &Path,
    index: u32,
    body: R,
    expected: u64,
) -> Result<PathBuf>
where
    R: AsyncRead + Unpin,
{
    let target = chunk_path(scratch_dir, index);
    let tmp = scratch_dir.join(format!("chunk_{index}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let written = async {
        let mut file = tokio::fs::File::create(&tmp).await?;
        // One byte past the expected length is enough to detect an overlong body.
        let copied = tokio::io::copy(&mut body.take(expected + 1), &mut file).await?;
        if copied != expected {
            return Ok(Some(copied));
        }
        file.sync_data().await?;
        drop(file);
        tokio::fs::rename(&tmp, &target).await?;
        Ok::<_, std::io::Error>(None)
    };

    match written.await {
        Ok(None) => Ok(target),
        Ok(Some(copied)) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            let got = if copied > expected {
                "more".to_string()
            } else {
                copied.to_string()
            };
            Err(Error::Validation(format!(
                "chunk {index} must be {expected} bytes, got {got}"
            )))
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e.into())
        }
    }
}

/// Concatenate every chunk of `plan` in index order into `dest`.
///
/// Streams through `<dest>.partial` with a bounded buffer, fsyncs, renames
/// and finally checks the artifact is exactly `plan.total_size` bytes.
pub async fn assemble(scratch_dir: &Path, plan: &ChunkPlan, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Internal(format!("invalid artifact path {}", dest.display())))?;
    let partial = dest.with_file_name(format!("{file_name}.partial"));

    let result = concat_into(scratch_dir, plan, &partial).await;
    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }

    tokio::fs::rename(&partial, dest).await?;

    let size = tokio::fs::metadata(dest).await?.len();
    if size != plan.total_size {
        let _ = tokio::fs::remove_file(dest).await;
        return Err(Error::Internal(format!(
            "assembled {size} bytes for {}, expected {}",
            dest.display(),
            plan.total_size
        )));
    }
    Ok(size)
}

async fn concat_into(scratch_dir: &Path, plan: &ChunkPlan, partial: &Path) -> Result<()> {
    let mut out = tokio::fs::File::create(partial).await?;

    for index in plan.indices() {
        let path = chunk_path(scratch_dir, index);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            Error::Internal(format!("chunk {index} unreadable at {}: {e}", path.display()))
        })?;

        let expected = plan.chunk_len(index).unwrap_or(0);
        let mut reader = BufReader::with_capacity(ASSEMBLY_BUFFER, file);
        let copied = tokio::io::copy_buf(&mut reader, &mut out).await?;
        if copied != expected {
            return Err(Error::Internal(format!(
                "chunk {index} holds {copied} bytes, expected {expected}"
            )));
        }
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok(())
}

/// Remove a directory tree, treating "already gone" as success.
pub async fn remove_dir_if_exists(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
