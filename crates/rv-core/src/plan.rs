//! Fixed-size chunk layout of an upload.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::{Error, Result};

/// How a file of `total_size` bytes is cut into `chunk_size` slices.
///
/// Every slice is `chunk_size` bytes except the last, which holds the
/// remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl ChunkPlan {
    /// Build a plan; both sizes must be non-zero.
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self> {
        if total_size == 0 {
            return Err(Error::Validation("file size must be greater than zero".into()));
        }
        if chunk_size == 0 {
            return Err(Error::Validation("chunk size must be greater than zero".into()));
        }
        let chunks = total_size.div_ceil(chunk_size);
        let total_chunks = u32::try_from(chunks).map_err(|_| {
            Error::Validation(format!(
                "{chunks} chunks exceeds the supported chunk count; use a larger chunk size"
            ))
        })?;
        Ok(Self {
            total_size,
            chunk_size,
            total_chunks,
        })
    }

    /// Byte range of chunk `index` within the final artifact.
    pub fn range(&self, index: u32) -> Option<Range<u64>> {
        if index >= self.total_chunks {
            return None;
        }
        let start = u64::from(index) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        Some(start..end)
    }

    /// Expected payload length of chunk `index`.
    pub fn chunk_len(&self, index: u32) -> Option<u64> {
        self.range(index).map(|r| r.end - r.start)
    }

    pub fn indices(&self) -> Range<u32> {
        0..self.total_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_megabytes_in_one_megabyte_chunks() {
        let plan = ChunkPlan::new(10 * 1024 * 1024, 1024 * 1024).unwrap();
        assert_eq!(plan.total_chunks, 10);
        assert_eq!(plan.chunk_len(9), Some(1024 * 1024));
    }

    #[test]
    fn last_chunk_holds_remainder() {
        let plan = ChunkPlan::new(1000, 300).unwrap();
        assert_eq!(plan.total_chunks, 4);
        assert_eq!(plan.range(3), Some(900..1000));
        assert_eq!(plan.chunk_len(3), Some(100));
        assert_eq!(plan.range(4), None);
    }

    #[test]
    fn chunk_larger_than_file() {
        let plan = ChunkPlan::new(10, 4096).unwrap();
        assert_eq!(plan.total_chunks, 1);
        assert_eq!(plan.range(0), Some(0..10));
    }

    #[test]
    fn zero_sizes_rejected() {
        assert!(ChunkPlan::new(0, 10).is_err());
        assert!(ChunkPlan::new(10, 0).is_err());
    }
}
