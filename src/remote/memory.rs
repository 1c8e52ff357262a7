//! In-memory range source.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use tokio_util::io::StreamReader;

use super::{RangeReader, RangeSource};
use crate::error::{ErrorCode, SyncError, SyncResult};
use crate::models::{merge_ranges, IndexRange};

/// Page granularity used when deriving ranges from content.
pub const PAGE_SIZE: u64 = 512;

/// Default size of the pieces a [`MemoryBlob`] stream hands out per read.
const DEFAULT_READ_CHUNK: usize = 64 * 1024;

/// A blob held in memory, exposing ranges the way a page blob would.
#[derive(Debug, Clone)]
pub struct MemoryBlob {
    data: Bytes,
    ranges: Vec<IndexRange>,
    read_chunk: usize,
}

impl MemoryBlob {
    /// Wraps `data`, reporting every 512-byte page with a non-zero byte as data.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let pages = data
            .chunks(PAGE_SIZE as usize)
            .enumerate()
            .filter(|(_, page)| page.iter().any(|&b| b != 0))
            .map(|(i, page)| IndexRange::new(i as u64 * PAGE_SIZE, page.len() as u64));
        let ranges = merge_ranges(pages);
        Self {
            data,
            ranges,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }

    /// Replaces the reported ranges.
    pub fn with_ranges(mut self, ranges: Vec<IndexRange>) -> Self {
        self.ranges = merge_ranges(ranges);
        self
    }

    /// Sets the largest piece a single read returns.
    pub fn with_read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

#[async_trait]
impl RangeSource for MemoryBlob {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    async fn ranges(&self) -> SyncResult<Vec<IndexRange>> {
        Ok(self.ranges.clone())
    }

    async fn open_range(&self, range: IndexRange) -> SyncResult<RangeReader> {
        if range.end_index() > self.length() {
            return Err(SyncError::with_message(
                ErrorCode::InvalidInput,
                format!("range {range} exceeds blob length {}", self.length()),
            ));
        }
        let slice = self
            .data
            .slice(range.start_index as usize..range.end_index() as usize);

        let step = self.read_chunk;
        let pieces: Vec<std::io::Result<Bytes>> = (0..slice.len())
            .step_by(step)
            .map(|start| Ok(slice.slice(start..(start + step).min(slice.len()))))
            .collect();
        Ok(Box::new(StreamReader::new(stream::iter(pieces))))
    }
}
