//! Byte-range-addressable sources for the transfer engine.

mod blob;
mod local;
mod memory;

pub use blob::*;
pub use local::*;
pub use memory::*;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::SyncResult;
use crate::models::IndexRange;

/// Stream over the bytes of one requested range.
pub type RangeReader = Box<dyn AsyncRead + Send + Unpin>;

/// A read-only, range-addressable view of a blob or image.
///
/// Implementations are shared across transfer workers and must not hold
/// per-read state.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Total length in bytes.
    fn length(&self) -> u64;

    /// Sorted, non-overlapping ranges that carry data. Everything else is zero.
    async fn ranges(&self) -> SyncResult<Vec<IndexRange>>;

    /// Opens a stream over `range`. The stream may return short reads.
    async fn open_range(&self, range: IndexRange) -> SyncResult<RangeReader>;
}
