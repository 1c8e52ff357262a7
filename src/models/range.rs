//! Byte range model shared by the planner and the transfer engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A half-open byte interval `[start_index, start_index + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexRange {
    /// First byte offset (inclusive).
    pub start_index: u64,
    /// Number of bytes.
    pub length: u64,
}

impl IndexRange {
    pub fn new(start_index: u64, length: u64) -> Self {
        Self {
            start_index,
            length,
        }
    }

    /// Builds a range from an inclusive `[start, end]` pair as used by page lists.
    ///
    /// Returns `None` when `end < start` or the exclusive end does not fit in a `u64`.
    pub fn from_inclusive(start: u64, end: u64) -> Option<Self> {
        let length = end.checked_sub(start)?.checked_add(1)?;
        start.checked_add(length)?;
        Some(Self::new(start, length))
    }

    /// Exclusive end offset, or `None` if it overflows.
    pub fn checked_end(&self) -> Option<u64> {
        self.start_index.checked_add(self.length)
    }

    /// Exclusive end offset, saturating at `u64::MAX`.
    pub fn end_index(&self) -> u64 {
        self.start_index.saturating_add(self.length)
    }

    /// Inclusive last byte offset, the form used in `x-ms-range` headers.
    pub fn last_index(&self) -> u64 {
        self.end_index().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start_index && offset < self.end_index()
    }
}

impl fmt::Display for IndexRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start_index, self.end_index())
    }
}

/// Sorts ranges and coalesces the ones that overlap or touch.
pub fn merge_ranges(ranges: impl IntoIterator<Item = IndexRange>) -> Vec<IndexRange> {
    let mut sorted: Vec<IndexRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
    sorted.sort();

    let mut merged: Vec<IndexRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.start_index <= last.end_index() => {
                let end = last.end_index().max(range.end_index());
                last.length = end - last.start_index;
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Ranges in `[0, total)` not covered by the sorted, merged `ranges`.
pub fn complement_ranges(ranges: &[IndexRange], total: u64) -> Vec<IndexRange> {
    let mut gaps = Vec::new();
    let mut cursor = 0u64;
    for range in ranges {
        let start = range.start_index.min(total);
        if start > cursor {
            gaps.push(IndexRange::new(cursor, start - cursor));
        }
        cursor = cursor.max(range.end_index().min(total));
    }
    if cursor < total {
        gaps.push(IndexRange::new(cursor, total - cursor));
    }
    gaps
}

/// Splits every range into pieces of at most `max_size` bytes.
pub fn chunk_ranges(ranges: &[IndexRange], max_size: u64) -> Vec<IndexRange> {
    if max_size == 0 {
        return ranges.to_vec();
    }
    let mut chunks = Vec::new();
    for range in ranges {
        let mut start = range.start_index;
        let end = range.end_index();
        while start < end {
            let len = (end - start).min(max_size);
            chunks.push(IndexRange::new(start, len));
            start += len;
        }
    }
    chunks
}

/// Sum of the lengths of `ranges`.
pub fn total_length(ranges: &[IndexRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}
