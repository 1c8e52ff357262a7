//! Block allocation table decoding.

use std::io::Read;

use super::field::FieldReader;
use super::header::SECTOR_SIZE;
use crate::error::{SyncError, SyncResult};

/// BAT value marking a block with no data on disk.
pub const UNALLOCATED: u32 = 0xFFFF_FFFF;

// Refuse tables that would need more than 128 MiB of entries.
const MAX_TABLE_BYTES: u64 = 128 * 1024 * 1024;

/// Per-block sector offsets of a dynamic or differencing disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAllocationTable {
    entries: Vec<u32>,
    block_size: u32,
}

impl BlockAllocationTable {
    /// Decodes `max_entries` entries and checks that they cover `virtual_size`.
    pub fn decode<R: Read>(
        stream: R,
        max_entries: u32,
        block_size: u32,
        virtual_size: u64,
    ) -> SyncResult<Self> {
        Self::check_sizing(max_entries, block_size, virtual_size)?;

        let mut r = FieldReader::new(stream, "block allocation table");
        let entries = (0..max_entries)
            .map(|_| r.read_u32())
            .collect::<SyncResult<Vec<_>>>()?;

        Ok(Self {
            entries,
            block_size,
        })
    }

    /// Validates the table dimensions before anything is read.
    pub fn check_sizing(max_entries: u32, block_size: u32, virtual_size: u64) -> SyncResult<()> {
        if block_size == 0 {
            return Err(SyncError::malformed("block size is zero"));
        }
        let required = virtual_size.div_ceil(block_size as u64);
        if (max_entries as u64) < required {
            return Err(SyncError::malformed(format!(
                "table has {max_entries} entries but {required} blocks are needed for {virtual_size} bytes"
            )));
        }
        if max_entries as u64 * 4 > MAX_TABLE_BYTES {
            return Err(SyncError::malformed(format!(
                "table of {max_entries} entries is too large"
            )));
        }
        Ok(())
    }

    /// Bytes occupied by the table on disk, padded to whole sectors.
    pub fn table_size(max_entries: u32) -> u64 {
        (max_entries as u64 * 4).div_ceil(SECTOR_SIZE) * SECTOR_SIZE
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn entries(&self) -> &[u32] {
        &self.entries
    }

    /// Sector offset of the block, or `None` when it is unallocated.
    pub fn block_sector(&self, block: usize) -> Option<u32> {
        self.entries
            .get(block)
            .copied()
            .filter(|&sector| sector != UNALLOCATED)
    }

    pub fn is_allocated(&self, block: usize) -> bool {
        self.block_sector(block).is_some()
    }

    /// Indices of allocated blocks in ascending order.
    pub fn allocated_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, &sector)| sector != UNALLOCATED)
            .map(|(i, _)| i)
    }
}
