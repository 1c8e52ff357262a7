//! Dynamic disk header decoding.

use chrono::{DateTime, Utc};
use std::io::{Cursor, Read};
use uuid::Uuid;

use super::field::{decode_utf16, ones_complement_checksum, FieldReader};
use crate::error::{SyncError, SyncResult};

pub const HEADER_SIZE: usize = 1024;
pub const HEADER_COOKIE: [u8; 8] = *b"cxsparse";
pub const PARENT_LOCATOR_COUNT: usize = 8;
pub const SECTOR_SIZE: u64 = 512;

const CHECKSUM_OFFSET: usize = 36;
const PARENT_NAME_SIZE: usize = 512;

/// Encoding of a parent locator's platform data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformCode {
    None,
    /// Deprecated relative ASCII path.
    Wi2r,
    /// Deprecated absolute ASCII path.
    Wi2k,
    /// Relative UTF-16LE path.
    W2ru,
    /// Absolute UTF-16LE path.
    W2ku,
    /// Mac OS alias blob.
    Mac,
    /// UTF-8 file URL.
    MacX,
    Unknown(u32),
}

impl From<u32> for PlatformCode {
    fn from(value: u32) -> Self {
        match &value.to_be_bytes() {
            [0, 0, 0, 0] => PlatformCode::None,
            b"Wi2r" => PlatformCode::Wi2r,
            b"Wi2k" => PlatformCode::Wi2k,
            b"W2ru" => PlatformCode::W2ru,
            b"W2ku" => PlatformCode::W2ku,
            b"Mac " => PlatformCode::Mac,
            b"MacX" => PlatformCode::MacX,
            _ => PlatformCode::Unknown(value),
        }
    }
}

/// One of the eight parent locator slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentLocator {
    pub platform_code: PlatformCode,
    /// Sectors reserved for the locator data.
    pub data_space: u32,
    /// Bytes of locator data actually used.
    pub data_length: u32,
    /// Absolute file offset of the locator data.
    pub data_offset: u64,
}

impl ParentLocator {
    fn decode<R: Read>(r: &mut FieldReader<R>) -> SyncResult<Self> {
        let platform_code = PlatformCode::from(r.read_u32()?);
        let data_space = r.read_u32()?;
        let data_length = r.read_u32()?;
        r.skip(4)?;
        let data_offset = r.read_u64()?;
        Ok(Self {
            platform_code,
            data_space,
            data_length,
            data_offset,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.platform_code == PlatformCode::None || self.data_length == 0
    }

    /// Decodes the locator data bytes read from `data_offset` into a path.
    pub fn decode_path(&self, data: &[u8]) -> SyncResult<String> {
        let path = match self.platform_code {
            PlatformCode::W2ru | PlatformCode::W2ku => decode_utf16(data, u16::from_le_bytes),
            PlatformCode::Wi2r | PlatformCode::Wi2k => data
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect(),
            PlatformCode::MacX => {
                let url = String::from_utf8_lossy(data);
                let url = url.trim_end_matches('\0');
                url.strip_prefix("file://").unwrap_or(url).to_string()
            }
            other => {
                return Err(SyncError::malformed(format!(
                    "unsupported parent locator platform {other:?}"
                )))
            }
        };
        Ok(path)
    }
}

/// Extended header present on dynamic and differencing disks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub cookie: [u8; 8],
    pub data_offset: u64,
    /// Absolute offset of the block allocation table.
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub computed_checksum: u32,
    pub parent_unique_id: Uuid,
    pub parent_timestamp: DateTime<Utc>,
    /// Parent file name as stored in the header.
    pub parent_path: String,
    pub parent_locators: Vec<ParentLocator>,
}

impl Header {
    /// Decodes a header from a stream positioned at its first byte.
    pub fn decode<R: Read>(stream: R) -> SyncResult<Self> {
        let raw: [u8; HEADER_SIZE] = FieldReader::new(stream, "dynamic header").read_bytes()?;
        Self::parse(&raw)
    }

    /// Decodes a header from a complete 1024-byte record.
    pub fn parse(raw: &[u8; HEADER_SIZE]) -> SyncResult<Self> {
        let mut r = FieldReader::new(Cursor::new(&raw[..]), "dynamic header");

        let cookie: [u8; 8] = r.read_bytes()?;
        if cookie != HEADER_COOKIE {
            return Err(SyncError::malformed(format!(
                "dynamic header cookie mismatch: {:?}",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let data_offset = r.read_u64()?;
        let table_offset = r.read_u64()?;
        let header_version = r.read_u32()?;
        let max_table_entries = r.read_u32()?;
        let block_size = r.read_u32()?;
        let checksum = r.read_u32()?;
        let parent_unique_id = r.read_uuid()?;
        let parent_timestamp = r.read_timestamp()?;
        r.skip(4)?;
        let parent_path = r.read_utf16_be(PARENT_NAME_SIZE)?;
        let parent_locators = (0..PARENT_LOCATOR_COUNT)
            .map(|_| ParentLocator::decode(&mut r))
            .collect::<SyncResult<Vec<_>>>()?;

        if table_offset == u64::MAX || table_offset % SECTOR_SIZE != 0 {
            return Err(SyncError::malformed(format!(
                "invalid table offset {table_offset:#x}"
            )));
        }
        if max_table_entries == 0 {
            return Err(SyncError::malformed("max table entries is zero"));
        }
        if !block_size.is_power_of_two() || (block_size as u64) < SECTOR_SIZE {
            return Err(SyncError::malformed(format!(
                "block size {block_size} is not a power of two of at least one sector"
            )));
        }

        Ok(Self {
            cookie,
            data_offset,
            table_offset,
            header_version,
            max_table_entries,
            block_size,
            checksum,
            computed_checksum: ones_complement_checksum(raw, CHECKSUM_OFFSET),
            parent_unique_id,
            parent_timestamp,
            parent_path,
            parent_locators,
        })
    }

    pub fn checksum_matches(&self) -> bool {
        self.checksum == self.computed_checksum
    }

    /// Bytes of sector bitmap stored in front of each allocated block.
    pub fn bitmap_size(&self) -> u64 {
        let sectors = self.block_size as u64 / SECTOR_SIZE;
        sectors.div_ceil(8).div_ceil(SECTOR_SIZE) * SECTOR_SIZE
    }

    /// Non-empty locators, in slot order.
    pub fn locators(&self) -> impl Iterator<Item = &ParentLocator> {
        self.parent_locators.iter().filter(|l| !l.is_empty())
    }

    pub fn relative_locator(&self) -> Option<&ParentLocator> {
        self.locator_for(&[PlatformCode::W2ru, PlatformCode::Wi2r])
    }

    pub fn absolute_locator(&self) -> Option<&ParentLocator> {
        self.locator_for(&[PlatformCode::W2ku, PlatformCode::Wi2k, PlatformCode::MacX])
    }

    fn locator_for(&self, preference: &[PlatformCode]) -> Option<&ParentLocator> {
        preference
            .iter()
            .find_map(|code| self.locators().find(|l| l.platform_code == *code))
    }
}
