//! VHD footer decoding.

use chrono::{DateTime, Utc};
use std::fmt;
use std::io::{Cursor, Read};
use uuid::Uuid;

use super::field::{ones_complement_checksum, FieldReader};
use crate::error::{SyncError, SyncResult};

pub const FOOTER_SIZE: usize = 512;
pub const FOOTER_COOKIE: [u8; 8] = *b"conectix";

const CHECKSUM_OFFSET: usize = 64;

/// Disk image variant declared by the footer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    /// Dynamic and differencing images carry a header and a BAT.
    pub fn is_sparse(&self) -> bool {
        !matches!(self, DiskType::Fixed)
    }
}

impl TryFrom<u32> for DiskType {
    type Error = SyncError;

    fn try_from(value: u32) -> SyncResult<Self> {
        match value {
            2 => Ok(DiskType::Fixed),
            3 => Ok(DiskType::Dynamic),
            4 => Ok(DiskType::Differencing),
            other => Err(SyncError::malformed(format!(
                "unknown disk type {other}"
            ))),
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiskType::Fixed => "fixed",
            DiskType::Dynamic => "dynamic",
            DiskType::Differencing => "differencing",
        };
        f.write_str(name)
    }
}

/// CHS geometry reported to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

/// The 512-byte trailer present at the end of every image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub cookie: [u8; 8],
    pub features: u32,
    pub format_version: u32,
    /// Absolute offset of the dynamic header, all ones for fixed disks.
    pub data_offset: u64,
    pub timestamp: DateTime<Utc>,
    pub creator_application: String,
    pub creator_version: u32,
    pub creator_host_os: u32,
    pub original_size: u64,
    /// Virtual size of the disk in bytes.
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: DiskType,
    /// Checksum as stored in the image.
    pub checksum: u32,
    /// Checksum recomputed from the decoded bytes.
    pub computed_checksum: u32,
    pub unique_id: Uuid,
    pub saved_state: bool,
}

impl Footer {
    /// Decodes a footer from a stream positioned at its first byte.
    pub fn decode<R: Read>(stream: R) -> SyncResult<Self> {
        let raw: [u8; FOOTER_SIZE] = FieldReader::new(stream, "footer").read_bytes()?;
        Self::parse(&raw)
    }

    /// Decodes a footer from a complete 512-byte record.
    pub fn parse(raw: &[u8; FOOTER_SIZE]) -> SyncResult<Self> {
        let mut r = FieldReader::new(Cursor::new(&raw[..]), "footer");

        let cookie: [u8; 8] = r.read_bytes()?;
        if cookie != FOOTER_COOKIE {
            return Err(SyncError::malformed(format!(
                "footer cookie mismatch: {:?}",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let features = r.read_u32()?;
        let format_version = r.read_u32()?;
        let data_offset = r.read_u64()?;
        let timestamp = r.read_timestamp()?;
        let creator_application = r.read_ascii(4)?;
        let creator_version = r.read_u32()?;
        let creator_host_os = r.read_u32()?;
        let original_size = r.read_u64()?;
        let current_size = r.read_u64()?;
        let geometry = DiskGeometry {
            cylinders: r.read_u16()?,
            heads: r.read_u8()?,
            sectors_per_track: r.read_u8()?,
        };
        let disk_type = DiskType::try_from(r.read_u32()?)?;
        let checksum = r.read_u32()?;
        let unique_id = r.read_uuid()?;
        let saved_state = r.read_u8()? != 0;

        Ok(Self {
            cookie,
            features,
            format_version,
            data_offset,
            timestamp,
            creator_application,
            creator_version,
            creator_host_os,
            original_size,
            current_size,
            geometry,
            disk_type,
            checksum,
            computed_checksum: ones_complement_checksum(raw, CHECKSUM_OFFSET),
            unique_id,
            saved_state,
        })
    }

    pub fn checksum_matches(&self) -> bool {
        self.checksum == self.computed_checksum
    }
}
