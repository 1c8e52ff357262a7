//! Serializable summaries of images and transfers.

use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::vhd::{plan_ranges, Image};

/// Result of a transfer in which every range succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    /// Bytes written to the destination.
    pub bytes_transferred: u64,
    /// Ranges written, after splitting to the maximum range size.
    pub ranges_transferred: usize,
    /// Length of the destination file.
    pub total_length: u64,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Printable description of an image and its parent chain.
#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub path: String,
    pub disk_type: String,
    pub virtual_size: u64,
    pub unique_id: Uuid,
    pub creator_application: String,
    pub footer_checksum_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_blocks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_checksum_ok: Option<bool>,
    pub data_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ImageSummary>>,
}

impl From<&Image> for ImageSummary {
    fn from(image: &Image) -> Self {
        let footer = image.footer();
        Self {
            path: image.path().display().to_string(),
            disk_type: footer.disk_type.to_string(),
            virtual_size: footer.current_size,
            unique_id: footer.unique_id,
            creator_application: footer.creator_application.clone(),
            footer_checksum_ok: footer.checksum_matches(),
            block_size: image.header().map(|h| h.block_size),
            allocated_blocks: image.bat().map(|b| b.allocated_blocks().count()),
            header_checksum_ok: image.header().map(|h| h.checksum_matches()),
            data_bytes: plan_ranges(image).iter().map(|r| r.length).sum(),
            parent: image.parent().map(|p| Box::new(ImageSummary::from(p))),
        }
    }
}
