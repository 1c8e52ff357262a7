//! Range source over a local image's logical contents.

use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;

use super::{RangeReader, RangeSource};
use crate::error::{ErrorCode, SyncError, SyncResult};
use crate::models::IndexRange;
use crate::vhd::{plan_logical_ranges, Image, ImageReader};

/// Exposes the virtual disk of an opened image (and its parents) as ranges,
/// so the transfer engine can flatten it into a raw file.
#[derive(Debug, Clone)]
pub struct ImageSource {
    image: Arc<Image>,
    ranges: Vec<IndexRange>,
}

impl ImageSource {
    pub fn new(image: Image) -> Self {
        let ranges = plan_logical_ranges(&image);
        Self {
            image: Arc::new(image),
            ranges,
        }
    }

    pub fn image(&self) -> &Image {
        &self.image
    }
}

#[async_trait]
impl RangeSource for ImageSource {
    fn length(&self) -> u64 {
        self.image.virtual_size()
    }

    async fn ranges(&self) -> SyncResult<Vec<IndexRange>> {
        Ok(self.ranges.clone())
    }

    async fn open_range(&self, range: IndexRange) -> SyncResult<RangeReader> {
        let image = Arc::clone(&self.image);
        let data = tokio::task::spawn_blocking(move || -> SyncResult<Vec<u8>> {
            let mut buf = vec![0u8; range.length as usize];
            ImageReader::open(&image)?.read_at(range.start_index, &mut buf)?;
            Ok(buf)
        })
        .await
        .map_err(|e| SyncError::with_message(ErrorCode::Io, format!("image read task failed: {e}")))??;
        Ok(Box::new(Cursor::new(data)))
    }
}
