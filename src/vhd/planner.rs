//! Range planning over a decoded image.

use super::image::Image;
use crate::models::{complement_ranges, merge_ranges, IndexRange};

/// Byte ranges of the virtual disk that hold data in this image.
///
/// Fixed images yield one range over the whole disk. Sparse images yield one
/// range per allocated block, clipped to the virtual size, with contiguous
/// blocks merged. Parent images are not consulted.
pub fn plan_ranges(image: &Image) -> Vec<IndexRange> {
    let size = image.virtual_size();
    let Some(bat) = image.bat() else {
        return if size == 0 {
            Vec::new()
        } else {
            vec![IndexRange::new(0, size)]
        };
    };

    let block_size = bat.block_size() as u64;
    let blocks = bat.allocated_blocks().filter_map(|block| {
        let start = block as u64 * block_size;
        if start >= size {
            return None;
        }
        Some(IndexRange::new(start, block_size.min(size - start)))
    });
    merge_ranges(blocks)
}

/// Byte ranges of the virtual disk known to be empty in this image.
pub fn plan_empty_ranges(image: &Image) -> Vec<IndexRange> {
    complement_ranges(&plan_ranges(image), image.virtual_size())
}

/// Data ranges of the logical disk: this image's ranges united with those of
/// every ancestor, clipped to this image's virtual size.
pub fn plan_logical_ranges(image: &Image) -> Vec<IndexRange> {
    let size = image.virtual_size();
    let all = std::iter::once(image)
        .chain(image.ancestors())
        .flat_map(plan_ranges)
        .filter(|r| r.start_index < size)
        .map(|r| IndexRange::new(r.start_index, r.length.min(size - r.start_index)));
    merge_ranges(all)
}
