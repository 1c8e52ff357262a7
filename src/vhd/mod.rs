//! VHD container decoding: footer, dynamic header, BAT and parent chains.

pub mod bat;
mod driver;
pub mod field;
pub mod footer;
pub mod header;
mod image;
mod planner;
mod reader;

pub use bat::{BlockAllocationTable, UNALLOCATED};
pub use driver::*;
pub use footer::{DiskGeometry, DiskType, Footer, FOOTER_SIZE};
pub use header::{Header, ParentLocator, PlatformCode, HEADER_SIZE, SECTOR_SIZE};
pub use image::{open_image, Image, SparseMetadata};
pub use planner::*;
pub use reader::*;
