//! vhdsync-rs: VHD image decoding and parallel range transfer.
//!
//! This crate decodes Virtual Hard Disk images (fixed, dynamic and
//! differencing), plans the byte ranges that carry data, and moves those
//! ranges between a range-addressable source and a local file with a bounded
//! pool of workers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vhdsync_rs::{download, open_image, plan_ranges, ImageSource, OpenOptions, TransferOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let image = open_image("disk.vhd", &OpenOptions::default())?;
//!     println!("{} data ranges", plan_ranges(&image).len());
//!
//!     let source = Arc::new(ImageSource::new(image));
//!     download(source, "disk.raw", &TransferOptions::default()).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod remote;
pub mod transfer;
pub mod vhd;
pub mod xml;

// Re-exports for convenience
pub use auth::Credential;
pub use config::{Args, ChecksumPolicy, Command, Config, OpenOptions, TransferOptions};
pub use error::{ErrorCode, RangeFailure, SyncError, SyncResult, TransferError};
pub use models::{ImageSummary, IndexRange, TransferOutcome};
pub use remote::{BlobHandle, ImageSource, MemoryBlob, RangeSource};
pub use transfer::{download, download_ranges, ProgressRecord, ProgressStatus, ProgressTracker};
pub use vhd::{
    open_image, open_image_async, plan_empty_ranges, plan_logical_ranges, plan_ranges, DiskType,
    Image, ImageReader,
};
