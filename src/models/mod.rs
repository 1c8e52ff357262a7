//! Data models shared across the crate.

mod range;
mod report;

pub use range::*;
pub use report::*;
