//! XML response parsing for the blob service.

pub mod deserialize;

pub use deserialize::*;
