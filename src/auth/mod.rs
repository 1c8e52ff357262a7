//! Request authorization against the blob service.

mod shared_key;

pub use shared_key::*;
