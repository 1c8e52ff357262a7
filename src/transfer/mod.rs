//! Bounded parallel range transfer.

mod buffer_pool;
mod engine;
mod progress;

pub use buffer_pool::*;
pub use engine::*;
pub use progress::*;
