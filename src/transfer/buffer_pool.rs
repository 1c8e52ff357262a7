//! Size-classed buffer pool shared by transfer workers.

use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Smallest size class handed out.
const MIN_CLASS: usize = 4 * 1024;

/// Default number of idle buffers kept per size class.
pub const DEFAULT_BUFFERS_PER_CLASS: usize = 16;

/// Pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers allocated because the class had none idle.
    pub allocations: u64,
    /// Buffers served from the idle list.
    pub reuses: u64,
}

/// Thread-safe pool of byte buffers keyed by power-of-two size class.
pub struct BufferPool {
    classes: DashMap<usize, Vec<Vec<u8>>>,
    max_per_class: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
}

impl BufferPool {
    pub fn new(max_per_class: usize) -> Arc<Self> {
        Arc::new(Self {
            classes: DashMap::new(),
            max_per_class,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        })
    }

    /// Size class serving a request of `len` bytes.
    #[inline]
    pub fn class_of(len: usize) -> usize {
        len.max(MIN_CLASS).next_power_of_two()
    }

    /// Takes a buffer of exactly `len` visible bytes. Contents are unspecified.
    pub fn take(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let class = Self::class_of(len);
        let reused = self.classes.get_mut(&class).and_then(|mut idle| idle.pop());
        let buf = match reused {
            Some(buf) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; class]
            }
        };
        PooledBuffer {
            buf,
            len,
            pool: Arc::clone(self),
        }
    }

    fn give_back(&self, buf: Vec<u8>) {
        let class = buf.len();
        let mut idle = self.classes.entry(class).or_default();
        if idle.len() < self.max_per_class {
            idle.push(buf);
        }
    }

    /// Idle buffers currently held for `class`.
    pub fn idle(&self, class: usize) -> usize {
        self.classes.get(&class).map_or(0, |idle| idle.len())
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self {
            classes: DashMap::new(),
            max_per_class: DEFAULT_BUFFERS_PER_CLASS,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
        }
    }
}

/// A buffer on loan from a [`BufferPool`]; returned when dropped.
pub struct PooledBuffer {
    buf: Vec<u8>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}
