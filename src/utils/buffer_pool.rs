//! # Buffer Pool
//!
//! Bounded free-list of large buffers for messages that do not fit in a
//! connection's local read or write buffer.
//!
//! Every pooled buffer has a capacity of exactly the maximum envelope size.
//! The pool keeps at most `depth` idle buffers; anything beyond that is
//! dropped on release and reallocated on demand.
//!
//! ## Usage
//! ```rust
//! use peernet::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(4, 64 * 1024);
//! let buffer = pool.acquire();
//! assert_eq!(buffer.capacity(), 64 * 1024);
//! // Use buffer...
//! assert!(pool.release(buffer));
//! ```

use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Default number of idle buffers kept around
pub const DEFAULT_POOL_DEPTH: usize = 8;

/// Thread-safe pool of fixed-size buffers
#[derive(Debug)]
pub struct BufferPool {
    idle: ArrayQueue<BytesMut>,
    buffer_size: usize,
    allocations: AtomicU64,
}

impl BufferPool {
    /// Create an empty pool holding at most `depth` idle buffers of `buffer_size` bytes
    pub fn new(depth: usize, buffer_size: usize) -> Self {
        Self {
            idle: ArrayQueue::new(depth.max(1)),
            buffer_size,
            allocations: AtomicU64::new(0),
        }
    }

    /// Capacity of every buffer handed out by this pool
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take an idle buffer, or allocate a fresh one if the pool is empty
    pub fn acquire(&self) -> BytesMut {
        match self.idle.pop() {
            Some(buffer) => buffer,
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                trace!(size = self.buffer_size, "Allocating pooled buffer");
                BytesMut::with_capacity(self.buffer_size)
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer is cleared first. Buffers whose capacity no longer equals
    /// the pool size are discarded, as are buffers released into a full pool.
    /// Returns whether the buffer was kept.
    pub fn release(&self, mut buffer: BytesMut) -> bool {
        buffer.clear();
        // Reclaims space consumed by earlier `split_to` calls when unique.
        buffer.reserve(self.buffer_size);
        if buffer.capacity() != self.buffer_size {
            trace!(
                capacity = buffer.capacity(),
                expected = self.buffer_size,
                "Discarding mis-sized buffer"
            );
            return false;
        }
        self.idle.push(buffer).is_ok()
    }

    /// Number of idle buffers currently held
    pub fn available(&self) -> usize {
        self.idle.len()
    }

    /// Total buffers allocated because the pool was empty
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_basic() {
        let pool = BufferPool::new(2, 1024);
        assert_eq!(pool.available(), 0);

        let mut buf = pool.acquire();
        assert_eq!(buf.capacity(), 1024);
        buf.extend_from_slice(&[42; 10]);

        assert!(pool.release(buf));
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.allocations(), 1);
    }

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(1, 256);

        let mut buf = pool.acquire();
        buf.extend_from_slice(b"test");
        pool.release(buf);

        // Buffer should be returned and cleared
        let buf2 = pool.acquire();
        assert_eq!(buf2.len(), 0);
        assert_eq!(buf2.capacity(), 256);
        assert_eq!(pool.allocations(), 1);
    }

    #[test]
    fn test_buffer_pool_empty() {
        let pool = BufferPool::new(1, 64);
        let _buf1 = pool.acquire();
        let _buf2 = pool.acquire(); // Should allocate new

        assert_eq!(pool.available(), 0);
        assert_eq!(pool.allocations(), 2);
    }

    #[test]
    fn test_mis_sized_buffer_rejected() {
        let pool = BufferPool::new(2, 128);
        let foreign = BytesMut::with_capacity(4096);
        assert!(!pool.release(foreign));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_pool_depth_bound() {
        let pool = BufferPool::new(1, 32);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(pool.release(a));
        assert!(!pool.release(b));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_release_after_split_reclaims_capacity() {
        let pool = BufferPool::new(1, 64);
        let mut buf = pool.acquire();
        buf.extend_from_slice(&[1u8; 40]);
        let head = buf.split_to(40);
        drop(head);
        assert!(pool.release(buf));
        assert_eq!(pool.acquire().capacity(), 64);
    }
}
