//! Fixed-size pool of reusable I/O buffers
//!
//! Buffers are handed out as [`PooledBuffer`] guards that go back to the
//! pool when dropped, so early returns and error paths cannot leak pool
//! capacity. An exhausted pool hands out a one-off allocation instead of
//! blocking the event loop.

use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Pool of byte buffers sharing one capacity
#[derive(Debug)]
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Pre-allocate `count` buffers of `buffer_capacity` bytes
    pub fn new(count: usize, buffer_capacity: usize) -> Arc<Self> {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count.max(1) {
            let _ = free.push(Vec::with_capacity(buffer_capacity));
        }
        Arc::new(Self {
            free,
            buffer_capacity,
        })
    }

    /// Borrow an empty buffer
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let bytes = self.free.pop().unwrap_or_else(|| {
            log::debug!("Buffer pool exhausted, allocating a temporary buffer");
            Vec::with_capacity(self.buffer_capacity)
        });
        PooledBuffer {
            bytes,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently available
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    fn recycle(&self, mut bytes: Vec<u8>) {
        bytes.clear();
        if bytes.capacity() > self.buffer_capacity * 2 {
            bytes.shrink_to(self.buffer_capacity);
        }
        // Full means this was a temporary allocation; let it drop.
        let _ = self.free.push(bytes);
    }
}

/// A buffer borrowed from a [`BufferPool`]
#[derive(Debug)]
pub struct PooledBuffer {
    bytes: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let bytes = std::mem::take(&mut self.bytes);
        self.pool.recycle(bytes);
    }
}
