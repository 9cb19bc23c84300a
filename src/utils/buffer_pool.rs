//! # Buffer Pool
//!
//! Object pool for frame encoding buffers, so a busy server does not allocate a fresh
//! `Vec` for every outgoing packet.
//!
//! ## Usage
//! ```rust,no_run
//! use tiered_link::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(16);
//! let mut buffer = pool.acquire();
//! buffer.extend_from_slice(b"frame bytes");
//! // Buffer automatically returned to pool on drop
//! ```

use parking_lot::Mutex;
use std::sync::Arc;

/// Default cap on the capacity of a buffer that may be returned to the pool (4 MiB,
/// enough for a 1 MiB chunk frame in any supported format).
pub const DEFAULT_MAX_POOLED_CAPACITY: usize = 4 * 1024 * 1024;

/// Default buffer capacity
const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// A pooled buffer that returns itself to the pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    max_pooled_capacity: usize,
}

impl PooledBuffer {
    /// Copy the contents out, leaving the buffer to return to the pool
    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.clone()
    }

    /// Take the underlying buffer; it will not return to the pool
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let capacity = self.buffer.capacity();
        if capacity > 0 && capacity <= self.max_pooled_capacity {
            self.buffer.clear(); // Clear data but keep capacity
            self.pool.lock().push(std::mem::take(&mut self.buffer));
        }
        // Otherwise, let it be deallocated
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

/// Thread-safe buffer pool
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<Vec<Vec<u8>>>>,
    initial_capacity: usize,
    max_pooled_capacity: usize,
}

impl BufferPool {
    /// Create a new buffer pool with specified initial pool size
    pub fn new(pool_size: usize) -> Self {
        Self::with_limits(pool_size, DEFAULT_MAX_POOLED_CAPACITY)
    }

    /// Create a pool that keeps buffers up to `max_pooled_capacity` bytes
    pub fn with_limits(pool_size: usize, max_pooled_capacity: usize) -> Self {
        let pool = (0..pool_size)
            .map(|_| Vec::with_capacity(DEFAULT_BUFFER_CAPACITY))
            .collect();

        Self {
            pool: Arc::new(Mutex::new(pool)),
            initial_capacity: DEFAULT_BUFFER_CAPACITY,
            max_pooled_capacity,
        }
    }

    /// Acquire a buffer from the pool (or allocate a new one if pool is empty)
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .pool
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));

        PooledBuffer {
            buffer,
            pool: self.pool.clone(),
            max_pooled_capacity: self.max_pooled_capacity,
        }
    }

    /// Get the current number of available buffers in the pool
    pub fn available(&self) -> usize {
        self.pool.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(32)
    }
}
