use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use crossbeam_queue::ArrayQueue;

const POOL_CAPACITY: usize = 128;

/// Buffers are recycled at this capacity; larger one-off reads shrink back.
pub const BUFFER_SIZE: usize = 64 * 1024;

pub static GLOBAL_BUFFER_POOL: LazyLock<Arc<BufferPool>> =
    LazyLock::new(|| Arc::new(BufferPool::default()));

/// A pooled `Vec<u8>` that returns itself to the pool on drop.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    inner: ManuallyDrop<Vec<u8>>,
}

impl PooledBuffer {
    fn new(pool: Arc<BufferPool>, vec: Vec<u8>) -> Self {
        Self {
            pool,
            inner: ManuallyDrop::new(vec),
        }
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // SAFETY: inner is never accessed after this
        let vec = unsafe { ManuallyDrop::take(&mut self.inner) };
        self.pool.return_buffer(vec);
    }
}

/// Bounded pool of read buffers so the per-connection reader does not
/// allocate for every frame.
#[derive(Debug)]
pub struct BufferPool {
    buffers: ArrayQueue<Vec<u8>>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
        }
    }

    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let vec = self
            .buffers
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BUFFER_SIZE));
        PooledBuffer::new(Arc::clone(self), vec)
    }

    pub fn return_buffer(&self, mut vec: Vec<u8>) {
        vec.clear();
        vec.shrink_to(BUFFER_SIZE);
        // Ignore if pool is full
        let _ = self.buffers.push(vec);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(POOL_CAPACITY)
    }
}
