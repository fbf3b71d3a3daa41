// Pooled read buffers for the listener pumps.

use bytes::BytesMut;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::protocol::MIN_READ_SIZE;

const DEFAULT_MAX_BUFFERS: usize = 32;

/// Reuses `BytesMut` allocations across connections instead of allocating a
/// fresh read buffer per pump iteration.
#[derive(Clone)]
pub struct BufferPool {
    buffers: Arc<Mutex<VecDeque<BytesMut>>>,
    buffer_size: usize,
    max_buffers: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        BufferPool {
            buffers: Arc::new(Mutex::new(VecDeque::with_capacity(max_buffers))),
            buffer_size,
            max_buffers,
        }
    }

    /// Takes a cleared buffer from the pool, or allocates one if the pool is
    /// empty.
    pub fn acquire(&self) -> BytesMut {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .pop_front()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// Returns a buffer to the pool. Buffers beyond `max_buffers` are dropped.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < self.max_buffers {
            buffers.push_back(buf);
        }
    }

    /// Number of idle buffers currently held.
    pub fn count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::new(MIN_READ_SIZE, DEFAULT_MAX_BUFFERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_reuses_released_buffers() {
        let pool = BufferPool::new(1024, 2);
        assert_eq!(pool.count(), 0);

        let mut buf = pool.acquire();
        buf.extend_from_slice(b"scratch");
        pool.release(buf);
        assert_eq!(pool.count(), 1);

        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
        assert_eq!(pool.count(), 0);
    }

    #[test]
    fn release_drops_buffers_beyond_capacity() {
        let pool = BufferPool::new(64, 1);
        pool.release(BytesMut::with_capacity(64));
        pool.release(BytesMut::with_capacity(64));
        assert_eq!(pool.count(), 1);
    }
}
