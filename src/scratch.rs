//! # Scratch Buffer Pool
//!
//! Every record write serializes into a scratch buffer first. Buffers
//! are pooled so steady-state writes allocate nothing: `take` pops a
//! recycled buffer or creates a fresh one, and `offer` returns it after
//! the payload has been written out.
//!
//! The pool is bounded and strictly non-blocking. Both sides use
//! `try_lock`; if another thread holds the pool lock the buffer is simply
//! dropped (or freshly allocated), which keeps the pool off every
//! latency path. Offers beyond the capacity are discarded.

use parking_lot::Mutex;

pub(crate) const SCRATCH_POOL_CAPACITY: usize = 128;

pub(crate) struct ScratchPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl ScratchPool {
    pub fn new() -> ScratchPool {
        ScratchPool {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Pops a recycled buffer, or allocates one when the pool is empty
    /// or contended. The returned buffer is always empty.
    pub fn take(&self) -> Vec<u8> {
        if let Some(mut pool) = self.buffers.try_lock() {
            if let Some(buf) = pool.pop() {
                return buf;
            }
        }
        Vec::new()
    }

    /// Returns a buffer to the pool. Dropped when the pool is full or
    /// contended.
    pub fn offer(&self, mut buf: Vec<u8>) {
        buf.clear();
        if let Some(mut pool) = self.buffers.try_lock() {
            if pool.len() < SCRATCH_POOL_CAPACITY {
                pool.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_on_empty_pool_allocates() {
        let pool = ScratchPool::new();
        assert!(pool.take().is_empty());
    }

    #[test]
    fn offered_buffer_is_recycled_empty() {
        let pool = ScratchPool::new();
        let mut buf = pool.take();
        buf.extend_from_slice(b"payload");
        let capacity = buf.capacity();

        pool.offer(buf);
        let recycled = pool.take();

        assert!(recycled.is_empty());
        assert_eq!(recycled.capacity(), capacity);
    }

    #[test]
    fn pool_is_bounded() {
        let pool = ScratchPool::new();
        for _ in 0..SCRATCH_POOL_CAPACITY + 10 {
            pool.offer(Vec::with_capacity(8));
        }

        assert_eq!(pool.buffers.lock().len(), SCRATCH_POOL_CAPACITY);
    }
}
