//! A bounded pool of reusable scratch buffers for the codec's encode path.
//!
//! Every `assoc-in`/`update-in`/`multi-assoc` call encodes a record into a `Vec<u8>`
//! before handing it to `mdb_put`. Without pooling, a write-heavy caller allocates and
//! frees one of these per call; [`BufferPool`] lets that allocation be reused across
//! calls on the same store.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;

/// Buffers larger than this are dropped on release rather than returned to the pool, so
/// one outsized record can't pin an oversized buffer in the pool forever.
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

/// Floor every [`BufferPool::acquire`] request is rounded up to, so small records don't
/// churn through a string of undersized buffers before settling on a reusable size.
const MIN_ACQUIRE_CAPACITY: usize = 64 * 1024;

/// A bounded, lock-free pool of `Vec<u8>` scratch buffers.
pub struct BufferPool {
    free: ArrayQueue<Vec<u8>>,
    claimed: AtomicUsize,
}

impl BufferPool {
    /// Build a pool that holds at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> BufferPool {
        BufferPool { free: ArrayQueue::new(capacity.max(1)), claimed: AtomicUsize::new(0) }
    }

    /// Claim a buffer with capacity at least `max(min_size, 64 KiB)`, cleared to empty.
    ///
    /// Scans the pool for the first sufficiently large buffer, putting any smaller ones it
    /// passed over back before returning. On a miss, allocates a fresh buffer of the
    /// requested size. The underlying `ArrayQueue` pop/push pair means two threads racing
    /// for the same pooled buffer never both receive it, though a buffer could in principle
    /// be scanned past by one thread and claimed by another in between.
    pub fn acquire(&self, min_size: usize) -> PooledBuffer<'_> {
        let target = min_size.max(MIN_ACQUIRE_CAPACITY);
        let mut too_small = Vec::new();
        let mut found = None;
        while let Some(buf) = self.free.pop() {
            if buf.capacity() >= target {
                found = Some(buf);
                break;
            }
            too_small.push(buf);
        }
        for buf in too_small {
            let _ = self.free.push(buf);
        }

        let mut buf = found.unwrap_or_else(|| Vec::with_capacity(target));
        buf.clear();
        self.claimed.fetch_add(1, Ordering::Relaxed);
        PooledBuffer { buf: Some(buf), pool: self }
    }

    /// Number of buffers currently claimed (not yet released back to the pool).
    pub fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed)
    }

    fn release(&self, mut buf: Vec<u8>) {
        self.claimed.fetch_sub(1, Ordering::Relaxed);
        if buf.capacity() <= MAX_POOLED_CAPACITY {
            buf.clear();
            let _ = self.free.push(buf);
        }
    }
}

/// A claimed buffer. Returned to its [`BufferPool`] on drop.
pub struct PooledBuffer<'p> {
    buf: Option<Vec<u8>>,
    pool: &'p BufferPool,
}

impl std::ops::Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_buffers() {
        let pool = BufferPool::new(2);
        {
            let mut buf = pool.acquire(0);
            buf.extend_from_slice(b"hello");
            assert_eq!(pool.claimed(), 1);
        }
        assert_eq!(pool.claimed(), 0);

        let buf = pool.acquire(0);
        assert!(buf.is_empty(), "released buffers are cleared before reuse");
    }

    #[test]
    fn oversized_buffers_are_not_retained() {
        let pool = BufferPool::new(1);
        {
            let mut buf = pool.acquire(0);
            buf.resize(MAX_POOLED_CAPACITY + 1, 0);
        }
        // The oversized buffer was dropped instead of pooled, so claiming again starts
        // from an empty allocation rather than reusing the huge one.
        let buf = pool.acquire(0);
        assert!(buf.capacity() < MAX_POOLED_CAPACITY);
    }

    #[test]
    fn acquire_scans_past_undersized_buffers() {
        let pool = BufferPool::new(4);
        {
            let _small = pool.acquire(0);
        }
        {
            let mut big = pool.acquire(200 * 1024);
            assert!(big.capacity() >= 200 * 1024);
            big.extend_from_slice(b"x");
        }
        // The small buffer from the first scope should still be sitting in the pool,
        // since acquiring the big one should not have evicted it.
        let small_again = pool.acquire(0);
        assert!(small_again.capacity() < 200 * 1024);
    }
}
