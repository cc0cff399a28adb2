//! A bounded, per-environment pool of reusable [`MDB_val`] descriptor pairs.
//!
//! An `MDB_val` is the `{size, pointer}` descriptor LMDB's C ABI uses for every key and
//! value crossing the FFI boundary. A fresh one costs nothing to put on the stack, but the
//! core's design keeps one bounded pool of heap-backed holders per environment anyway, the
//! same shape [`crate::pool::BufferPool`] uses for encode scratch buffers: hot call paths
//! (`get`/`put`/`del`, cursor stepping) borrow a slot, fill in `mv_size`/`mv_data`, pass its
//! address to the FFI call, and return it on drop. Bounded to 64 entries; a release past
//! that capacity is simply dropped rather than growing the pool.
//!
//! Pools are never shared across environments: each [`crate::env::Env`] owns exactly one,
//! so closing an environment drops its pool (and every descriptor in it) along with it,
//! rather than leaving descriptors reachable from an environment that no longer exists.

use crossbeam_queue::ArrayQueue;

use crate::mdb::ffi::MDB_val;

/// Upper bound on idle descriptors a [`DescriptorPool`] holds onto.
pub const DESCRIPTOR_POOL_CAPACITY: usize = 64;

/// A bounded, lock-free pool of reusable [`MDB_val`] holders, one per [`crate::env::Env`].
pub struct DescriptorPool {
    free: ArrayQueue<Box<MDB_val>>,
}

impl DescriptorPool {
    /// Build an empty pool bounded to [`DESCRIPTOR_POOL_CAPACITY`] idle descriptors.
    pub fn new() -> DescriptorPool {
        DescriptorPool { free: ArrayQueue::new(DESCRIPTOR_POOL_CAPACITY) }
    }

    /// Claim a descriptor, zeroed, from the pool, falling back to a fresh allocation on a
    /// miss.
    pub fn acquire(&self) -> PooledDescriptor<'_> {
        let mut val = self.free.pop().unwrap_or_else(|| Box::new(MDB_val::zeroed()));
        *val = MDB_val::zeroed();
        PooledDescriptor { val: Some(val), pool: self }
    }
}

impl Default for DescriptorPool {
    fn default() -> DescriptorPool {
        DescriptorPool::new()
    }
}

/// A claimed [`MDB_val`] holder. Returned to its [`DescriptorPool`] on drop, unless the
/// pool is already at capacity, in which case it is simply deallocated.
pub struct PooledDescriptor<'p> {
    val: Option<Box<MDB_val>>,
    pool: &'p DescriptorPool,
}

impl std::ops::Deref for PooledDescriptor<'_> {
    type Target = MDB_val;

    fn deref(&self) -> &MDB_val {
        self.val.as_ref().expect("descriptor taken before drop")
    }
}

impl std::ops::DerefMut for PooledDescriptor<'_> {
    fn deref_mut(&mut self) -> &mut MDB_val {
        self.val.as_mut().expect("descriptor taken before drop")
    }
}

impl Drop for PooledDescriptor<'_> {
    fn drop(&mut self) {
        if let Some(val) = self.val.take() {
            let _ = self.pool.free.push(val);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_hands_out_a_zeroed_descriptor() {
        let pool = DescriptorPool::new();
        let mut desc = pool.acquire();
        assert_eq!(desc.mv_size, 0);
        desc.mv_size = 42;
        assert_eq!(desc.mv_size, 42);
    }

    #[test]
    fn released_descriptors_are_reused_and_rezeroed() {
        let pool = DescriptorPool::new();
        {
            let mut desc = pool.acquire();
            desc.mv_size = 7;
        }
        let desc = pool.acquire();
        assert_eq!(desc.mv_size, 0, "a reused descriptor must come back zeroed");
    }

    #[test]
    fn overflow_releases_are_dropped_not_grown() {
        let pool = DescriptorPool::new();
        let mut held = Vec::new();
        for _ in 0..DESCRIPTOR_POOL_CAPACITY + 8 {
            held.push(pool.acquire());
        }
        drop(held);
        // At most DESCRIPTOR_POOL_CAPACITY made it back into the bounded queue; the rest
        // were dropped on release instead of growing the pool.
        let mut reclaimed = 0;
        let mut probes = Vec::new();
        while let Some(d) = pool.free.pop() {
            reclaimed += 1;
            probes.push(d);
        }
        assert!(reclaimed <= DESCRIPTOR_POOL_CAPACITY);
    }
}
