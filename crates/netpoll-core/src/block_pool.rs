//! Shared pool of fixed-size buffer blocks.
//!
//! Every [`LinkBuffer`](crate::LinkBuffer) draws its blocks from a pool and
//! hands fully consumed blocks back. Connections on different pollers share
//! one pool, so the free-list is a lock-free bounded MPMC queue. When the
//! free-list is empty a fresh block is allocated; when it is full a recycled
//! block is simply dropped.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Default block size (8 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

/// Default number of free blocks retained.
pub const DEFAULT_POOL_CAPACITY: usize = 4096;

pub struct BlockPool {
    free: ArrayQueue<Box<[u8]>>,
    block_size: usize,
    /// Blocks created because the free-list was empty.
    allocated: AtomicUsize,
    /// Blocks served from the free-list.
    reused: AtomicUsize,
}

impl BlockPool {
    /// Create a pool handing out `block_size` byte blocks and retaining at
    /// most `capacity` free blocks.
    pub fn new(block_size: usize, capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity.max(1)),
            block_size: block_size.max(1),
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Take a block. Contents are unspecified.
    pub fn allocate(&self) -> Box<[u8]> {
        match self.free.pop() {
            Some(block) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                block
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.block_size].into_boxed_slice()
            }
        }
    }

    /// Return a block. Blocks of a foreign size are dropped.
    pub fn recycle(&self, block: Box<[u8]>) {
        if block.len() != self.block_size {
            return;
        }
        // Full free-list: let the block go.
        let _ = self.free.push(block);
    }

    /// Free blocks currently retained.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reused_count(&self) -> usize {
        self.reused.load(Ordering::Relaxed)
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_POOL_CAPACITY)
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("block_size", &self.block_size)
            .field("available", &self.available())
            .field("allocated", &self.allocated_count())
            .field("reused", &self.reused_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocate_recycle_reuse() {
        let pool = BlockPool::new(64, 4);
        let b = pool.allocate();
        assert_eq!(b.len(), 64);
        assert_eq!(pool.allocated_count(), 1);

        pool.recycle(b);
        assert_eq!(pool.available(), 1);

        let _b = pool.allocate();
        assert_eq!(pool.reused_count(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_foreign_block_dropped() {
        let pool = BlockPool::new(64, 4);
        pool.recycle(vec![0u8; 32].into_boxed_slice());
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_full_freelist_drops() {
        let pool = BlockPool::new(16, 2);
        let blocks: Vec<_> = (0..3).map(|_| pool.allocate()).collect();
        for b in blocks {
            pool.recycle(b);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_concurrent_allocate_recycle() {
        let pool = Arc::new(BlockPool::new(128, 64));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        let mut b = pool.allocate();
                        b[0] = t as u8;
                        b[127] = i as u8;
                        assert_eq!(b[0], t as u8);
                        pool.recycle(b);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.available() <= 64);
        assert_eq!(pool.allocated_count() + pool.reused_count(), 8000);
    }
}
