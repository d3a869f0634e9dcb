//! Pooled sample buffers
//!
//! Buffers are grouped into power-of-two size classes, each backed by a lock-free
//! `ArrayQueue` free list. A rent is served from the matching free list when possible and
//! from a fresh allocation otherwise; dropping the [`PooledBuffer`] hands the storage back,
//! so every rented buffer is returned exactly once.

use crossbeam::queue::ArrayQueue;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Smallest size class (64 values)
const MIN_CLASS_BITS: u32 = 6;

/// Largest pooled size class (16M values); bigger rents are never pooled
const MAX_CLASS_BITS: u32 = 24;

/// Free buffers retained per size class
const DEFAULT_CLASS_DEPTH: usize = 32;

static GLOBAL_POOL: Lazy<Arc<BufferPool>> = Lazy::new(|| Arc::new(BufferPool::new()));

/// Rent from the process-wide pool
pub fn rent(len: usize) -> PooledBuffer {
    BufferPool::global().rent(len)
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Rents served from a free list
    pub pooled_rents: u64,
    /// Rents that allocated fresh storage
    pub fresh_allocations: u64,
    /// Buffers put back on a free list
    pub returns: u64,
    /// Buffers freed because their free list was full or they were too large
    pub discards: u64,
}

/// Size-classed pool of `f32` sample buffers
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<ArrayQueue<Vec<f32>>>,
    pooled_rents: AtomicU64,
    fresh_allocations: AtomicU64,
    returns: AtomicU64,
    discards: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_class_depth(DEFAULT_CLASS_DEPTH)
    }

    /// Create a pool retaining at most `depth` free buffers per size class
    pub fn with_class_depth(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            classes: (MIN_CLASS_BITS..=MAX_CLASS_BITS)
                .map(|_| ArrayQueue::new(depth))
                .collect(),
            pooled_rents: AtomicU64::new(0),
            fresh_allocations: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    pub fn global() -> &'static Arc<BufferPool> {
        &GLOBAL_POOL
    }

    /// Rent a buffer of exactly `len` values. Contents are unspecified.
    pub fn rent(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let storage = match Self::class_index(len) {
            Some(index) => match self.classes[index].pop() {
                Some(storage) => {
                    self.pooled_rents.fetch_add(1, Ordering::Relaxed);
                    storage
                }
                None => {
                    self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
                    vec![0.0; Self::class_capacity(index)]
                }
            },
            None => {
                self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
                vec![0.0; len]
            }
        };

        PooledBuffer {
            storage,
            len,
            pool: Arc::clone(self),
        }
    }

    /// Rent a buffer of `len` values, all zero
    pub fn rent_zeroed(self: &Arc<Self>, len: usize) -> PooledBuffer {
        let mut buffer = self.rent(len);
        buffer.fill(0.0);
        buffer
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pooled_rents: self.pooled_rents.load(Ordering::Relaxed),
            fresh_allocations: self.fresh_allocations.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }

    fn give_back(&self, storage: Vec<f32>) {
        let capacity = storage.len();
        let index = match Self::class_index(capacity) {
            Some(index) if Self::class_capacity(index) == capacity => index,
            _ => {
                self.discards.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match self.classes[index].push(storage) {
            Ok(()) => {
                self.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.discards.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn class_index(len: usize) -> Option<usize> {
        let capacity = len.max(1 << MIN_CLASS_BITS).checked_next_power_of_two()?;
        let bits = capacity.trailing_zeros();
        if bits > MAX_CLASS_BITS {
            return None;
        }
        Some((bits - MIN_CLASS_BITS) as usize)
    }

    fn class_capacity(index: usize) -> usize {
        1 << (index as u32 + MIN_CLASS_BITS)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A rented buffer; dereferences to exactly the requested number of values
pub struct PooledBuffer {
    storage: Vec<f32>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Capacity of the underlying storage, at least `len()`
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }
}

impl Deref for PooledBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.storage[..self.len]
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.storage[..self.len]
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.storage));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_rounds_to_size_class() {
        let pool = Arc::new(BufferPool::new());
        let buffer = pool.rent(100);
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.capacity(), 128);

        let small = pool.rent(0);
        assert!(small.is_empty());
        assert_eq!(small.capacity(), 64);
    }

    #[test]
    fn test_returned_buffers_are_reused() {
        let pool = Arc::new(BufferPool::new());
        drop(pool.rent(1000));
        let stats = pool.stats();
        assert_eq!(stats.fresh_allocations, 1);
        assert_eq!(stats.returns, 1);

        let again = pool.rent(900);
        assert_eq!(again.capacity(), 1024);
        assert_eq!(pool.stats().pooled_rents, 1);
    }

    #[test]
    fn test_full_class_discards() {
        let pool = Arc::new(BufferPool::with_class_depth(1));
        let a = pool.rent(64);
        let b = pool.rent(64);
        drop(a);
        drop(b);

        let stats = pool.stats();
        assert_eq!(stats.returns, 1);
        assert_eq!(stats.discards, 1);
    }

    #[test]
    fn test_oversized_rents_are_not_pooled() {
        let pool = Arc::new(BufferPool::new());
        let huge = pool.rent((1 << MAX_CLASS_BITS) + 1);
        assert_eq!(huge.capacity(), (1 << MAX_CLASS_BITS) + 1);
        drop(huge);
        assert_eq!(pool.stats().discards, 1);
    }

    #[test]
    fn test_rent_zeroed() {
        let pool = Arc::new(BufferPool::new());
        let mut dirty = pool.rent(64);
        dirty.fill(1.0);
        drop(dirty);

        let clean = pool.rent_zeroed(64);
        assert!(clean.iter().all(|v| *v == 0.0));
    }
}
