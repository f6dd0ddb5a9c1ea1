//! Object pool for request records
//!
//! A fixed set of entries is allocated up front and recycled through a
//! bounded lock-free queue of slot indices. Once the queue runs dry the pool
//! falls back to individual heap allocations, which are simply dropped on
//! release.
//!
//! Design:
//! - Entries are `Arc<Pooled<T>>`: handing one out is a refcount bump, not an
//!   allocation
//! - Free slot indices live in a `crossbeam` `ArrayQueue`
//! - Release recognises the pool's own entries by identity (slot index plus
//!   pointer equality), everything else is treated as a heap fallback

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tracing::{trace, warn};

/// One pool entry.
///
/// Dereferences to the pooled value. Entries created by the heap fallback
/// carry no slot.
#[derive(Debug)]
pub struct Pooled<T> {
    slot: Option<usize>,
    in_use: AtomicBool,
    value: T,
}

impl<T> Pooled<T> {
    const fn pooled(slot: usize, value: T) -> Self {
        Self {
            slot: Some(slot),
            in_use: AtomicBool::new(false),
            value,
        }
    }

    const fn unpooled(value: T) -> Self {
        Self {
            slot: None,
            in_use: AtomicBool::new(true),
            value,
        }
    }

    /// Whether this entry belongs to the pre-allocated set.
    #[inline]
    #[must_use]
    pub const fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

/// Fixed-capacity recycler with heap fallback.
///
/// `acquire` and `release` never block and never take locks.
pub struct ObjectPool<T> {
    slots: Box<[Arc<Pooled<T>>]>,
    free: ArrayQueue<usize>,
}

impl<T: Default> ObjectPool<T> {
    /// Pre-allocate `capacity` entries, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        Self::with_init(capacity, |_| T::default())
    }
}

impl<T> ObjectPool<T> {
    /// Pre-allocate `capacity` entries built by `init`.
    ///
    /// The capacity is rounded up to a power of two, with a minimum of one.
    pub fn with_init(capacity: usize, mut init: impl FnMut(usize) -> T) -> Self {
        let capacity = crate::options::round_capacity(capacity, 1);
        let slots = (0..capacity)
            .map(|i| Arc::new(Pooled::pooled(i, init(i))))
            .collect();
        let free = ArrayQueue::new(capacity);
        for index in 0..capacity {
            let _ = free.push(index);
        }
        Self { slots, free }
    }

    /// Take an entry, falling back to `fallback` once the pool is drained.
    pub fn acquire_or_else(&self, fallback: impl FnOnce() -> T) -> Arc<Pooled<T>> {
        if let Some(index) = self.free.pop() {
            let entry = &self.slots[index];
            entry.in_use.store(true, Ordering::Release);
            return Arc::clone(entry);
        }
        trace!(capacity = self.slots.len(), "pool drained, allocating on the heap");
        Arc::new(Pooled::unpooled(fallback()))
    }

    /// Return an entry.
    ///
    /// Pre-allocated entries go back on the free-list, heap entries are
    /// dropped. Releasing the same pooled entry twice is ignored.
    pub fn release(&self, entry: Arc<Pooled<T>>) {
        let Some(index) = entry.slot else {
            return;
        };
        let owned = self
            .slots
            .get(index)
            .is_some_and(|slot| Arc::ptr_eq(slot, &entry));
        if !owned {
            return;
        }
        if !entry.in_use.swap(false, Ordering::AcqRel) {
            warn!(index, "double release of pooled entry ignored");
            return;
        }
        drop(entry);
        if self.free.push(index).is_err() {
            warn!(index, "free-list full, entry leaked");
        }
    }

    /// Number of pre-allocated entries.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of pre-allocated entries currently free.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl<T: Default> ObjectPool<T> {
    /// Take an entry, heap-allocating a default value once the pool is drained.
    pub fn acquire(&self) -> Arc<Pooled<T>> {
        self.acquire_or_else(T::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread;

    #[test]
    fn test_release_makes_entry_reusable() {
        let pool: ObjectPool<u64> = ObjectPool::new(1);
        let a = pool.acquire();
        let addr = Arc::as_ptr(&a);
        assert!(a.is_pooled());
        pool.release(a);

        let b = pool.acquire();
        assert_eq!(Arc::as_ptr(&b), addr);
    }

    #[test]
    fn test_heap_fallback_when_drained() {
        let pool: ObjectPool<u64> = ObjectPool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert!(a.is_pooled() && b.is_pooled());
        assert!(!c.is_pooled());
        assert_eq!(pool.available(), 0);

        pool.release(c);
        assert_eq!(pool.available(), 0);
        pool.release(a);
        assert_eq!(pool.available(), 1);
        pool.release(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_double_release_ignored() {
        let pool: ObjectPool<u64> = ObjectPool::new(4);
        let a = pool.acquire();
        let dup = Arc::clone(&a);
        pool.release(a);
        pool.release(dup);
        assert_eq!(pool.available(), 4);

        let mut seen = HashSet::new();
        let held: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        for entry in &held {
            assert!(entry.is_pooled());
            assert!(seen.insert(Arc::as_ptr(entry) as usize));
        }
    }

    #[test]
    fn test_foreign_entry_not_adopted() {
        let pool: ObjectPool<u64> = ObjectPool::new(2);
        let other: ObjectPool<u64> = ObjectPool::new(2);
        let foreign = other.acquire();
        let _a = pool.acquire();
        pool.release(foreign);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_capacity_rounded_up() {
        let pool: ObjectPool<u64> = ObjectPool::new(5);
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.available(), 8);

        let empty: ObjectPool<u64> = ObjectPool::new(0);
        assert_eq!(empty.capacity(), 1);
    }

    #[test]
    fn test_free_list_recycles_many_times() {
        let pool: ObjectPool<u64> = ObjectPool::new(4);
        for _ in 0..1000 {
            let a = pool.acquire();
            let b = pool.acquire();
            assert!(a.is_pooled() && b.is_pooled());
            pool.release(b);
            pool.release(a);
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_no_entry_held_twice_concurrently() {
        let pool: Arc<ObjectPool<u64>> = Arc::new(ObjectPool::new(16));
        let held = Arc::new(Mutex::new(HashSet::new()));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let entry = pool.acquire();
                        let addr = Arc::as_ptr(&entry) as usize;
                        if entry.is_pooled() {
                            assert!(held.lock().unwrap().insert(addr), "entry handed out twice");
                            held.lock().unwrap().remove(&addr);
                        }
                        pool.release(entry);
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(pool.available(), 16);
    }
}
