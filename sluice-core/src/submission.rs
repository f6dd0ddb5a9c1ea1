//! Submission ring: many producers, one consumer
//!
//! Producer threads claim contiguous slots with one atomic `fetch_add`, fill
//! them at their own pace, then publish. Publishing is ordered: a reservation
//! only becomes visible once every earlier reservation has been published, so
//! the consumer sees slots strictly in reservation order no matter which
//! producer finishes writing first.
//!
//! The consumer only reads `[consumed, available)`. Producers never claim a
//! span that would overrun slots the consumer has not taken yet.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::utils::CachePadded;

use crate::error::{Result, SluiceError};

struct Ring<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    reserved: CachePadded<AtomicUsize>,
    available: CachePadded<AtomicUsize>,
    consumed: CachePadded<AtomicUsize>,
}

// SAFETY: a slot is written only by the producer holding the reservation that
// covers it, and read only by the single consumer after the reservation was
// published (Release on `available`, Acquire in the consumer). Producers wait
// until the consumer has moved past a slot before claiming it again.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T> Ring<T> {
    fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn publish(&self, start: usize, n: usize) {
        while self.available.load(Ordering::Acquire) != start {
            thread::yield_now();
        }
        self.available.store(start + n, Ordering::Release);
    }
}

/// Create a submission ring with `capacity` slots.
///
/// # Panics
///
/// Panics if `capacity` is not a power of two.
pub fn channel<T>(capacity: usize) -> (Submitter<T>, Drain<T>) {
    assert!(
        capacity.is_power_of_two(),
        "submission ring capacity must be a power of two"
    );
    let slots = (0..capacity).map(|_| UnsafeCell::new(None)).collect();
    let ring = Arc::new(Ring {
        slots,
        mask: capacity - 1,
        reserved: CachePadded::new(AtomicUsize::new(0)),
        available: CachePadded::new(AtomicUsize::new(0)),
        consumed: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        Submitter {
            ring: Arc::clone(&ring),
        },
        Drain { ring },
    )
}

/// Producer side. Cheap to clone, usable from any thread.
pub struct Submitter<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Clone for Submitter<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T> Submitter<T> {
    /// Claim `n` contiguous slots.
    ///
    /// Spins (yielding) while the claimed span still holds entries the
    /// consumer has not taken.
    pub fn reserve(&self, n: usize) -> Result<Reservation<'_, T>> {
        let capacity = self.ring.capacity();
        if n == 0 || n > capacity {
            return Err(SluiceError::CapacityExceeded {
                requested: n,
                capacity,
            });
        }
        let start = self.ring.reserved.fetch_add(n, Ordering::AcqRel);
        while start + n > self.ring.consumed.load(Ordering::Acquire) + capacity {
            thread::yield_now();
        }
        Ok(Reservation {
            ring: &self.ring,
            start,
            len: n,
            published: false,
        })
    }

    /// Reserve one slot, fill it and publish.
    pub fn submit(&self, value: T) -> Result<()> {
        let mut slot = self.reserve(1)?;
        slot.set(0, value);
        slot.publish();
        Ok(())
    }

    /// Total number of slots published so far.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.ring.available.load(Ordering::Acquire)
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }
}

/// A claimed, not yet published span of slots.
///
/// Dropping an unpublished reservation publishes it with whatever was set,
/// leaving unset slots empty, so later producers are never held up.
pub struct Reservation<'a, T> {
    ring: &'a Ring<T>,
    start: usize,
    len: usize,
    published: bool,
}

impl<T> Reservation<'_, T> {
    /// Number of slots in this reservation.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the first slot in the ring's sequence.
    #[inline]
    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Fill slot `index` of this reservation.
    ///
    /// # Panics
    ///
    /// Panics if `index >= self.len()`.
    pub fn set(&mut self, index: usize, value: T) {
        assert!(index < self.len, "slot index out of reservation");
        let cell = &self.ring.slots[(self.start + index) & self.ring.mask];
        // SAFETY: the slot lies inside this reservation, which no other
        // producer can claim, and the consumer cannot read it before publish.
        unsafe { *cell.get() = Some(value) };
    }

    /// Make the reservation visible to the consumer.
    ///
    /// Waits until every earlier reservation has been published.
    pub fn publish(mut self) {
        self.published = true;
        self.ring.publish(self.start, self.len);
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.published {
            self.ring.publish(self.start, self.len);
        }
    }
}

/// Consumer side. There is exactly one per ring.
pub struct Drain<T> {
    ring: Arc<Ring<T>>,
}

impl<T> Drain<T> {
    /// Take the next published entry, skipping slots left empty.
    pub fn try_pop(&mut self) -> Option<T> {
        loop {
            let pos = self.ring.consumed.load(Ordering::Relaxed);
            if pos == self.ring.available.load(Ordering::Acquire) {
                return None;
            }
            let cell = &self.ring.slots[pos & self.ring.mask];
            // SAFETY: `pos < available`, so the owning reservation has been
            // published, and producers do not reclaim the slot until
            // `consumed` moves past it below.
            let value = unsafe { (*cell.get()).take() };
            self.ring.consumed.store(pos + 1, Ordering::Release);
            if value.is_some() {
                return value;
            }
        }
    }

    /// Number of published entries not consumed yet.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.ring.available.load(Ordering::Acquire) - self.ring.consumed.load(Ordering::Relaxed)
    }

    /// Total number of slots published so far.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.ring.available.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::time::Duration;

    #[test]
    fn test_fifo() {
        let (tx, mut rx) = channel(4);
        for i in 0..3 {
            tx.submit(i).unwrap();
        }
        assert_eq!(rx.pending(), 3);
        assert_eq!(rx.try_pop(), Some(0));
        assert_eq!(rx.try_pop(), Some(1));
        assert_eq!(rx.try_pop(), Some(2));
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn test_wraps_around() {
        let (tx, mut rx) = channel(2);
        for i in 0..100 {
            tx.submit(i).unwrap();
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(tx.available(), 100);
    }

    #[test]
    fn test_reserve_too_many() {
        let (tx, _rx) = channel::<u8>(2);
        assert!(matches!(
            tx.reserve(3),
            Err(SluiceError::CapacityExceeded { requested: 3, capacity: 2 })
        ));
    }

    #[test]
    fn test_multi_slot_reservation() {
        let (tx, mut rx) = channel(8);
        let mut slots = tx.reserve(3).unwrap();
        assert_eq!(slots.len(), 3);
        slots.set(0, 'a');
        slots.set(2, 'c');
        slots.set(1, 'b');
        slots.publish();
        assert_eq!(rx.try_pop(), Some('a'));
        assert_eq!(rx.try_pop(), Some('b'));
        assert_eq!(rx.try_pop(), Some('c'));
    }

    #[test]
    fn test_dropped_reservation_does_not_stall() {
        let (tx, mut rx) = channel(4);
        drop(tx.reserve(1).unwrap());
        tx.submit(7).unwrap();
        assert_eq!(rx.try_pop(), Some(7));
    }

    #[test]
    fn test_publish_in_reservation_order() {
        let (tx, mut rx) = channel(8);
        let first = tx.reserve(1).unwrap();
        assert_eq!(first.start(), 0);

        let late = tx.clone();
        let barrier = Arc::new(Barrier::new(2));
        let b = Arc::clone(&barrier);
        let second = thread::spawn(move || {
            let mut slot = late.reserve(1).unwrap();
            assert_eq!(slot.start(), 1);
            slot.set(0, "B");
            b.wait();
            // Blocks until "A" is published.
            slot.publish();
        });

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(rx.try_pop(), None, "B must not overtake A");

        let mut first = first;
        first.set(0, "A");
        first.publish();
        second.join().unwrap();

        assert_eq!(rx.try_pop(), Some("A"));
        assert_eq!(rx.try_pop(), Some("B"));
    }

    #[test]
    fn test_many_producers() {
        let (tx, mut rx) = channel(64);
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        tx.submit(p * 1_000_000 + i).unwrap();
                    }
                })
            })
            .collect();

        let mut last = [None::<u64>; 4];
        let mut received = 0;
        while received < 4000 {
            if let Some(v) = rx.try_pop() {
                let p = (v / 1_000_000) as usize;
                let i = v % 1_000_000;
                if let Some(prev) = last[p] {
                    assert!(i > prev, "per-producer order preserved");
                }
                last[p] = Some(i);
                received += 1;
            } else {
                thread::yield_now();
            }
        }
        for p in producers {
            p.join().unwrap();
        }
    }
}
