//! Outbound byte ring: framed messages queued by a caller, drained by the reactor
//!
//! Every message is stored contiguously as
//!
//! ```text
//! +------------+------------------+-----------------+
//! | flag: u8   | len: u32 (LE)    | payload (len)   |
//! +------------+------------------+-----------------+
//! ```
//!
//! with `flag` one of:
//! - `OK`: a complete message
//! - `INVALID`: a message whose partial-write sequence went wrong; the reader
//!   steps over it silently
//! - `SKIP`: padding up to the end of the backing array, written when a
//!   message would not fit before wraparound
//!
//! Messages can be written in one call (`remaining == 0`) or in several: the
//! first call announces the total through `data.len() + remaining`, and each
//! following call must bring `remaining` down to exactly zero. This lets a
//! producer reserve header space in front of a payload it appends later.
//!
//! Concurrency contract:
//! - One writer at a time. A second concurrent writer is turned away with
//!   [`SluiceError::ConcurrentWrite`]; producers sharing a record must
//!   serialize their own writes.
//! - One reader at a time (the reactor thread). [`ByteRing::reset`] belongs to
//!   the reading side and must not be called while a [`Frame`] is held on the
//!   same thread.
//! - The writer never overtakes bytes the reader has not released: a frame
//!   returned by [`ByteRing::read`] stays intact until it is dropped.

#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::thread;

use crossbeam::utils::CachePadded;
use tracing::{debug, error, warn};

use crate::error::{Result, SluiceError};

/// Size of the frame header (flag + length).
pub const HEADER_LEN: usize = 5;

const FLAG_OK: u8 = 0;
const FLAG_INVALID: u8 = 1;
const FLAG_SKIP: u8 = 2;

/// Spins after which a waiting writer reports a slow consumer.
const SLOW_CONSUMER_SPINS: u32 = 50;

/// State of the message currently being written. Owned by whoever holds the
/// `writing` flag.
#[derive(Debug, Default)]
struct WriterState {
    in_progress: bool,
    epoch: u32,
    begin: usize,
    pos: usize,
    payload_len: usize,
    remaining: usize,
    skip: bool,
    corrupt: bool,
}

impl WriterState {
    fn clear(&mut self) {
        self.in_progress = false;
        self.skip = false;
        self.corrupt = false;
        self.remaining = 0;
        self.payload_len = 0;
    }

    /// Bookkeeping for a chunk that is dropped instead of stored.
    fn swallow(&mut self, len: usize, remaining: usize) {
        self.remaining = self.remaining.saturating_sub(len);
        if remaining == 0 {
            self.clear();
        }
    }
}

/// Framed single-producer single-consumer byte queue.
pub struct ByteRing {
    buf: Box<[UnsafeCell<u8>]>,
    mask: usize,
    /// Bytes claimed by the writer
    reserved: CachePadded<AtomicUsize>,
    /// Bytes published to the reader
    cursor: CachePadded<AtomicUsize>,
    /// Bytes released by the reader
    read_begin: CachePadded<AtomicUsize>,
    epoch: AtomicU32,
    writing: AtomicBool,
    reading: AtomicBool,
    resetting: AtomicBool,
    writer: UnsafeCell<WriterState>,
}

// SAFETY: writer-private state and the unpublished byte span are only touched
// while `writing` is held; published bytes are only read while `reading` is
// held and are not reclaimed by the writer before the reader moves
// `read_begin` past them. `reset` holds both flags before rewinding.
unsafe impl Sync for ByteRing {}

impl fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteRing")
            .field("capacity", &self.capacity())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .field("read_begin", &self.read_begin.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Clears a flag when dropped.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ByteRing {
    /// Create a ring of `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two, is smaller than a frame
    /// header, or does not fit in a `u32`.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "byte ring capacity must be a power of two"
        );
        assert!(capacity > HEADER_LEN, "byte ring too small");
        assert!(u32::try_from(capacity).is_ok(), "byte ring too large");
        Self {
            buf: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            mask: capacity - 1,
            reserved: CachePadded::new(AtomicUsize::new(0)),
            cursor: CachePadded::new(AtomicUsize::new(0)),
            read_begin: CachePadded::new(AtomicUsize::new(0)),
            epoch: AtomicU32::new(0),
            writing: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            resetting: AtomicBool::new(false),
            writer: UnsafeCell::new(WriterState::default()),
        }
    }

    /// Size of the backing array.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Largest payload a single message can carry.
    #[inline]
    #[must_use]
    pub fn max_message(&self) -> usize {
        self.capacity() - HEADER_LEN
    }

    /// No published bytes are waiting for the reader.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_begin.load(Ordering::Acquire) == self.cursor.load(Ordering::Acquire)
    }

    /// Queue `data`, followed by `remaining` more bytes in later calls.
    ///
    /// With `remaining == 0` and no sequence in progress this writes one
    /// complete message. Otherwise the first call fixes the total payload at
    /// `data.len() + remaining` and every following call must leave exactly
    /// the announced `remaining`. A sequence that breaks this rule is stored
    /// as an INVALID frame, which the reader discards.
    ///
    /// Spins (yielding) while the target span still holds unread bytes.
    pub fn write(&self, data: &[u8], remaining: usize) -> Result<()> {
        if data.is_empty() {
            return Err(SluiceError::EmptyMessage);
        }
        if self.writing.swap(true, Ordering::SeqCst) {
            return Err(SluiceError::ConcurrentWrite);
        }
        let _writing = FlagGuard(&self.writing);
        if self.resetting.load(Ordering::SeqCst) {
            return Err(SluiceError::Resetting);
        }

        // SAFETY: `writing` is held for the rest of this call.
        let st = unsafe { &mut *self.writer.get() };
        let epoch = self.epoch.load(Ordering::SeqCst);

        if st.in_progress && st.epoch != epoch {
            debug!("write sequence started before reset, discarding remainder");
            st.skip = true;
            st.epoch = epoch;
        }

        if !st.in_progress {
            if let Err(e) = self.begin_message(st, data.len(), remaining, epoch) {
                st.swallow(data.len(), remaining);
                return Err(e);
            }
        }

        if st.skip {
            st.swallow(data.len(), remaining);
            return Err(SluiceError::Discarded);
        }

        self.append(st, data, remaining);
        Ok(())
    }

    /// Reserve and stamp the header of a new message.
    fn begin_message(
        &self,
        st: &mut WriterState,
        len: usize,
        remaining: usize,
        epoch: u32,
    ) -> Result<()> {
        let payload_len = len.saturating_add(remaining);
        st.in_progress = true;
        st.epoch = epoch;
        st.payload_len = payload_len;
        st.remaining = payload_len;
        st.corrupt = false;
        st.skip = true;

        let capacity = self.capacity();
        let frame = payload_len.saturating_add(HEADER_LEN);
        if frame > capacity {
            warn!(
                size = payload_len,
                max = self.max_message(),
                "message exceeds outbound buffer"
            );
            return Err(SluiceError::MessageTooLarge {
                size: payload_len,
                max: self.max_message(),
            });
        }

        let mut start = self.reserved.fetch_add(frame, Ordering::AcqRel);
        let index = start & self.mask;
        if index + frame > capacity {
            // Not enough room before the end of the array: pad and wrap.
            let padding = capacity - index;
            self.reserved.fetch_add(padding, Ordering::AcqRel);
            self.wait_for_space(start, 1)?;
            // SAFETY: [start, start + 1) is claimed and released by the reader.
            unsafe { self.put(start, &[FLAG_SKIP]) };
            self.commit(start, padding);
            start += padding;
        }

        self.wait_for_space(start, frame)?;
        let header_len = u32::try_from(payload_len).map_err(|_| SluiceError::MessageTooLarge {
            size: payload_len,
            max: self.max_message(),
        })?;
        // SAFETY: [start, start + frame) is claimed, contiguous and released
        // by the reader.
        unsafe {
            self.put(start, &[FLAG_OK]);
            self.put(start + 1, &header_len.to_le_bytes());
        }
        st.begin = start;
        st.pos = start + HEADER_LEN;
        st.skip = false;
        Ok(())
    }

    /// Copy one chunk and publish the message once the sequence ends.
    fn append(&self, st: &mut WriterState, data: &[u8], remaining: usize) {
        match st.remaining.checked_sub(data.len()) {
            Some(left) if left == remaining && !st.corrupt => {
                // SAFETY: the accounting above keeps the copy inside the
                // frame reserved in `begin_message`.
                unsafe { self.put(st.pos, data) };
                st.pos += data.len();
                st.remaining = left;
            }
            _ => {
                if !st.corrupt {
                    warn!(
                        begin = st.begin,
                        expected = st.remaining,
                        got = data.len() + remaining,
                        "write sequence mismatch, frame marked invalid"
                    );
                }
                st.corrupt = true;
                st.remaining = st.remaining.saturating_sub(data.len());
            }
        }

        if remaining == 0 {
            if st.corrupt {
                // SAFETY: the flag byte belongs to the unpublished frame.
                unsafe { self.put(st.begin, &[FLAG_INVALID]) };
            }
            self.commit(st.begin, st.payload_len + HEADER_LEN);
            st.clear();
        }
    }

    /// Wait until `[start, start + len)` no longer overlaps unread bytes.
    fn wait_for_space(&self, start: usize, len: usize) -> Result<()> {
        let capacity = self.capacity();
        let mut spins = 0u32;
        while start + len > self.read_begin.load(Ordering::Acquire) + capacity {
            if self.resetting.load(Ordering::SeqCst) {
                return Err(SluiceError::Resetting);
            }
            spins = spins.wrapping_add(1);
            if spins == SLOW_CONSUMER_SPINS {
                warn!(
                    begin = start & self.mask,
                    end = (start + len) & self.mask,
                    read_index = self.read_begin.load(Ordering::Relaxed) & self.mask,
                    "slow consumer"
                );
            }
            thread::yield_now();
        }
        Ok(())
    }

    /// Publish `len` bytes starting at `start`, in order.
    fn commit(&self, start: usize, len: usize) {
        while self.cursor.load(Ordering::Acquire) != start {
            if self.resetting.load(Ordering::SeqCst) {
                return;
            }
            thread::yield_now();
        }
        self.cursor.store(start + len, Ordering::Release);
    }

    /// Take the next complete message.
    ///
    /// SKIP and INVALID frames are stepped over. Returns `None` when nothing
    /// is ready, a reset is in progress, or another frame is still held.
    pub fn read(&self) -> Option<Frame<'_>> {
        if self.resetting.load(Ordering::SeqCst) {
            return None;
        }
        if self.reading.swap(true, Ordering::SeqCst) {
            return None;
        }

        let capacity = self.capacity();
        let mut pos = self.read_begin.load(Ordering::Relaxed);
        loop {
            let published = self.cursor.load(Ordering::Acquire);
            if pos == published {
                self.reading.store(false, Ordering::SeqCst);
                return None;
            }

            // SAFETY: `pos < published`, so the header bytes were written and
            // published by the writer.
            let flag = unsafe { self.get_u8(pos) };
            match flag {
                FLAG_SKIP => {
                    pos += capacity - (pos & self.mask);
                    self.read_begin.store(pos, Ordering::Release);
                }
                FLAG_INVALID => {
                    // SAFETY: as above.
                    let len = unsafe { self.get_len(pos + 1) };
                    debug!(len, "discarding invalid frame");
                    pos += HEADER_LEN + len;
                    self.read_begin.store(pos, Ordering::Release);
                }
                FLAG_OK => {
                    // SAFETY: as above.
                    let len = unsafe { self.get_len(pos + 1) };
                    return Some(Frame {
                        ring: self,
                        start: pos + HEADER_LEN,
                        len,
                        next: pos + HEADER_LEN + len,
                    });
                }
                other => {
                    error!(flag = other, "corrupt frame header, dropping queued bytes");
                    self.read_begin.store(published, Ordering::Release);
                    self.reading.store(false, Ordering::SeqCst);
                    return None;
                }
            }
        }
    }

    /// Drop all queued content and rewind to an empty ring.
    ///
    /// Blocks new writers for the duration, waits for an in-flight writer to
    /// back out, and discards the rest of any write sequence started before
    /// the reset.
    pub fn reset(&self) {
        self.resetting.store(true, Ordering::SeqCst);
        let _resetting = FlagGuard(&self.resetting);
        self.epoch.fetch_add(1, Ordering::SeqCst);

        while self.writing.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        while self.reading.swap(true, Ordering::SeqCst) {
            thread::yield_now();
        }
        let _reading = FlagGuard(&self.reading);

        self.reserved.store(0, Ordering::SeqCst);
        self.cursor.store(0, Ordering::SeqCst);
        self.read_begin.store(0, Ordering::SeqCst);
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buf.as_ptr())
    }

    /// # Safety
    ///
    /// The caller must own `[pos, pos + data.len())`, which must not cross the
    /// end of the backing array.
    unsafe fn put(&self, pos: usize, data: &[u8]) {
        let index = pos & self.mask;
        debug_assert!(index + data.len() <= self.capacity());
        ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(index), data.len());
    }

    /// # Safety
    ///
    /// `pos` must be published and not yet released by the reader.
    unsafe fn get_u8(&self, pos: usize) -> u8 {
        *self.base().add(pos & self.mask)
    }

    /// # Safety
    ///
    /// `[pos, pos + 4)` must be published and not yet released by the reader.
    unsafe fn get_len(&self, pos: usize) -> usize {
        let mut raw = [0u8; 4];
        ptr::copy_nonoverlapping(self.base().add(pos & self.mask), raw.as_mut_ptr(), 4);
        u32::from_le_bytes(raw) as usize
    }
}

/// One message borrowed from a [`ByteRing`].
///
/// The bytes stay reserved until the frame is dropped, at which point the
/// reader moves past them.
pub struct Frame<'a> {
    ring: &'a ByteRing,
    start: usize,
    len: usize,
    next: usize,
}

impl Deref for Frame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the frame lies inside published, unreleased bytes and is
        // contiguous in the backing array.
        unsafe {
            std::slice::from_raw_parts(self.ring.base().add(self.start & self.ring.mask), self.len)
        }
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame").field("len", &self.len).finish()
    }
}

impl Drop for Frame<'_> {
    fn drop(&mut self) {
        self.ring.read_begin.store(self.next, Ordering::Release);
        self.ring.reading.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn read_vec(ring: &ByteRing) -> Option<Vec<u8>> {
        ring.read().map(|f| f.to_vec())
    }

    #[test]
    fn test_single_messages_fifo() {
        let ring = ByteRing::new(64);
        ring.write(b"one", 0).unwrap();
        ring.write(b"two", 0).unwrap();
        ring.write(b"three", 0).unwrap();
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"one"[..]));
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"two"[..]));
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"three"[..]));
        assert_eq!(read_vec(&ring), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_wraparound_keeps_messages_whole() {
        let ring = ByteRing::new(64);
        for round in 0..500u32 {
            let len = 1 + (round as usize * 7) % 40;
            let msg: Vec<u8> = (0..len).map(|i| (round as usize + i) as u8).collect();
            ring.write(&msg, 0).unwrap();
            assert_eq!(read_vec(&ring), Some(msg));
        }
        assert_eq!(read_vec(&ring), None);
    }

    #[test]
    fn test_exact_fit_at_end() {
        let ring = ByteRing::new(32);
        ring.write(&[1; 11], 0).unwrap();
        ring.write(&[2; 11], 0).unwrap();
        assert_eq!(read_vec(&ring), Some(vec![1; 11]));
        assert_eq!(read_vec(&ring), Some(vec![2; 11]));
        ring.write(&[3; 27], 0).unwrap();
        assert_eq!(read_vec(&ring), Some(vec![3; 27]));
    }

    #[test]
    fn test_partial_write_sequence() {
        let ring = ByteRing::new(64);
        ring.write(b"HDR:", 5).unwrap();
        assert_eq!(read_vec(&ring), None, "incomplete message is not visible");
        ring.write(b"he", 3).unwrap();
        ring.write(b"llo", 0).unwrap();
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"HDR:hello"[..]));
    }

    #[test]
    fn test_sequence_mismatch_is_invalid() {
        let ring = ByteRing::new(64);
        ring.write(b"head", 10).unwrap();
        // Announced 10 more bytes, ends after 3.
        ring.write(b"abc", 0).unwrap();
        ring.write(b"next", 0).unwrap();
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"next"[..]));
        assert_eq!(read_vec(&ring), None);
    }

    #[test]
    fn test_non_monotonic_remaining_is_invalid() {
        let ring = ByteRing::new(128);
        ring.write(b"a", 6).unwrap();
        ring.write(b"bb", 5).unwrap();
        ring.write(b"cccc", 0).unwrap();
        ring.write(b"ok", 0).unwrap();
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"ok"[..]));
    }

    #[test]
    fn test_too_large() {
        let ring = ByteRing::new(32);
        assert!(matches!(
            ring.write(&[0; 28], 0),
            Err(SluiceError::MessageTooLarge { size: 28, max: 27 })
        ));
        ring.write(&[9; 27], 0).unwrap();
        assert_eq!(read_vec(&ring), Some(vec![9; 27]));
    }

    #[test]
    fn test_oversized_sequence_swallowed() {
        let ring = ByteRing::new(32);
        assert!(matches!(
            ring.write(b"head", 100),
            Err(SluiceError::MessageTooLarge { .. })
        ));
        assert!(matches!(ring.write(&[0; 60], 40), Err(SluiceError::Discarded)));
        assert!(matches!(ring.write(&[0; 40], 0), Err(SluiceError::Discarded)));
        ring.write(b"fine", 0).unwrap();
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"fine"[..]));
    }

    #[test]
    fn test_empty_write_rejected() {
        let ring = ByteRing::new(32);
        assert!(matches!(ring.write(b"", 0), Err(SluiceError::EmptyMessage)));
    }

    #[test]
    fn test_reset_discards_pending() {
        let ring = ByteRing::new(64);
        ring.write(b"stale", 0).unwrap();
        ring.reset();
        assert_eq!(read_vec(&ring), None);
        assert!(ring.is_empty());
        ring.write(b"fresh", 0).unwrap();
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"fresh"[..]));
    }

    #[test]
    fn test_reset_mid_sequence() {
        let ring = ByteRing::new(64);
        ring.write(b"head", 4).unwrap();
        ring.reset();
        assert_eq!(read_vec(&ring), None);
        assert!(matches!(ring.write(b"body", 0), Err(SluiceError::Discarded)));
        assert_eq!(read_vec(&ring), None);
        ring.write(b"new", 0).unwrap();
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_reset_releases_writer_blocked_on_full_ring() {
        let ring = Arc::new(ByteRing::new(32));
        ring.write(&[1; 20], 0).unwrap();

        let (result_tx, result_rx) = flume::bounded(2);
        let (go_tx, go_rx) = flume::bounded::<()>(1);
        let writer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                // Needs the span still held by the unread message.
                result_tx.send(ring.write(&[2; 10], 10)).unwrap();
                go_rx.recv().unwrap();
                result_tx.send(ring.write(&[3; 10], 0)).unwrap();
            })
        };

        // 25 bytes queued, 7 bytes of wrap padding, 25 bytes claimed.
        while ring.reserved.load(Ordering::Acquire) != 57 {
            thread::yield_now();
        }
        ring.reset();
        assert!(matches!(result_rx.recv().unwrap(), Err(SluiceError::Resetting)));

        go_tx.send(()).unwrap();
        assert!(matches!(result_rx.recv().unwrap(), Err(SluiceError::Discarded)));
        writer.join().unwrap();

        assert_eq!(read_vec(&ring), None);
        ring.write(b"after", 0).unwrap();
        assert_eq!(read_vec(&ring).as_deref(), Some(&b"after"[..]));
    }

    #[test]
    fn test_frame_holds_bytes_until_dropped() {
        let ring = ByteRing::new(32);
        ring.write(&[1; 20], 0).unwrap();
        let frame = ring.read().unwrap();
        assert!(ring.read().is_none(), "only one frame at a time");
        assert_eq!(&*frame, &[1; 20][..]);
        drop(frame);
        ring.write(&[2; 20], 0).unwrap();
        assert_eq!(read_vec(&ring), Some(vec![2; 20]));
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let ring = Arc::new(ByteRing::new(256));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..5000u32 {
                    let len = 4 + (i as usize % 50);
                    let mut msg = i.to_le_bytes().to_vec();
                    msg.resize(len, i as u8);
                    ring.write(&msg, 0).unwrap();
                }
            })
        };

        let mut expected = 0u32;
        while expected < 5000 {
            if let Some(frame) = ring.read() {
                let id = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
                assert_eq!(id, expected);
                assert_eq!(frame.len(), 4 + (id as usize % 50));
                assert!(frame[4..].iter().all(|&b| b == id as u8));
                expected += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
    }
}
