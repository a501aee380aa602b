//! Per-connection growable byte ring buffer.
//!
//! Single-producer/single-consumer: the event loop is the only thread that
//! ever touches a given connection's buffers (see `core/event_loop.rs`), so
//! indices use `Acquire`/`Release` atomics rather than a mutex. Capacity
//! grows by at least 1.5x when a write doesn't fit; it never shrinks.
//!
//! `contiguous_read_region` returns at most the run up to the end of the
//! backing buffer on a wrap; callers that need more must ask again after
//! consuming it.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Buffers never shrink below this capacity.
pub const MIN_BUFFER_SIZE: usize = 64;

/// Growable SPSC byte queue backed by a contiguous buffer and two
/// monotonically increasing indices.
pub struct RingBuffer {
    buffer: Vec<u8>,
    capacity: usize,
    read_index: AtomicUsize,
    write_index: AtomicUsize,
}

impl RingBuffer {
    /// Allocate a buffer of at least `initial_size` (floored at
    /// `MIN_BUFFER_SIZE`) bytes.
    pub fn new(initial_size: usize) -> Self {
        let capacity = initial_size.max(MIN_BUFFER_SIZE);
        Self {
            buffer: vec![0u8; capacity],
            capacity,
            read_index: AtomicUsize::new(0),
            write_index: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn used_space(&self) -> usize {
        self.write_index.load(Ordering::Acquire) - self.read_index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity - self.used_space()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used_space() == 0
    }

    /// Raw pointer to the start of the backing storage, for building the
    /// kernel `Send` buffer pointer together with `contiguous_read_region`.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.buffer.as_ptr()
    }

    /// Offset and length of the next contiguous readable run.
    pub fn contiguous_read_region(&self) -> (usize, usize) {
        let read_index = self.read_index.load(Ordering::Acquire);
        let pos = read_index % self.capacity;
        let used = self.used_space();
        let until_wrap = self.capacity - pos;
        (pos, used.min(until_wrap))
    }

    /// Record that `n` bytes were consumed from the region returned by
    /// `contiguous_read_region` (used by the event loop after a send
    /// completes).
    pub fn advance_read(&self, n: usize) {
        self.read_index.fetch_add(n, Ordering::AcqRel);
        self.reset_if_drained();
    }

    fn reset_if_drained(&self) {
        let read_index = self.read_index.load(Ordering::Acquire);
        let write_index = self.write_index.load(Ordering::Acquire);
        if read_index == write_index {
            self.read_index.store(0, Ordering::Release);
            self.write_index.store(0, Ordering::Release);
        }
    }

    /// Copy `data` into the queue, growing capacity (≥1.5x) as needed.
    /// Returns `Err(())` only if a resize allocation fails.
    pub fn write(&mut self, data: &[u8]) -> Result<(), ()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.free_space() < data.len() {
            self.grow_to_fit(data.len())?;
        }

        let write_index = self.write_index.load(Ordering::Acquire);
        let start = write_index % self.capacity;
        let first_len = data.len().min(self.capacity - start);
        self.buffer[start..start + first_len].copy_from_slice(&data[..first_len]);
        if first_len < data.len() {
            let rest = &data[first_len..];
            self.buffer[..rest.len()].copy_from_slice(rest);
        }

        self.write_index.fetch_add(data.len(), Ordering::AcqRel);
        Ok(())
    }

    /// Read up to `dst.len()` bytes, advancing `read_index`. Returns the
    /// number of bytes actually copied (`min(dst.len(), used_space)`).
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.peek(dst);
        self.read_index.fetch_add(n, Ordering::AcqRel);
        self.reset_if_drained();
        n
    }

    /// Like `read` but does not advance `read_index`.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let used = self.used_space();
        let n = dst.len().min(used);
        if n == 0 {
            return 0;
        }
        let read_index = self.read_index.load(Ordering::Acquire);
        let start = read_index % self.capacity;
        let first_len = n.min(self.capacity - start);
        dst[..first_len].copy_from_slice(&self.buffer[start..start + first_len]);
        if first_len < n {
            let rest_len = n - first_len;
            dst[first_len..n].copy_from_slice(&self.buffer[..rest_len]);
        }
        n
    }

    /// Grow capacity by ≥1.5x until `extra` additional bytes fit, making the
    /// logical queue physically contiguous at `[0, used_space)` in the
    /// process (so the old wrap point, if any, is eliminated).
    fn grow_to_fit(&mut self, extra: usize) -> Result<(), ()> {
        let max_capacity = usize::MAX / 2;
        let used = self.used_space();
        let mut new_capacity = self.capacity;
        while new_capacity - used < extra {
            if new_capacity >= max_capacity {
                return Err(());
            }
            new_capacity = (new_capacity + new_capacity / 2).max(new_capacity + 1);
            new_capacity = new_capacity.min(max_capacity);
        }

        let mut grown = vec![0u8; new_capacity];
        let copied = self.peek_all_into(&mut grown[..used]);
        debug_assert_eq!(copied, used);

        self.buffer = grown;
        self.capacity = new_capacity;
        self.read_index.store(0, Ordering::Release);
        self.write_index.store(used, Ordering::Release);
        Ok(())
    }

    fn peek_all_into(&self, dst: &mut [u8]) -> usize {
        let used = self.used_space();
        debug_assert!(dst.len() >= used);
        if used == 0 {
            return 0;
        }
        let read_index = self.read_index.load(Ordering::Acquire);
        let start = read_index % self.capacity;
        let first_len = used.min(self.capacity - start);
        dst[..first_len].copy_from_slice(&self.buffer[start..start + first_len]);
        if first_len < used {
            let rest_len = used - first_len;
            dst[first_len..used].copy_from_slice(&self.buffer[..rest_len]);
        }
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrips() {
        let mut rb = RingBuffer::new(64);
        rb.write(b"hello").unwrap();
        assert_eq!(rb.used_space(), 5);
        let mut out = [0u8; 5];
        assert_eq!(rb.read(&mut out), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(rb.used_space(), 0);
    }

    #[test]
    fn read_returns_min_of_requested_and_used() {
        let mut rb = RingBuffer::new(64);
        rb.write(b"abc").unwrap();
        let mut out = [0u8; 10];
        assert_eq!(rb.read(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn peek_then_read_agree_and_peek_does_not_advance() {
        let mut rb = RingBuffer::new(64);
        rb.write(b"xyz123").unwrap();
        let mut peeked = [0u8; 3];
        assert_eq!(rb.peek(&mut peeked), 3);
        assert_eq!(&peeked, b"xyz");
        assert_eq!(rb.used_space(), 6);

        let mut read = [0u8; 3];
        assert_eq!(rb.read(&mut read), 3);
        assert_eq!(peeked, read);
        assert_eq!(rb.used_space(), 3);
    }

    #[test]
    fn drained_indices_reset_and_roundtrip_again() {
        let mut rb = RingBuffer::new(64);
        rb.write(b"first").unwrap();
        let mut buf = [0u8; 5];
        rb.read(&mut buf);
        assert_eq!(rb.used_space(), 0);

        rb.write(b"second").unwrap();
        let mut buf2 = [0u8; 6];
        assert_eq!(rb.read(&mut buf2), 6);
        assert_eq!(&buf2, b"second");
    }

    #[test]
    fn growth_preserves_bytes_across_wraparound() {
        let mut rb = RingBuffer::new(MIN_BUFFER_SIZE);
        // Fill most of the buffer, drain some, then force a wrap and a grow.
        let chunk = vec![1u8; MIN_BUFFER_SIZE - 4];
        rb.write(&chunk).unwrap();
        let mut sink = vec![0u8; MIN_BUFFER_SIZE - 4 - 2];
        rb.read(&mut sink);
        // write_index is now near the end; this write wraps the tail.
        let wrap_chunk = vec![2u8; 20];
        rb.write(&wrap_chunk).unwrap();
        // Now force growth with a big write while data still straddles the
        // wrap boundary.
        let big = vec![3u8; MIN_BUFFER_SIZE * 3];
        rb.write(&big).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&chunk[chunk.len() - 2..]);
        expected.extend_from_slice(&wrap_chunk);
        expected.extend_from_slice(&big);

        let mut out = vec![0u8; expected.len()];
        assert_eq!(rb.read(&mut out), expected.len());
        assert_eq!(out, expected);
    }

    #[test]
    fn sequence_of_writes_and_reads_preserves_order() {
        let mut rb = RingBuffer::new(MIN_BUFFER_SIZE);
        let writes: &[&[u8]] = &[b"AB", b"CDE", b"", b"FGHIJKLMNOP"];
        for w in writes {
            rb.write(w).unwrap();
        }
        let total: usize = writes.iter().map(|w| w.len()).sum();
        let mut out = vec![0u8; total];
        assert_eq!(rb.read(&mut out), total);
        let mut expected = Vec::new();
        for w in writes {
            expected.extend_from_slice(w);
        }
        assert_eq!(out, expected);
    }
}
