//! Fixed-buffer registry: one contiguous arena registered once with the
//! submission ring, plus a bitmap tracking which indices are issued.
//!
//! Backs reads only: a connection lazily acquires one arena slot on its
//! first read, the kernel's `ReadFixed` opcode delivers bytes directly into
//! that slot, and the event loop copies the delivered bytes into the
//! connection's own growable ring buffer.

use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use io_uring::IoUring;

pub struct FixedBufferRegistry {
    arena: NonNull<u8>,
    layout: Layout,
    buffer_count: usize,
    buffer_size: usize,
    /// One bit per buffer; bit set means issued.
    bitmap: Vec<u64>,
}

// SAFETY: the arena is heap memory owned exclusively by this registry and
// only ever touched by the event-loop thread.
unsafe impl Send for FixedBufferRegistry {}

impl FixedBufferRegistry {
    /// Allocate `buffer_count * buffer_size` bytes and register them with
    /// `ring` as a single one-shot fixed-buffer registration. On any
    /// sub-failure all partial state is freed.
    #[cfg(target_os = "linux")]
    pub fn setup(ring: &IoUring, buffer_count: usize, buffer_size: usize) -> io::Result<Self> {
        let total = buffer_count
            .checked_mul(buffer_size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "arena size overflow"))?;
        let layout = Layout::from_size_align(total.max(1), 4096)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        // SAFETY: layout has non-zero size (guarded above).
        let arena = unsafe { alloc::alloc_zeroed(layout) };
        let arena = NonNull::new(arena)
            .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "arena allocation failed"))?;

        let iovecs: Vec<libc::iovec> = (0..buffer_count)
            .map(|i| libc::iovec {
                // SAFETY: `i * buffer_size` stays within `total` bytes by
                // construction of the loop bound.
                iov_base: unsafe { arena.as_ptr().add(i * buffer_size) } as *mut _,
                iov_len: buffer_size,
            })
            .collect();

        if let Err(e) = unsafe { ring.submitter().register_buffers(&iovecs) } {
            unsafe { alloc::dealloc(arena.as_ptr(), layout) };
            return Err(e);
        }

        let words = (buffer_count + 63) / 64;
        Ok(Self {
            arena,
            layout,
            buffer_count,
            buffer_size,
            bitmap: vec![0u64; words],
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Pointer to the start of buffer `index`.
    pub fn buffer_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.buffer_count);
        // SAFETY: bounds checked above (debug-only); callers hold a valid
        // index obtained from `acquire`.
        unsafe { self.arena.as_ptr().add(index * self.buffer_size) }
    }

    /// Lowest clear bit in the bitmap; sets it and returns its index, or
    /// `None` if every buffer is issued.
    pub fn acquire(&mut self) -> Option<usize> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                let index = word_idx * 64 + bit;
                if index >= self.buffer_count {
                    return None;
                }
                *word |= 1 << bit;
                return Some(index);
            }
        }
        None
    }

    pub fn release(&mut self, index: usize) {
        debug_assert!(index < self.buffer_count);
        let word_idx = index / 64;
        let bit = index % 64;
        self.bitmap[word_idx] &= !(1 << bit);
    }
}

impl Drop for FixedBufferRegistry {
    fn drop(&mut self) {
        // SAFETY: `arena`/`layout` were allocated together in `setup` and
        // never freed elsewhere.
        unsafe { alloc::dealloc(self.arena.as_ptr(), self.layout) };
    }
}
