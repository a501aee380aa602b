//! Fixed-block-size allocator with a mutex-guarded free list.
//!
//! Each slot is its own heap allocation (grounded in the original C
//! `memory_pool.c`, which calls `aligned_alloc` per block rather than
//! carving one big arena). `alloc` pops the free list or allocates (and
//! records) a fresh block; `destroy`/`Drop` frees every recorded
//! allocation, issued or not — the slab owns the memory regardless of who
//! currently holds a slot.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

struct Inner {
    free_list: Vec<NonNull<u8>>,
    allocations: Vec<NonNull<u8>>,
}

// SAFETY: all access to `Inner` goes through `Slab`'s mutex; the raw
// pointers it holds are heap allocations owned exclusively by this slab.
unsafe impl Send for Inner {}

/// A fixed-block-size allocator. All operations are serialized by an
/// internal mutex; alloc/free ordering across threads is otherwise
/// unconstrained.
pub struct Slab {
    layout: Layout,
    inner: Mutex<Inner>,
}

impl Slab {
    /// `block_size` is rounded up to a multiple of `alignment`, which is
    /// itself rounded up to `max(requested, size_of::<*const u8>())` and
    /// then up to the next power of two. `initial_blocks` aligned slots are
    /// pre-allocated onto the free list.
    pub fn create(block_size: usize, initial_blocks: usize, alignment: usize) -> Option<Self> {
        let alignment = alignment
            .max(std::mem::size_of::<*const u8>())
            .next_power_of_two();
        let block_size = align_up(block_size.max(std::mem::size_of::<*const u8>()), alignment);
        let layout = Layout::from_size_align(block_size, alignment).ok()?;

        let mut inner = Inner {
            free_list: Vec::with_capacity(initial_blocks),
            allocations: Vec::with_capacity(initial_blocks),
        };
        for _ in 0..initial_blocks {
            let ptr = alloc_block(layout)?;
            inner.allocations.push(ptr);
            inner.free_list.push(ptr);
        }

        Some(Self {
            layout,
            inner: Mutex::new(inner),
        })
    }

    pub fn block_size(&self) -> usize {
        self.layout.size()
    }

    /// Pop a slot from the free list, allocating a fresh block if empty.
    /// Returns `None` only on allocation failure.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ptr) = inner.free_list.pop() {
            return Some(ptr);
        }
        let ptr = alloc_block(self.layout)?;
        inner.allocations.push(ptr);
        Some(ptr)
    }

    /// Return `ptr` to the free list. `ptr` must have been obtained from
    /// this slab; passing an unknown pointer is undefined behavior at the
    /// contract level (not validated, matching the original pool's
    /// documented contract).
    ///
    /// # Safety
    /// `ptr` must be a value previously returned by `alloc` on this same
    /// `Slab` and not already freed.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.inner.lock().unwrap().free_list.push(ptr);
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for ptr in inner.allocations.drain(..) {
            unsafe { alloc::dealloc(ptr.as_ptr(), self.layout) };
        }
    }
}

fn alloc_block(layout: Layout) -> Option<NonNull<u8>> {
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    NonNull::new(ptr)
}

fn align_up(size: usize, alignment: usize) -> usize {
    (size + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_non_overlapping_pointers() {
        let slab = Slab::create(64, 4, 64).unwrap();
        let a = slab.alloc().unwrap();
        let b = slab.alloc().unwrap();
        assert_ne!(a, b);
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0xAA, slab.block_size());
            std::ptr::write_bytes(b.as_ptr(), 0xBB, slab.block_size());
            assert_eq!(*a.as_ptr(), 0xAA);
            assert_eq!(*b.as_ptr(), 0xBB);
        }
    }

    #[test]
    fn freed_slot_is_reused() {
        let slab = Slab::create(32, 1, 16).unwrap();
        let a = slab.alloc().unwrap();
        unsafe { slab.free(a) };
        let b = slab.alloc().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn grows_beyond_initial_blocks() {
        let slab = Slab::create(16, 2, 16).unwrap();
        let _a = slab.alloc().unwrap();
        let _b = slab.alloc().unwrap();
        let c = slab.alloc().unwrap();
        assert!(!c.as_ptr().is_null());
    }

    #[test]
    fn block_size_respects_minimum_alignment() {
        let slab = Slab::create(1, 1, 1).unwrap();
        assert!(slab.block_size() >= std::mem::size_of::<*const u8>());
    }
}
