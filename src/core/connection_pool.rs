//! Thin façade over `slab.rs` specialized for `Connection`.
//!
//! `acquire` obtains a block from the underlying slab and resets it to a
//! fresh connection's fields; `release` tears down the connection's owned
//! resources (closing is the event loop's job, this just resets buffers and
//! fixed-buffer state) before returning the block to the slab: a connection
//! returned to the slab has its ring buffers destroyed first, and re-use
//! always yields a freshly reset struct, never stale bytes.

use super::connection::{ConnHandle, Connection};
use super::slab::Slab;
use std::ptr::NonNull;

/// Default initial capacity for the connection slab.
pub const INITIAL_CONNECTIONS: usize = 1000;

/// Alignment used for connection blocks.
pub const CONNECTION_ALIGNMENT: usize = 64;

pub struct ConnectionPool {
    slab: Slab,
}

impl ConnectionPool {
    pub fn new(initial_blocks: usize) -> Option<Self> {
        let slab = Slab::create(
            std::mem::size_of::<Connection>(),
            initial_blocks,
            CONNECTION_ALIGNMENT,
        )?;
        Some(Self { slab })
    }

    /// Acquire a connection block, initializing it to a fresh, vacant
    /// connection. Returns `None` only if the underlying slab's allocator
    /// fails.
    pub fn acquire(&self, initial_buffer_size: usize) -> Option<ConnHandle> {
        let raw = self.slab.alloc()?;
        let ptr = raw.cast::<Connection>();
        // SAFETY: `ptr` came from a just-allocated slab block sized and
        // aligned for `Connection` (see `Slab::create` above); nothing has
        // been initialized there yet, so `write` doesn't drop garbage.
        unsafe {
            ptr.as_ptr().write(Connection::vacant(initial_buffer_size));
        }
        Some(ConnHandle(ptr))
    }

    /// Tear down the connection's owned resources and return its block to
    /// the slab. The caller must already have closed the fd and released
    /// any fixed-buffer index (the event loop's close-and-free does this
    /// before calling release).
    ///
    /// # Safety
    /// `handle` must be a handle previously returned by `acquire` on this
    /// same pool, not already released.
    pub unsafe fn release(&self, handle: ConnHandle) {
        let ptr: NonNull<Connection> = handle.0;
        // Drop the connection in place (frees its ring buffers' backing
        // Vecs) before the block goes back on the free list.
        std::ptr::drop_in_place(ptr.as_ptr());
        self.slab.free(ptr.cast::<u8>());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn acquire_resets_fields() {
        let pool = ConnectionPool::new(2).unwrap();
        let mut handle = pool.acquire(128).unwrap();
        unsafe {
            assert_eq!(handle.as_ref().fd, -1);
            assert!(handle.as_ref().fixed_buffer_index.is_none());
            handle
                .as_mut()
                .reset(7, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80), 128);
            assert_eq!(handle.as_ref().fd, 7);
            pool.release(handle);
        }
    }

    #[test]
    fn released_block_is_reused() {
        let pool = ConnectionPool::new(1).unwrap();
        let h1 = pool.acquire(64).unwrap();
        let p1 = h1.0;
        unsafe { pool.release(h1) };
        let h2 = pool.acquire(64).unwrap();
        assert_eq!(p1, h2.0);
        unsafe { pool.release(h2) };
    }
}
