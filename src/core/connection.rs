//! Connection state and the fd-indexed connections array.
//!
//! Connections are allocated out of the slab in `connection_pool.rs`, not
//! the global allocator — the array here stores the resulting raw pointers.
//! Only the event-loop thread ever dereferences them, so no synchronization
//! is needed around the pointers themselves.

use super::ring_buffer::RingBuffer;
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

/// Current state of a connection. Exactly one I/O op is outstanding per
/// connection at any time: `Reading` means that op is a recv, `Writing`
/// means it's a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Reading,
    Writing,
}

/// One accepted TCP client. Owns its two ring buffers and, if assigned, its
/// fixed-buffer index exclusively until close.
pub struct Connection {
    pub fd: RawFd,
    pub peer_addr: SocketAddrV4,
    pub state: ConnState,
    pub read_buffer: RingBuffer,
    pub write_buffer: RingBuffer,
    /// Index into the fixed-buffer registry's arena, reserved for this
    /// connection's reads until close. Acquired lazily on first read.
    pub fixed_buffer_index: Option<usize>,
}

impl Connection {
    /// A freshly reset connection: fd=-1, no fixed buffer, fresh buffers,
    /// initial state READING.
    pub fn vacant(initial_buffer_size: usize) -> Self {
        Self {
            fd: -1,
            peer_addr: SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0),
            state: ConnState::Reading,
            read_buffer: RingBuffer::new(initial_buffer_size),
            write_buffer: RingBuffer::new(initial_buffer_size),
            fixed_buffer_index: None,
        }
    }

    pub fn reset(&mut self, fd: RawFd, peer_addr: SocketAddrV4, initial_buffer_size: usize) {
        self.fd = fd;
        self.peer_addr = peer_addr;
        self.state = ConnState::Reading;
        self.read_buffer = RingBuffer::new(initial_buffer_size);
        self.write_buffer = RingBuffer::new(initial_buffer_size);
        self.fixed_buffer_index = None;
    }
}

/// A handle to a slab-allocated `Connection`. Not `Copy` to discourage
/// accidental aliasing; `ConnectionsArray` is the sole long-lived owner of
/// one per live fd.
pub struct ConnHandle(pub NonNull<Connection>);

impl ConnHandle {
    /// # Safety
    /// The pointee must remain valid (i.e. not yet returned to the slab)
    /// for the lifetime of the returned reference.
    #[inline]
    pub unsafe fn as_ref(&self) -> &Connection {
        self.0.as_ref()
    }

    /// # Safety
    /// Same as `as_ref`, plus exclusive access for the duration of the
    /// borrow (guaranteed here because only the event-loop thread calls
    /// this, and it never holds two mutable borrows of the same handle at
    /// once).
    #[inline]
    pub unsafe fn as_mut(&mut self) -> &mut Connection {
        self.0.as_mut()
    }
}

/// Dense fd → connection mapping. Entry at index `fd` is `Some` iff a
/// connection with that fd is live; cleared before `close(fd)` so a
/// concurrently-reused fd from a subsequent accept can't alias a stale slot.
pub struct ConnectionsArray {
    slots: Vec<Option<ConnHandle>>,
}

impl ConnectionsArray {
    pub fn new(max_connections: usize) -> Self {
        let mut slots = Vec::with_capacity(max_connections);
        slots.resize_with(max_connections, || None);
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.slot(fd).map(Option::is_some).unwrap_or(false)
    }

    /// # Safety
    /// See `ConnHandle::as_ref`.
    pub unsafe fn get(&self, fd: RawFd) -> Option<&Connection> {
        Some(self.slot(fd)?.as_ref()?.as_ref())
    }

    /// # Safety
    /// See `ConnHandle::as_mut`.
    pub unsafe fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return None;
        }
        self.slots[fd as usize].as_mut().map(|h| h.as_mut())
    }

    pub fn insert(&mut self, fd: RawFd, handle: ConnHandle) {
        debug_assert!(fd >= 0 && (fd as usize) < self.slots.len());
        self.slots[fd as usize] = Some(handle);
    }

    /// Clear the slot and hand back the handle (if any) for the caller to
    /// tear down and return to the pool. Clearing happens unconditionally
    /// on this call, before the fd is closed, so a subsequently reused fd
    /// can never alias a stale slot.
    pub fn take(&mut self, fd: RawFd) -> Option<ConnHandle> {
        if fd < 0 || fd as usize >= self.slots.len() {
            return None;
        }
        self.slots[fd as usize].take()
    }

    pub fn iter_live_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(fd, slot)| slot.as_ref().map(|_| fd as RawFd))
    }

    fn slot(&self, fd: RawFd) -> Option<&Option<ConnHandle>> {
        if fd < 0 {
            return None;
        }
        self.slots.get(fd as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddrV4 {
        SocketAddrV4::new(std::net::Ipv4Addr::new(127, 0, 0, 1), 1234)
    }

    #[test]
    fn insert_get_take_roundtrip() {
        let mut arr = ConnectionsArray::new(16);
        assert!(!arr.contains(3));

        let mut conn = Box::new(Connection::vacant(64));
        conn.reset(3, addr(), 64);
        let ptr = NonNull::new(Box::into_raw(conn)).unwrap();
        arr.insert(3, ConnHandle(ptr));

        assert!(arr.contains(3));
        unsafe {
            assert_eq!(arr.get(3).unwrap().fd, 3);
        }

        let taken = arr.take(3).unwrap();
        assert!(!arr.contains(3));
        unsafe {
            assert_eq!(taken.as_ref().fd, 3);
            drop(Box::from_raw(taken.0.as_ptr()));
        }
    }

    #[test]
    fn negative_fd_is_never_present() {
        let arr = ConnectionsArray::new(16);
        assert!(!arr.contains(-1));
    }
}
