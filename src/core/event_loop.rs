//! The io_uring-backed run loop: submits accept/read/write operations,
//! consumes completions, drives the per-connection state machine, and
//! invokes user callbacks synchronously inside completion handling.
//!
//! Single-threaded and cooperative: the thread calling `run` is the only
//! thread that ever touches a connection, the connections array, the fixed
//! buffer registry, or the ring.

#![cfg(target_os = "linux")]

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

use io_uring::{opcode, types, IoUring};

use crate::callbacks::Callbacks;
use crate::config::Config;
use crate::core::connection::ConnState;
use crate::core::resource_manager::Resources;
use crate::core::token::{OpType, TokenAllocator};
use crate::error::{handle_error, ErrorCode};
use crate::shutdown;

/// user_data value reserved for the self-rearming shutdown-wait timeout.
/// Never handed out by `TokenAllocator`, so it can't alias a real token.
const TIMEOUT_TOKEN: u64 = u64::MAX;

const TIMEOUT_MS: u32 = 100;

/// Run the event loop until a SIGINT-driven shutdown completes. Consumes
/// `resources`, tearing them down (in reverse bring-up order, via `Drop`)
/// before returning.
pub fn run(mut resources: Resources, config: Config, callbacks: Callbacks) -> io::Result<()> {
    println!("Starting server on port {}", config.port);

    let mut tokens = TokenAllocator::new(config.max_connections * 2 + 8);
    let listener_fd = resources.server_socket;

    submit_accept(&mut resources.ring, &mut tokens, listener_fd)?;

    let timeout_ts = types::Timespec::new().sec(0).nsec(TIMEOUT_MS * 1_000_000);
    submit_timeout(&mut resources.ring, &timeout_ts)?;

    println!("Server started. Press Ctrl+C to stop.");

    while !shutdown::requested() {
        match resources.ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                handle_error(ErrorCode::UringInitFailed, &format!("ring wait failed: {e}"));
                break;
            }
        }

        let completions: Vec<(u64, i32)> = resources
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        for (token, result) in completions {
            if token == TIMEOUT_TOKEN {
                if !shutdown::requested() {
                    let _ = submit_timeout(&mut resources.ring, &timeout_ts);
                }
                continue;
            }

            let op = match tokens.free(token) {
                Some(op) => op,
                None => continue,
            };

            match op {
                OpType::Accept => {
                    handle_accept(&mut resources, &mut tokens, listener_fd, &callbacks, result)
                }
                OpType::Read { fd } => handle_read(&mut resources, &mut tokens, &callbacks, fd, result),
                OpType::Write { fd } => handle_write(&mut resources, &mut tokens, &callbacks, fd, result),
            }
        }
    }

    sweep_remaining_connections(&mut resources, &callbacks);
    Ok(())
}

fn handle_accept(
    resources: &mut Resources,
    tokens: &mut TokenAllocator,
    listener_fd: RawFd,
    callbacks: &Callbacks,
    result: i32,
) {
    // Always rearm: there must be exactly one accept outstanding.
    if submit_accept(&mut resources.ring, tokens, listener_fd).is_err() {
        handle_error(ErrorCode::UringQueueFull, "failed to resubmit accept");
    }

    if result < 0 {
        handle_error(
            ErrorCode::SocketCreateFailed,
            &format!("accept failed: {}", io::Error::from_raw_os_error(-result)),
        );
        return;
    }

    let client_fd = result as RawFd;
    if client_fd as usize >= resources.connections.capacity() {
        handle_error(
            ErrorCode::ConnectionLimitReached,
            "accepted fd exceeds max_connections",
        );
        unsafe { libc::close(client_fd) };
        return;
    }

    let mut handle = match resources
        .connection_pool
        .acquire(crate::config::INITIAL_BUFFER_SIZE)
    {
        Some(h) => h,
        None => {
            handle_error(ErrorCode::MemoryAllocFailed, "connection pool exhausted");
            unsafe { libc::close(client_fd) };
            return;
        }
    };

    let peer_addr = getpeername(client_fd).unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    unsafe {
        handle
            .as_mut()
            .reset(client_fd, peer_addr, crate::config::INITIAL_BUFFER_SIZE);
    }
    resources.connections.insert(client_fd, handle);

    if let Some(cb) = callbacks.on_connect {
        cb(peer_addr);
    }

    if submit_read(resources, tokens, client_fd).is_err() {
        handle_error(ErrorCode::UringQueueFull, "failed to submit initial read");
    }
}

fn handle_read(
    resources: &mut Resources,
    tokens: &mut TokenAllocator,
    callbacks: &Callbacks,
    fd: RawFd,
    result: i32,
) {
    if result <= 0 {
        if result < 0 {
            handle_error(
                ErrorCode::UringQueueFull,
                &format!("read error on fd {fd}: {}", io::Error::from_raw_os_error(-result)),
            );
        }
        close_and_free(resources, callbacks, fd);
        return;
    }

    let n = result as usize;
    let (peer_addr, buf_index) = match unsafe { resources.connections.get(fd) } {
        Some(c) => match c.fixed_buffer_index {
            Some(idx) => (c.peer_addr, idx),
            None => return,
        },
        None => return,
    };

    // SAFETY: `buf_index` is reserved for this connection and the kernel
    // just delivered exactly `n` bytes into it via ReadFixed.
    let data = unsafe { std::slice::from_raw_parts(resources.fixed_buffers.buffer_ptr(buf_index), n) };

    // Stage through the read buffer and drain it straight back out, the way
    // the original echo path reads into a temp buffer before forwarding: the
    // read buffer never holds more than one read's worth of bytes.
    let mut drained = vec![0u8; n];
    if let Some(conn) = unsafe { resources.connections.get_mut(fd) } {
        let _ = conn.read_buffer.write(data);
        conn.read_buffer.read(&mut drained);
    }

    if let Some(cb) = callbacks.on_data {
        cb(peer_addr, &drained);
    }

    if let Some(conn) = unsafe { resources.connections.get_mut(fd) } {
        let _ = conn.write_buffer.write(&drained);
    }

    if submit_write(resources, tokens, fd).is_err() {
        handle_error(ErrorCode::UringQueueFull, "failed to submit write");
    }
}

fn handle_write(
    resources: &mut Resources,
    tokens: &mut TokenAllocator,
    callbacks: &Callbacks,
    fd: RawFd,
    result: i32,
) {
    if result <= 0 {
        if result < 0 {
            handle_error(
                ErrorCode::UringQueueFull,
                &format!("write error on fd {fd}: {}", io::Error::from_raw_os_error(-result)),
            );
        }
        close_and_free(resources, callbacks, fd);
        return;
    }

    let n = result as usize;
    let still_pending = match unsafe { resources.connections.get_mut(fd) } {
        Some(conn) => {
            conn.write_buffer.advance_read(n);
            conn.write_buffer.used_space() > 0
        }
        None => return,
    };

    let submit_result = if still_pending {
        submit_write(resources, tokens, fd)
    } else {
        if let Some(conn) = unsafe { resources.connections.get_mut(fd) } {
            conn.state = ConnState::Reading;
        }
        submit_read(resources, tokens, fd)
    };

    if submit_result.is_err() {
        handle_error(ErrorCode::UringQueueFull, "failed to resubmit after write");
    }
}

fn submit_accept(ring: &mut IoUring, tokens: &mut TokenAllocator, listener_fd: RawFd) -> io::Result<()> {
    let token = tokens.alloc(OpType::Accept);
    let sqe = opcode::Accept::new(types::Fd(listener_fd), std::ptr::null_mut(), std::ptr::null_mut())
        .build()
        .user_data(token);
    unsafe {
        ring.submission().push(&sqe).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })
    }
}

fn submit_timeout(ring: &mut IoUring, ts: &types::Timespec) -> io::Result<()> {
    let sqe = opcode::Timeout::new(ts as *const _).build().user_data(TIMEOUT_TOKEN);
    unsafe {
        ring.submission()
            .push(&sqe)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))
    }
}

fn submit_read(resources: &mut Resources, tokens: &mut TokenAllocator, fd: RawFd) -> io::Result<()> {
    let conn = unsafe { resources.connections.get_mut(fd) }
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    if conn.fixed_buffer_index.is_none() {
        conn.fixed_buffer_index = resources.fixed_buffers.acquire();
    }
    let buf_index = conn
        .fixed_buffer_index
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "fixed-buffer registry exhausted"))?;

    conn.state = ConnState::Reading;

    let buf_ptr = resources.fixed_buffers.buffer_ptr(buf_index);
    let buf_len = resources.fixed_buffers.buffer_size() as u32;

    let token = tokens.alloc(OpType::Read { fd });
    let sqe = opcode::ReadFixed::new(types::Fd(fd), buf_ptr, buf_len, buf_index as u16)
        .build()
        .user_data(token);
    unsafe {
        resources.ring.submission().push(&sqe).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })
    }
}

fn submit_write(resources: &mut Resources, tokens: &mut TokenAllocator, fd: RawFd) -> io::Result<()> {
    let conn = unsafe { resources.connections.get_mut(fd) }
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

    if conn.write_buffer.used_space() == 0 {
        return submit_read(resources, tokens, fd);
    }

    conn.state = ConnState::Writing;
    let (pos, len) = conn.write_buffer.contiguous_read_region();
    let buf_ptr = unsafe { conn.write_buffer.as_ptr().add(pos) };

    let token = tokens.alloc(OpType::Write { fd });
    let sqe = opcode::Send::new(types::Fd(fd), buf_ptr, len as u32)
        .build()
        .user_data(token);
    unsafe {
        resources.ring.submission().push(&sqe).map_err(|_| {
            tokens.free(token);
            io::Error::new(io::ErrorKind::Other, "submission queue full")
        })
    }
}

/// Clear the connections-array slot, close the fd, fire `on_disconnect`,
/// release the fixed-buffer index if assigned, and return the slot to the
/// pool. The array-slot check prevents a double close.
fn close_and_free(resources: &mut Resources, callbacks: &Callbacks, fd: RawFd) {
    let handle = match resources.connections.take(fd) {
        Some(h) => h,
        None => return,
    };

    let peer_addr = unsafe { handle.as_ref().peer_addr };
    if let Some(idx) = unsafe { handle.as_ref().fixed_buffer_index } {
        resources.fixed_buffers.release(idx);
    }
    unsafe { libc::close(fd) };

    if let Some(cb) = callbacks.on_disconnect {
        cb(peer_addr);
    }

    unsafe { resources.connection_pool.release(handle) };
}

fn sweep_remaining_connections(resources: &mut Resources, callbacks: &Callbacks) {
    let live: Vec<RawFd> = resources.connections.iter_live_fds().collect();
    for fd in live {
        close_and_free(resources, callbacks, fd);
    }
}

fn getpeername(fd: RawFd) -> Option<SocketAddrV4> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe { libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if rc != 0 {
        return None;
    }
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    let port = u16::from_be(addr.sin_port);
    Some(SocketAddrV4::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::net::TcpStream;
    use std::os::unix::io::IntoRawFd;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::thread;
    use std::time::Duration;

    fn small_config() -> Config {
        let mut config = Config::new(0);
        config.queue_depth = 8;
        config.buffer_count = 4;
        config.buffer_size = 64;
        config
    }

    fn bound_port(fd: RawFd) -> u16 {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
        assert_eq!(rc, 0);
        u16::from_be(addr.sin_port)
    }

    #[test]
    fn timeout_completion_carries_the_reserved_token() {
        let config = small_config();
        let mut resources = Resources::bring_up(&config).expect("bring up resources");
        let ts = types::Timespec::new().sec(0).nsec(5_000_000);

        submit_timeout(&mut resources.ring, &ts).unwrap();
        resources.ring.submit_and_wait(1).unwrap();

        let cqe = resources.ring.completion().next().expect("a completion");
        assert_eq!(cqe.user_data(), TIMEOUT_TOKEN);
    }

    #[test]
    fn accept_completion_yields_the_connecting_clients_fd() {
        let config = small_config();
        let mut resources = Resources::bring_up(&config).expect("bring up resources");
        let mut tokens = TokenAllocator::new(8);
        let listener_fd = resources.server_socket;
        let port = bound_port(listener_fd);

        submit_accept(&mut resources.ring, &mut tokens, listener_fd).unwrap();

        let client = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            TcpStream::connect(("127.0.0.1", port)).expect("client connect")
        });

        resources.ring.submit_and_wait(1).unwrap();
        let cqe = resources.ring.completion().next().expect("a completion");
        assert!(cqe.result() >= 0, "accept should yield a non-negative fd");

        let op = tokens.free(cqe.user_data()).expect("token was allocated");
        assert_eq!(op, OpType::Accept);

        unsafe { libc::close(cqe.result()) };
        let _stream = client.join().unwrap();
    }

    static DISCONNECT_CALLED: AtomicBool = AtomicBool::new(false);

    fn record_disconnect(_addr: SocketAddrV4) {
        DISCONNECT_CALLED.store(true, AtomicOrdering::SeqCst);
    }

    #[test]
    fn close_and_free_releases_the_fixed_buffer_and_clears_the_slot() {
        DISCONNECT_CALLED.store(false, AtomicOrdering::SeqCst);

        let config = small_config();
        let mut resources = Resources::bring_up(&config).expect("bring up resources");

        // A real throwaway fd, so `close_and_free`'s `libc::close` has
        // something legitimate to close instead of an arbitrary number.
        let throwaway = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = throwaway.into_raw_fd();
        let peer = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9000);

        let mut handle = resources
            .connection_pool
            .acquire(crate::config::INITIAL_BUFFER_SIZE)
            .unwrap();
        unsafe {
            handle
                .as_mut()
                .reset(fd, peer, crate::config::INITIAL_BUFFER_SIZE);
        }
        let buf_index = resources.fixed_buffers.acquire().unwrap();
        unsafe { handle.as_mut().fixed_buffer_index = Some(buf_index) };
        resources.connections.insert(fd, handle);

        let callbacks = Callbacks {
            on_connect: None,
            on_disconnect: Some(record_disconnect),
            on_data: None,
        };

        close_and_free(&mut resources, &callbacks, fd);

        assert!(!resources.connections.contains(fd));
        assert!(DISCONNECT_CALLED.load(AtomicOrdering::SeqCst));
        // The index just released is the lowest clear bit again.
        assert_eq!(resources.fixed_buffers.acquire(), Some(buf_index));
    }
}
