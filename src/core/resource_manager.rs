//! Ordered bring-up and tear-down of the server's five owned resources.
//!
//! Bring-up order is SERVER_SOCKET → IO_URING → FIXED_BUFFERS →
//! CONNECTION_POOL → CONNECTIONS_ARRAY; `cleanup` runs the reverse order and
//! tears down whatever was allocated regardless of where bring-up stopped.

use std::net::TcpListener;
use std::os::unix::io::{IntoRawFd, RawFd};

use socket2::{Domain, Socket, Type};

#[cfg(target_os = "linux")]
use io_uring::IoUring;

use crate::config::Config;
use crate::core::connection::ConnectionsArray;
use crate::core::connection_pool::ConnectionPool;
#[cfg(target_os = "linux")]
use crate::core::fixed_buffers::FixedBufferRegistry;
use crate::error::{handle_error, ErrorCode};

pub struct Resources {
    pub server_socket: RawFd,
    #[cfg(target_os = "linux")]
    pub ring: IoUring,
    #[cfg(target_os = "linux")]
    pub fixed_buffers: FixedBufferRegistry,
    pub connection_pool: ConnectionPool,
    pub connections: ConnectionsArray,
}

impl Resources {
    /// Bring up every resource in order; on any failure, tear down whatever
    /// already succeeded and return the error.
    pub fn bring_up(config: &Config) -> Result<Self, ErrorCode> {
        let server_socket = setup_listening_socket(config.port)?;

        #[cfg(target_os = "linux")]
        {
            let ring = IoUring::builder()
                .build(config.queue_depth)
                .map_err(|_| {
                    handle_error(ErrorCode::UringInitFailed, "Failed to initialize io_uring");
                    ErrorCode::UringInitFailed
                })?;

            let fixed_buffers = match FixedBufferRegistry::setup(
                &ring,
                config.buffer_count,
                config.buffer_size,
            ) {
                Ok(fb) => fb,
                Err(_) => {
                    unsafe { libc::close(server_socket) };
                    handle_error(
                        ErrorCode::ResourceInitFailed,
                        "Failed to set up fixed-buffer registry",
                    );
                    return Err(ErrorCode::ResourceInitFailed);
                }
            };

            let connection_pool =
                ConnectionPool::new(crate::core::connection_pool::INITIAL_CONNECTIONS).ok_or_else(
                    || {
                        unsafe { libc::close(server_socket) };
                        handle_error(
                            ErrorCode::MemoryAllocFailed,
                            "Failed to create connection pool",
                        );
                        ErrorCode::MemoryAllocFailed
                    },
                )?;

            let connections = ConnectionsArray::new(config.max_connections);

            Ok(Self {
                server_socket,
                ring,
                fixed_buffers,
                connection_pool,
                connections,
            })
        }

        #[cfg(not(target_os = "linux"))]
        {
            let _ = server_socket;
            handle_error(
                ErrorCode::ResourceInitFailed,
                "io_uring is only available on Linux",
            );
            Err(ErrorCode::ResourceInitFailed)
        }
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        unsafe { libc::close(self.server_socket) };
    }
}

fn setup_listening_socket(port: u16) -> Result<RawFd, ErrorCode> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None).map_err(|_| {
        handle_error(ErrorCode::SocketCreateFailed, "Failed to create server socket");
        ErrorCode::SocketCreateFailed
    })?;

    socket.set_reuse_address(true).map_err(|_| {
        handle_error(
            ErrorCode::SocketCreateFailed,
            "setsockopt(SO_REUSEADDR) failed",
        );
        ErrorCode::SocketCreateFailed
    })?;
    #[cfg(unix)]
    socket.set_reuse_port(true).ok();

    let addr = std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into()).map_err(|_| {
        handle_error(ErrorCode::SocketBindFailed, "Failed to bind server socket");
        ErrorCode::SocketBindFailed
    })?;
    socket.listen(libc::SOMAXCONN).map_err(|_| {
        handle_error(
            ErrorCode::SocketListenFailed,
            "Failed to listen on server socket",
        );
        ErrorCode::SocketListenFailed
    })?;

    let listener: TcpListener = socket.into();
    Ok(listener.into_raw_fd())
}
