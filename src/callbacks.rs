//! User callback registration.
//!
//! Three optional callbacks fire synchronously from the event loop:
//! `on_connect` after accept, `on_data` on each successful read, and
//! `on_disconnect` after close. The callback triple is process-wide
//! configuration, set once before the event loop runs and never mutated
//! thereafter.

use std::net::SocketAddrV4;

pub type OnConnect = fn(SocketAddrV4);
pub type OnDisconnect = fn(SocketAddrV4);
pub type OnData = fn(SocketAddrV4, &[u8]);

#[derive(Clone, Copy)]
pub struct Callbacks {
    pub on_connect: Option<OnConnect>,
    pub on_disconnect: Option<OnDisconnect>,
    pub on_data: Option<OnData>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_connect: Some(log_connect),
            on_disconnect: Some(log_disconnect),
            on_data: Some(log_data),
        }
    }
}

fn log_connect(addr: SocketAddrV4) {
    tracing::info!(peer = %addr, "new connection");
}

fn log_disconnect(addr: SocketAddrV4) {
    tracing::info!(peer = %addr, "disconnected");
}

fn log_data(addr: SocketAddrV4, data: &[u8]) {
    tracing::debug!(peer = %addr, bytes = data.len(), "received data");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_callbacks_are_all_present() {
        let cb = Callbacks::default();
        assert!(cb.on_connect.is_some());
        assert!(cb.on_disconnect.is_some());
        assert!(cb.on_data.is_some());
    }
}
