//! Resolved server configuration.
//!
//! No TOML/CLI-framework surface here (see `main.rs` for why): `Config` is
//! built directly from a validated port plus tunables derived from the
//! process's file-descriptor limit.

/// Depth of the submission/completion ring.
pub const QUEUE_DEPTH: u32 = 32768;

/// Number of slots in the fixed-buffer registry.
pub const BUFFER_COUNT: usize = 4096;

/// Size in bytes of each fixed-buffer slot.
pub const BUFFER_SIZE: usize = 2048;

/// Initial size of a fresh connection's read/write ring buffers.
pub const INITIAL_BUFFER_SIZE: usize = 1024;

/// Fallback `max_connections` when `getrlimit` fails.
const DEFAULT_MAX_CONNECTIONS: usize = 1000;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub port: u16,
    pub max_connections: usize,
    pub queue_depth: u32,
    pub buffer_count: usize,
    pub buffer_size: usize,
}

impl Config {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            max_connections: derive_max_connections(),
            queue_depth: QUEUE_DEPTH,
            buffer_count: BUFFER_COUNT,
            buffer_size: BUFFER_SIZE,
        }
    }
}

/// `max(rlim_cur - 1000, rlim_cur / 2)`, falling back to 1000 if the
/// `getrlimit` call fails.
fn derive_max_connections() -> usize {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ok = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } == 0;
    if !ok {
        return DEFAULT_MAX_CONNECTIONS;
    }
    let cur = rlim.rlim_cur as usize;
    cur.saturating_sub(1000).max(cur / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_the_requested_port() {
        let cfg = Config::new(7001);
        assert_eq!(cfg.port, 7001);
        assert_eq!(cfg.queue_depth, QUEUE_DEPTH);
    }

    #[test]
    fn derived_max_connections_is_never_zero() {
        assert!(derive_max_connections() > 0);
    }
}
