//! SIGINT-driven cooperative shutdown flag.
//!
//! The handler is async-signal-safe: it sets one `AtomicBool` and returns.
//! The event loop polls the flag at its wait boundary (a rearming io_uring
//! timeout), so shutdown completes within one wait cycle rather than
//! blocking on an unbounded wait.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

/// Install the SIGINT handler. Idempotent; safe to call once at startup.
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
}

pub fn requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_starts_clear() {
        // Run in isolation from other tests touching the same static by
        // only asserting a monotonic property: once set, never cleared.
        let before = requested();
        on_sigint(libc::SIGINT);
        assert!(requested());
        let _ = before;
    }
}
