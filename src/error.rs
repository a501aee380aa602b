//! Error taxonomy and reporting.
//!
//! Every failure path funnels through `handle_error`, which both logs a
//! structured `tracing::error!` event and writes the literal
//! `Error: <message> (Code: <n>)` line to stderr that callers and tests rely
//! on verbatim.

use std::fmt;

/// Stable error identifiers. Numeric order matches discriminant order; do
/// not reorder variants, the discriminant is logged and may be depended on
/// by external tooling parsing the stderr line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0,
    MemoryAllocFailed = 1,
    SocketCreateFailed = 2,
    SocketBindFailed = 3,
    SocketListenFailed = 4,
    UringInitFailed = 5,
    UringQueueFull = 6,
    ConnectionLimitReached = 7,
    InvalidArgument = 8,
    ResourceInitFailed = 9,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ErrorCode {
    /// Whether this code, raised during startup, should terminate the
    /// process after logging.
    pub fn is_fatal_at_startup(self) -> bool {
        matches!(
            self,
            ErrorCode::MemoryAllocFailed
                | ErrorCode::SocketCreateFailed
                | ErrorCode::UringInitFailed
                | ErrorCode::ResourceInitFailed
        )
    }
}

/// Log `message`/`code` both structurally and as the literal stderr line
/// required of every error path. Does not exit the process; callers decide
/// whether a given code is fatal via `ErrorCode::is_fatal_at_startup`.
pub fn handle_error(code: ErrorCode, message: &str) {
    tracing::error!(code = code as u8, "{message}");
    eprintln!("Error: {message} (Code: {})", code as u8);
}
