//! Closed error types for the session engine (spec §7, Design Note "Sum-typed
//! TLS error returns").

use thiserror::Error;

/// The phase a timeout fired in, for diagnostics (spec §7 "Timeouts").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// A single blocking helper I/O (read_exact/write_all/line helpers).
    Busy,
    /// The non-blocking connect() / IDENT lookup.
    Connect,
    /// Data-plane inactivity with at least one read side still open.
    Idle,
}

/// Terminal disposition of a session (spec §7). Transient causes (EINTR,
/// EAGAIN/EWOULDBLOCK) never materialize as a `SessionError`; they are
/// retried in place by the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{phase:?} timeout exceeded")]
    Timeout { phase: TimeoutPhase },

    #[error("terminal I/O error: {0}")]
    TerminalIo(#[source] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsIoError),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("descriptor limit exceeded (max {max})")]
    ResourceExhausted { max: usize },

    #[error("watchdog exceeded {iterations} iterations without progress")]
    Watchdog { iterations: u32 },

    #[error("connection refused: all {attempted} candidate address(es) failed")]
    ConnectFailed { attempted: usize },

    #[error("access denied for {peer}")]
    AccessDenied { peer: String },
}

impl SessionError {
    /// Whether cleanup should force an RST (SO_LINGER=0) rather than a
    /// graceful FIN. Per spec §7, only a peer's orderly close (ZERO_RETURN /
    /// read==0) is *not* an error and does not reach this type at all; every
    /// `SessionError` variant is therefore an RST-on-exit case.
    pub fn forces_rst(&self) -> bool {
        true
    }
}

/// Sum-typed result of a single TLS handshake/read/write/shutdown attempt,
/// mirroring OpenSSL's closed `get_error()` set
/// {NONE, WANT_READ, WANT_WRITE, WANT_X509_LOOKUP, SYSCALL, ZERO_RETURN, SSL}
/// projected onto what `rustls::Connection` can actually report.
#[derive(Debug, Error)]
pub enum TlsIoError {
    /// The underlying transport would block; the caller must poll for
    /// readability (handshake/read wants more ciphertext).
    #[error("TLS wants read")]
    WantRead,

    /// The underlying transport would block; the caller must poll for
    /// writability (handshake/write has ciphertext to flush).
    #[error("TLS wants write")]
    WantWrite,

    /// A non-fatal OS-level interruption occurred mid-syscall (EINTR/EAGAIN);
    /// retry the same operation.
    #[error("TLS I/O interrupted: {0}")]
    Syscall(#[source] std::io::Error),

    /// The peer sent a close_notify alert: orderly shutdown of this
    /// direction.
    #[error("TLS peer sent close_notify")]
    ZeroReturn,

    /// A fatal TLS protocol error (bad record, alert, decrypt failure, ...).
    #[error("TLS protocol error: {0}")]
    Protocol(#[from] rustls::Error),

    /// Any other fatal I/O error from the underlying transport.
    #[error("TLS transport error: {0}")]
    Io(#[source] std::io::Error),
}

impl TlsIoError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TlsIoError::WantRead | TlsIoError::WantWrite)
    }
}
