//! Error types for the bridge library.

use std::fmt;

/// Errors that can occur in the bridge library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Wire**: [`InvalidHeader`](Self::InvalidHeader) — malformed datagrams.
/// - **Transport**: [`Io`](Self::Io) — socket failures.
/// - **Codec**: [`Codec`](Self::Codec) — encode/decode session failures.
/// - **Capability**: [`NoSources`](Self::NoSources),
///   [`SourceNotFound`](Self::SourceNotFound),
///   [`OutputUnavailable`](Self::OutputUnavailable).
/// - **Orchestrator**: [`AlreadyRunning`](Self::AlreadyRunning),
///   [`NotStarted`](Self::NotStarted),
///   [`InvalidAddress`](Self::InvalidAddress).
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A datagram failed header validation and was discarded.
    #[error("invalid header: {kind}")]
    InvalidHeader { kind: HeaderErrorKind },

    /// The underlying codec session reported a failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Discovery finished without finding any capturable source.
    #[error("no sources found on the local fabric")]
    NoSources,

    /// A source was requested by name but is not present after filtering.
    #[error("source not found: {0}")]
    SourceNotFound(String),

    /// The output side of the fabric could not be created.
    #[error("output unavailable: {0}")]
    OutputUnavailable(String),

    /// `start()` was called on an orchestrator that is already running.
    #[error("already running")]
    AlreadyRunning,

    /// An operation that requires a started orchestrator was called early.
    #[error("not started")]
    NotStarted,

    /// A `host:port` string could not be parsed into a socket address.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Specific kind of header validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderErrorKind {
    /// Datagram shorter than the minimum header length for its version.
    Truncated,
    /// The 4-byte magic tag did not match `NDIB`.
    BadMagic,
    /// The version byte is neither 1 (legacy) nor 2 (current).
    BadVersion,
    /// `fragmentIndex >= fragmentCount`.
    BadFragmentIndex,
}

impl fmt::Display for HeaderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated"),
            Self::BadMagic => write!(f, "bad magic"),
            Self::BadVersion => write!(f, "unsupported version"),
            Self::BadFragmentIndex => write!(f, "fragment index out of range"),
        }
    }
}

/// Convenience alias for `Result<T, BridgeError>`.
pub type Result<T> = std::result::Result<T, BridgeError>;
