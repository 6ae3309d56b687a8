//! Error types for the relay library.

use std::fmt;

/// Errors that can occur in the relay library.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Queue**: [`InvariantViolation`](Self::InvariantViolation), a logic
///   defect detected while mutating a track's buffer queue. Never repaired;
///   the subsystem that hit it is torn down.
/// - **Resources**: [`Allocation`](Self::Allocation), [`Io`](Self::Io).
/// - **Protocol**: [`Parse`](Self::Parse).
/// - **Media**: [`MountNotFound`](Self::MountNotFound),
///   [`UnsupportedSource`](Self::UnsupportedSource).
/// - **Server**: [`NotStarted`](Self::NotStarted),
///   [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A bounded resource ran out, such as the RTP port range.
    /// The caller aborts the request or session, not the process.
    #[error("resource exhausted: {0}")]
    Allocation(&'static str),

    /// Buffer queue bookkeeping no longer adds up.
    #[error("buffer queue invariant violated: {kind}")]
    InvariantViolation { kind: InvariantKind },

    /// No mount registered (or openable) at the requested path.
    #[error("mount not found: {0}")]
    MountNotFound(String),

    /// No media source implementation recognizes the given name.
    #[error("unsupported media source: {0}")]
    UnsupportedSource(String),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// [`Server::stop`](crate::Server::stop) was called on a server that never started.
    #[error("server not started")]
    NotStarted,

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

impl RelayError {
    pub(crate) fn invariant(kind: InvariantKind) -> Self {
        tracing::error!(%kind, "buffer queue invariant violated");
        RelayError::InvariantViolation { kind }
    }

    /// Whether this error signals a logic defect rather than an
    /// environmental failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, RelayError::InvariantViolation { .. })
    }
}

/// Which buffer queue invariant was broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantKind {
    /// A unit other than the queue head became fully seen.
    EvictNonHead,
    /// A unit's seen count would exceed the number of consumers.
    SeenOverflow,
    /// A departing consumer found a unit it never counted.
    SeenUnderflow,
    /// The producer wrote to a stopped track.
    EnqueueAfterStop,
    /// A discontinuity was signalled on a stopped track.
    ResetAfterStop,
    /// An explicit sequence number did not exceed the queue tail.
    NonMonotonicSequence,
    /// A consumer departed from a track with no registered consumers.
    NoConsumers,
}

impl fmt::Display for InvariantKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EvictNonHead => write!(f, "eviction of a unit that is not the queue head"),
            Self::SeenOverflow => write!(f, "seen count exceeds consumer count"),
            Self::SeenUnderflow => write!(f, "seen count below zero on consumer departure"),
            Self::EnqueueAfterStop => write!(f, "enqueue on a stopped track"),
            Self::ResetAfterStop => write!(f, "reset of a stopped track"),
            Self::NonMonotonicSequence => write!(f, "sequence number not strictly increasing"),
            Self::NoConsumers => write!(f, "departure with zero consumers"),
        }
    }
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// `Content-Length` was present but not a number.
    InvalidContentLength,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::InvalidContentLength => write!(f, "invalid content length"),
        }
    }
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
