//! Error types for the stripekv storage engine.

use std::fmt;
use std::io;

/// The result type used throughout stripekv.
pub type Result<T> = std::result::Result<T, Error>;

/// Sub-code attached to lock-related failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSubCode {
    /// No additional detail.
    None,
    /// A mutex acquisition timed out.
    MutexTimeout,
    /// A key lock acquisition timed out.
    LockTimeout,
    /// The lock table is full.
    LockLimit,
}

/// The error type for stripekv operations.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(io::Error),

    /// Data corruption was detected.
    Corruption(String),

    /// The requested key was not found.
    NotFound(String),

    /// An invalid argument was provided.
    InvalidArgument(String),

    /// The operation is not supported (e.g. an unavailable compression codec).
    NotSupported(String),

    /// A read returned fewer bytes than required.
    Incomplete(String),

    /// The engine is shutting down; background work was aborted.
    ShutdownInProgress,

    /// The operation timed out.
    TimedOut(String),

    /// The operation was aborted.
    Aborted(String),

    /// A resource is busy.
    Busy(LockSubCode),

    /// A snapshot or lease has expired.
    Expired(String),

    /// A checksum mismatch was detected.
    ChecksumMismatch {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new not supported error.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    /// Creates a new incomplete-read error.
    pub fn incomplete(msg: impl Into<String>) -> Self {
        Error::Incomplete(msg.into())
    }

    /// Creates a new aborted error.
    pub fn aborted(msg: impl Into<String>) -> Self {
        Error::Aborted(msg.into())
    }

    /// Returns true if this error indicates verifiable on-disk damage.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::ChecksumMismatch { .. })
    }

    /// Best-effort clone, used to latch the first writer error while the
    /// original is returned to the caller.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::Corruption(m) => Error::Corruption(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::InvalidArgument(m) => Error::InvalidArgument(m.clone()),
            Error::NotSupported(m) => Error::NotSupported(m.clone()),
            Error::Incomplete(m) => Error::Incomplete(m.clone()),
            Error::ShutdownInProgress => Error::ShutdownInProgress,
            Error::TimedOut(m) => Error::TimedOut(m.clone()),
            Error::Aborted(m) => Error::Aborted(m.clone()),
            Error::Busy(sub) => Error::Busy(*sub),
            Error::Expired(m) => Error::Expired(m.clone()),
            Error::ChecksumMismatch { expected, actual } => {
                Error::ChecksumMismatch { expected: *expected, actual: *actual }
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Corruption(msg) => write!(f, "Data corruption: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::Incomplete(msg) => write!(f, "Incomplete read: {}", msg),
            Error::ShutdownInProgress => write!(f, "Shutdown in progress"),
            Error::TimedOut(msg) => write!(f, "Timed out: {}", msg),
            Error::Aborted(msg) => write!(f, "Aborted: {}", msg),
            Error::Busy(sub) => write!(f, "Busy: {:?}", sub),
            Error::Expired(msg) => write!(f, "Expired: {}", msg),
            Error::ChecksumMismatch { expected, actual } => {
                write!(f, "Checksum mismatch: expected {:#x}, got {:#x}", expected, actual)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Corruption(err.to_string())
    }
}
