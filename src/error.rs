//! Error types for the engine.
//!
//! Kernel failures arrive as negated errno values in completion entries;
//! they are decoded into an [`ErrorKind`] once, at dispatch time. Local
//! validation failures never reach the kernel and are raised synchronously
//! from the scheduling call.

use std::fmt;
use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Kernel could not grab the resources needed for the request (EAGAIN).
    ResourceExhausted,
    /// Completion queue is overcommitted (EBUSY).
    CompletionQueueOverflow,
    /// The file descriptor in the submission entry is invalid (EBADF).
    InvalidDescriptor,
    /// Buffer address is wrong or buffers were not registered (EFAULT).
    InvalidBuffer,
    /// The submission entry is malformed (EINVAL), or a scheduling call
    /// failed local validation before any kernel interaction.
    CorruptedSubmission,
    /// The ring is in a broken state (ENXIO).
    RingCorrupted,
    /// Opcode not supported by this kernel (EOPNOTSUPP).
    Unsupported,
    /// The operation was interrupted by signal delivery (EINTR).
    Interrupted,
    /// Path does not exist (ENOENT).
    NotFound,
    /// Any other kernel error; the numeric code is preserved.
    Os,
    /// The engine has been shut down.
    Shutdown,
    /// Ring or buffer-ring construction failed.
    Setup,
}

/// An engine error.
#[derive(Debug)]
pub enum Error {
    /// A kernel-reported failure, decoded from a negated errno.
    Kernel { kind: ErrorKind, errno: i32 },
    /// A scheduling argument was rejected before any kernel interaction.
    InvalidArgument(String),
    /// Submission ring is full and a forced submit made no progress.
    RingFull,
    /// The engine is stopped; no further operations are accepted.
    Shutdown,
    /// Ring setup, memory mapping, or registration failed.
    Setup(io::Error),
    /// The running kernel predates the minimum supported version.
    UnsupportedKernel(String),
}

impl Error {
    /// Build a kernel error from a positive errno value.
    pub(crate) fn from_errno(errno: i32) -> Error {
        Error::Kernel {
            kind: kind_from_errno(errno),
            errno,
        }
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kernel { kind, .. } => *kind,
            // Local validation rejects what the kernel would call EINVAL.
            Error::InvalidArgument(_) => ErrorKind::CorruptedSubmission,
            Error::RingFull => ErrorKind::ResourceExhausted,
            Error::Shutdown => ErrorKind::Shutdown,
            Error::Setup(_) => ErrorKind::Setup,
            Error::UnsupportedKernel(_) => ErrorKind::Unsupported,
        }
    }

    /// The raw errno for kernel-reported failures.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

/// Map a positive errno to the error taxonomy.
pub(crate) fn kind_from_errno(errno: i32) -> ErrorKind {
    match errno {
        libc::EAGAIN => ErrorKind::ResourceExhausted,
        libc::EBUSY => ErrorKind::CompletionQueueOverflow,
        libc::EBADF => ErrorKind::InvalidDescriptor,
        libc::EFAULT => ErrorKind::InvalidBuffer,
        libc::EINVAL => ErrorKind::CorruptedSubmission,
        libc::ENXIO => ErrorKind::RingCorrupted,
        libc::EOPNOTSUPP => ErrorKind::Unsupported,
        libc::EINTR => ErrorKind::Interrupted,
        libc::ENOENT => ErrorKind::NotFound,
        _ => ErrorKind::Os,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Kernel { kind, errno } => {
                write!(
                    f,
                    "error code: {}; message: {} ({:?})",
                    errno,
                    io::Error::from_raw_os_error(*errno),
                    kind
                )
            }
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::RingFull => write!(f, "submission ring is full"),
            Error::Shutdown => write!(f, "engine is stopped"),
            Error::Setup(e) => write!(f, "ring setup failed: {}", e),
            Error::UnsupportedKernel(version) => {
                write!(
                    f,
                    "kernel {} is too old, io_uring file engine needs at least 5.11",
                    version
                )
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Setup(e) => Some(e),
            _ => None,
        }
    }
}
