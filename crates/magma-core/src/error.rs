//! # MAGMA Error Handling
//!
//! Error types shared by the push buffer stack.
//!
//! Error handling in MAGMA follows these principles:
//! - Errors are typed and categorized
//! - No panics in production code paths
//! - Capacity errors are recoverable, everything else is reported as-is
//! - Errors are `no_std` compatible

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// MAGMA Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERRNO VALUES
// =============================================================================

const ENOENT: i32 = 2;
const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;
const EOVERFLOW: i32 = 75;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// MAGMA unified error type
///
/// Errors are categorized by subsystem. Command submission errors follow the
/// recovery rules of the push buffer: [`Error::NoSpace`] may be retried once
/// after a flush, the others are returned to the caller unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Object is not in a state that allows the operation
    InvalidState,
    /// Resource is busy
    Busy,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Out of system memory
    OutOfMemory,
    /// Allocation failed
    AllocationFailed,
    /// Memory mapping failed
    MappingFailed,
    /// Buffer overflow
    BufferOverflow,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Record capacity exhausted (buffer references or push entries)
    NoSpace,
    /// Target channel is not a FIFO channel
    InvalidChannelClass,
    /// Hardware queue operation failed with a raw status
    QueueError(u32),
    /// Hardware queue rejected a kickoff
    SubmissionRejected(u32),
}

impl Error {
    /// Check if the error is a capacity error that a flush can resolve
    #[inline]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::NoSpace)
    }

    /// Map to a negative errno-style status code
    ///
    /// Hardware statuses are passed through negated, the way the channel
    /// layer reports them.
    pub const fn errno(&self) -> i32 {
        match self {
            Self::InvalidParameter | Self::InvalidState | Self::InvalidChannelClass => -EINVAL,
            Self::NotFound => -ENOENT,
            Self::Busy => -EBUSY,
            Self::OutOfMemory | Self::AllocationFailed => -ENOMEM,
            Self::MappingFailed => -EFAULT,
            Self::BufferOverflow => -EOVERFLOW,
            Self::NoSpace => -ENOSPC,
            Self::QueueError(code) | Self::SubmissionRejected(code) => (*code as i32).wrapping_neg(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::InvalidState => write!(f, "invalid state"),
            Self::Busy => write!(f, "resource busy"),

            // Memory
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::MappingFailed => write!(f, "memory mapping failed"),
            Self::BufferOverflow => write!(f, "buffer overflow"),

            // Command
            Self::NoSpace => write!(f, "no space left in push buffer record"),
            Self::InvalidChannelClass => write!(f, "channel is not a FIFO channel"),
            Self::QueueError(code) => write!(f, "GPU queue error: {:#x}", code),
            Self::SubmissionRejected(code) => write!(f, "GPU queue rejected submission: {:#x}", code),
        }
    }
}
