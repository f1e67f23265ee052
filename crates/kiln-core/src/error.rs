//! # KILN Error Handling
//!
//! Error types shared by the batch buffer and the render-state primer.
//!
//! Batch errors (`OutOfSpace`, `InvalidArgument`) are recorded as a sticky
//! fault on the buffer that produced them. Everything else aborts the
//! submission sequence and is propagated to the caller.

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// KILN Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// KILN unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Backing memory object could not be allocated
    AllocationFailed,
    /// Memory object could not be pinned into the device address space
    PinFailed,
    /// Memory object could not be mapped into the host address space
    MappingFailed,

    // =========================================================================
    // Batch Errors
    // =========================================================================
    /// Instruction or state zone exhausted
    OutOfSpace,
    /// Relocation target outside the buffer, or a malformed alignment
    InvalidArgument,

    // =========================================================================
    // Submission Errors
    // =========================================================================
    /// Dispatch entry point rejected the batch
    DispatchFailed,
    /// Cache flush / barrier request failed
    FlushFailed,
    /// No completion request could be queued behind the batch
    RequestFailed,

    // =========================================================================
    // Completion Errors
    // =========================================================================
    /// Completion was not observed within the wait bound
    WaitTimeout,
    /// Waiting for completion failed
    WaitFailed,
}

impl Error {
    /// Convert to the negative errno value used at the kernel boundary
    pub const fn to_errno(self) -> i32 {
        match self {
            Self::AllocationFailed | Self::MappingFailed => -12, // ENOMEM
            Self::PinFailed => -28,                              // ENOSPC
            Self::OutOfSpace => -28,                             // ENOSPC
            Self::InvalidArgument => -22,                        // EINVAL
            Self::DispatchFailed | Self::FlushFailed | Self::RequestFailed => -5, // EIO
            Self::WaitTimeout => -110,                           // ETIMEDOUT
            Self::WaitFailed => -5,                              // EIO
        }
    }

    /// Check if this error is recorded as a sticky batch fault
    pub const fn is_batch_fault(self) -> bool {
        matches!(self, Self::OutOfSpace | Self::InvalidArgument)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Memory
            Self::AllocationFailed => write!(f, "object allocation failed"),
            Self::PinFailed => write!(f, "object pin failed"),
            Self::MappingFailed => write!(f, "object mapping failed"),

            // Batch
            Self::OutOfSpace => write!(f, "batch buffer out of space"),
            Self::InvalidArgument => write!(f, "invalid argument"),

            // Submission
            Self::DispatchFailed => write!(f, "batch dispatch failed"),
            Self::FlushFailed => write!(f, "cache flush failed"),
            Self::RequestFailed => write!(f, "request submission failed"),

            // Completion
            Self::WaitTimeout => write!(f, "seqno wait timeout"),
            Self::WaitFailed => write!(f, "seqno wait failed"),
        }
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::OutOfSpace.to_errno(), -28);
        assert_eq!(Error::InvalidArgument.to_errno(), -22);
        assert_eq!(Error::AllocationFailed.to_errno(), -12);
        assert_eq!(Error::WaitTimeout.to_errno(), -110);
    }

    #[test]
    fn test_batch_faults() {
        assert!(Error::OutOfSpace.is_batch_fault());
        assert!(Error::InvalidArgument.is_batch_fault());
        assert!(!Error::DispatchFailed.is_batch_fault());
        assert!(!Error::WaitFailed.is_batch_fault());
    }
}
