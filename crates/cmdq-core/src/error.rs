//! # Command Queue Error Handling
//!
//! Every failure the queue services can report. Nothing here is fatal: the
//! dispatcher treats most of these as "try again on the next pass".

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Command queue result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Command queue error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Admission Errors
    // =========================================================================
    /// Invalid parameter, unknown queue, or unregistered device/command type
    InvalidParams,
    /// Command (header, sync arrays and payload) exceeds the maximum size
    CmdTooBig,
    /// Queue storage or a registration table could not be allocated
    OutOfMemory,

    // =========================================================================
    // Capacity / Timeout Errors
    // =========================================================================
    /// The queue never had enough free space within the bounded wait
    CannotGetQueueSpace,
    /// The queue did not drain before the destroy timeout
    CannotFlushQueue,

    // =========================================================================
    // Scheduling Errors
    // =========================================================================
    /// The head command's fences are not satisfied, or its slot is busy
    FailedDependencies,
    /// The processor declined a command whose fences were satisfied
    CmdNotProcessed,
    /// Another context holds the process lock; the pass was deferred
    ProcessingBlocked,
}

impl Error {
    /// Expected scheduling outcome rather than a fault
    pub const fn is_scheduling(&self) -> bool {
        matches!(
            self,
            Self::FailedDependencies | Self::CmdNotProcessed | Self::ProcessingBlocked
        )
    }

    /// The caller may retry the same request later and expect success
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CannotGetQueueSpace
                | Self::FailedDependencies
                | Self::CmdNotProcessed
                | Self::ProcessingBlocked
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParams => write!(f, "invalid parameters"),
            Self::CmdTooBig => write!(f, "command too big"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::CannotGetQueueSpace => write!(f, "cannot get queue space"),
            Self::CannotFlushQueue => write!(f, "cannot flush queue"),
            Self::FailedDependencies => write!(f, "failed dependencies"),
            Self::CmdNotProcessed => write!(f, "command not processed"),
            Self::ProcessingBlocked => write!(f, "processing blocked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_error_categories() {
        assert!(Error::FailedDependencies.is_scheduling());
        assert!(Error::ProcessingBlocked.is_scheduling());
        assert!(!Error::CmdTooBig.is_scheduling());

        assert!(Error::CannotGetQueueSpace.is_retryable());
        assert!(!Error::CannotFlushQueue.is_retryable());
        assert!(!Error::InvalidParams.is_retryable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(Error::CmdTooBig.to_string(), "command too big");
        assert_eq!(Error::ProcessingBlocked.to_string(), "processing blocked");
    }
}
