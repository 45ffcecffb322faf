//! # Command Queue Types
//!
//! Strongly typed identifiers used across the queue services.
//!
//! Device indices and command types are plain integers on the hardware side;
//! wrapping them keeps a device index from ever being passed where a command
//! type is expected.

use core::fmt;

// =============================================================================
// DEVICE INDEX
// =============================================================================

/// Hardware device index in the processor table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceIndex(u32);

impl DeviceIndex {
    /// Create a new device index
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DeviceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dev{}", self.0)
    }
}

// =============================================================================
// COMMAND TYPE
// =============================================================================

/// Command type within a device's processor table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CommandType(u32);

impl CommandType {
    /// Create a new command type
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cmd{}", self.0)
    }
}

// =============================================================================
// PROCESS ID
// =============================================================================

/// Identifier of the process that owns a queue or submitted a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ProcessId(pub u32);

/// The kernel itself, used for queues created on behalf of the driver
pub const KERNEL_PROCESS: ProcessId = ProcessId(0);

// =============================================================================
// QUEUE ID
// =============================================================================

/// Identifier of a live command queue
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct QueueId(u32);

impl QueueId {
    /// Create a new queue ID
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue#{}", self.0)
    }
}

// =============================================================================
// CALLER IDENTITY
// =============================================================================

/// Identity presented when taking the process lock
///
/// The interrupt identity never blocks and never sees
/// [`Error::ProcessingBlocked`](crate::Error::ProcessingBlocked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerId {
    /// Hardware interrupt or its bottom half
    Isr,
    /// Kernel-internal caller (teardown, flush)
    Kernel,
    /// A user process submitting work
    Process(ProcessId),
}

impl CallerId {
    /// Check if this is the interrupt identity
    #[inline]
    pub const fn is_isr(&self) -> bool {
        matches!(self, CallerId::Isr)
    }
}

impl From<ProcessId> for CallerId {
    fn from(pid: ProcessId) -> Self {
        CallerId::Process(pid)
    }
}
