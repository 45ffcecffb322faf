//! # Helix Command Queue
//!
//! Fence-gated GPU command submission.
//!
//! ## Architecture
//!
//! ```text
//!  producers                       dispatcher                    hardware
//! ┌───────────┐  get_space    ┌──────────────────┐  process   ┌──────────┐
//! │ process / │ ────────────► │  CommandQueue    │ ─────────► │ processor│
//! │  kernel   │  insert       │  (FIFO, fences)  │  (cookie)  │  (kick)  │
//! └───────────┘  submit       └──────────────────┘            └────┬─────┘
//!                                      ▲                            │ irq
//!                                      │  process_queues            ▼
//!                              ┌───────┴──────────┐  command_complete
//!                              │   QueueManager   │ ◄───────────────┘
//!                              │ (lock, slots,    │
//!                              │  hooks, deferred)│
//!                              └──────────────────┘
//! ```
//!
//! - [`queue`]: circular arena of command records, staging and publication
//! - [`layout`]: byte layout of a command record
//! - [`processor`]: per `(device, type)` processors and completion slots
//! - [`dispatch`]: head-of-queue fence checks and dispatcher passes
//! - [`lock`]: the non-blocking dispatcher lock
//! - [`deferred`]: where completion re-scans run
//! - [`manager`]: the public services tying it together
//!
//! ## Usage
//!
//! ```ignore
//! let manager = QueueManager::new(QueueConfig::default(), clock, executor)?;
//! manager.register_cmd_processors(dev, processors, &[[1, 4]])?;
//!
//! let queue = manager.create_queue(pid, 4096)?;
//! let desc = CommandDesc::new(dev, CommandType::new(0))
//!     .writes(&[target])
//!     .reads(&sources)
//!     .data_size(16);
//! let cmd = manager.insert_command(&queue, &desc)?;
//! target.reserve_write();
//! manager.with_command_data(&queue, &cmd, |data| data.copy_from_slice(&payload))?;
//! manager.submit_command(&queue, cmd)?;
//! manager.process_queues(CallerId::Process(pid), false)?;
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod deferred;
pub mod dispatch;
pub mod layout;
pub mod lock;
pub mod manager;
pub mod processor;
pub mod queue;

// Re-exports for convenience
pub use deferred::{DeferredExecutor, DeferredWork, InlineExecutor, WorkQueue};
pub use dispatch::DispatchStats;
pub use layout::CommandHeader;
pub use lock::{ProcessGuard, ProcessLock};
pub use manager::QueueManager;
pub use processor::{
    CommandCompleteHook, CommandProcessor, CompletionSlot, ProcessorEntry, ProcessorTable,
    SlotCookie,
};
pub use queue::{
    Command, CommandDesc, CommandInfo, CommandQueue, QueueInfo, QueueState, QueueStats,
    Reservation, SyncSnapshot,
};

#[cfg(feature = "std")]
pub use deferred::ThreadExecutor;

pub use helix_cmdq_core::{
    CallerId, Clock, CommandType, DeviceIndex, Error, ProcessId, QueueConfig, QueueId, Result,
    StepClock, SyncData, SyncObject,
};
