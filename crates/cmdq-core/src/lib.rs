//! # Helix Command Queue Core
//!
//! Foundational types shared by the GPU command queue services.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     helix-cmdq-core                         │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │    Sync     │  │   Types     │  │   Error / Config    │  │
//! │  │ (SyncData,  │  │ (DeviceIdx, │  │      / Time         │  │
//! │  │ SyncObject) │  │  CallerId)  │  │                     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing in here knows about queues or processors; those live in
//! `helix-cmdq`.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod sync;
pub mod time;
pub mod types;

// Re-exports for convenience
pub use config::QueueConfig;
pub use error::{Error, Result};
pub use sync::{SyncData, SyncObject};
pub use time::{wait_until, Clock, StepClock};
pub use types::*;

#[cfg(feature = "std")]
pub use time::StdClock;
