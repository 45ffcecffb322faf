//! # Dispatcher
//!
//! Fence-gated hand-off of queued commands to their processors.
//!
//! ## Pass
//!
//! ```text
//!   for each queue:
//!     head ──► fences ready? ──► slot free? ──► processor accepts? ──► dequeue
//!                 │ no              │ no             │ no
//!                 ▼                 ▼                ▼
//!           FailedDependencies  FailedDependencies  CmdNotProcessed
//!                   (queue stops for this pass, siblings continue)
//! ```
//!
//! A blocked head blocks its own queue only. Without flush a queue gives up
//! at most one command per pass; with flush it keeps going until its head
//! blocks or it empties. Passes repeat while they make progress or while
//! another context has asked for one.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use helix_cmdq_core::{Error, Result};

use crate::lock::ProcessLock;
use crate::processor::ProcessorTable;
use crate::queue::{CommandQueue, Head};

// =============================================================================
// STATISTICS
// =============================================================================

/// Dispatcher-wide statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Walks over the queue list
    pub passes: u64,
    /// Commands handed to processors
    pub dispatched: u64,
    /// Calls that found the process lock held
    pub blocked_calls: u64,
    /// Extra lock acquisitions triggered by the reprocess flag
    pub reprocess_runs: u64,
    /// Completed slot occupancies
    pub completions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    passes: AtomicU64,
    dispatched: AtomicU64,
    pub(crate) blocked_calls: AtomicU64,
    pub(crate) reprocess_runs: AtomicU64,
    pub(crate) completions: AtomicU64,
}

impl DispatchCounters {
    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            passes: self.passes.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            blocked_calls: self.blocked_calls.load(Ordering::Relaxed),
            reprocess_runs: self.reprocess_runs.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// HEAD DISPATCH
// =============================================================================

/// Try to hand the head command to its processor
fn dispatch_head(head: Head<'_>, processors: &ProcessorTable, flush: bool) -> Result<()> {
    let header = *head.header();

    if !head.fences_ready(flush) {
        return Err(Error::FailedDependencies);
    }

    let Some(entry) = processors.lookup(header.device, header.command_type) else {
        log::error!(
            "Dispatcher: head command targets unregistered {:?}/{:?}",
            header.device,
            header.command_type
        );
        debug_assert!(false, "queued command for unregistered processor");
        return Err(Error::InvalidParams);
    };

    let slot = entry.slot();
    if !slot.accepts(header.dst_count, header.src_count) {
        log::error!(
            "Dispatcher: {:?}/{:?} command carries {}/{} syncs, slot holds {}/{}",
            header.device,
            header.command_type,
            header.dst_count,
            header.src_count,
            slot.max_dst(),
            slot.max_src()
        );
        return Err(Error::InvalidParams);
    }

    let cookie = slot.acquire(
        header.device,
        header.command_type,
        head.dst_syncs(),
        head.src_syncs(),
    )?;

    if !entry.processor().process(cookie, head.payload()) {
        slot.abandon(cookie);
        log::warn!(
            "Dispatcher: {:?}/{:?} processor declined command",
            header.device,
            header.command_type
        );
        return Err(Error::CmdNotProcessed);
    }

    head.retire();
    Ok(())
}

/// Dispatch from one queue, returning the number of commands handed off
pub(crate) fn dispatch_queue(queue: &CommandQueue, processors: &ProcessorTable, flush: bool) -> usize {
    let mut dispatched = 0;

    while let Some(head) = queue.head() {
        match dispatch_head(head, processors, flush) {
            Ok(()) => {
                dispatched += 1;
                if !flush {
                    break;
                }
            },
            Err(e) => {
                match e {
                    Error::FailedDependencies => queue.note_stall(),
                    Error::CmdNotProcessed => queue.note_rejection(),
                    _ => {},
                }
                log::trace!("Dispatcher: {:?} head not dispatched: {}", queue.id(), e);
                break;
            },
        }
    }

    dispatched
}

// =============================================================================
// PASSES
// =============================================================================

/// Walk the queue list until a pass makes no progress and nobody asked for
/// another, returning the number of commands dispatched
///
/// The caller holds `lock`; `queues` is the list it guards.
pub(crate) fn run_passes(
    lock: &ProcessLock<alloc::vec::Vec<Arc<CommandQueue>>>,
    queues: &[Arc<CommandQueue>],
    processors: &ProcessorTable,
    flush: bool,
    counters: &DispatchCounters,
) -> usize {
    let mut total = 0;

    loop {
        lock.take_reprocess();
        DispatchCounters::bump(&counters.passes);

        let progress: usize = queues
            .iter()
            .map(|queue| dispatch_queue(queue, processors, flush))
            .sum();
        total += progress;

        if progress == 0 && !lock.reprocess_requested() {
            break;
        }
    }

    counters
        .dispatched
        .fetch_add(total as u64, Ordering::Relaxed);
    total
}
