//! # Sync Objects
//!
//! Pending/complete operation counters that gate command dispatch.
//!
//! A resource owns one [`SyncData`]. Writers and readers are admitted
//! differently:
//!
//! - a destination (writer) captures both pending counters unchanged; the
//!   producer accounts for its own write with [`SyncData::reserve_write`]
//!   once the command is inserted, so the next writer captures one more
//! - a source (reader) captures both pending counters and bumps
//!   `read_ops_pending` in the same atomic step
//!
//! Either way the command waits until both complete counters equal the
//! values it captured: a writer waits for every earlier write and read, a
//! reader for every earlier write and every earlier read.
//!
//! The counters are plain relaxed atomics. They only ever grow by one, so a
//! stale read can make the dispatcher wait one more pass but can never make
//! it dispatch early.
//!
//! The two pending counters share one 64-bit word, so a capture always sees
//! a pair that existed at one instant.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// =============================================================================
// STALENESS
// =============================================================================

/// `complete` has reached or passed `snapshot`, modulo counter wraparound
#[inline]
pub const fn ops_reached(complete: u32, snapshot: u32) -> bool {
    complete.wrapping_sub(snapshot) < 0x8000_0000
}

// =============================================================================
// SYNC DATA
// =============================================================================

#[inline]
const fn split(pending: u64) -> (u32, u32) {
    (pending as u32, (pending >> 32) as u32)
}

#[inline]
const fn join(write: u32, read: u32) -> u64 {
    (write as u64) | ((read as u64) << 32)
}

/// Operation counters owned by a resource
#[derive(Default)]
pub struct SyncData {
    /// Write pending in the low half, read pending in the high half
    pending: AtomicU64,
    write_ops_complete: AtomicU32,
    read_ops_complete: AtomicU32,
}

impl SyncData {
    /// Create zeroed counters
    pub const fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            write_ops_complete: AtomicU32::new(0),
            read_ops_complete: AtomicU32::new(0),
        }
    }

    /// Create shared counters
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Admitted write operations
    #[inline]
    pub fn write_ops_pending(&self) -> u32 {
        split(self.pending.load(Ordering::Relaxed)).0
    }

    /// Finished write operations
    #[inline]
    pub fn write_ops_complete(&self) -> u32 {
        self.write_ops_complete.load(Ordering::Relaxed)
    }

    /// Admitted read operations
    #[inline]
    pub fn read_ops_pending(&self) -> u32 {
        split(self.pending.load(Ordering::Relaxed)).1
    }

    /// Finished read operations
    #[inline]
    pub fn read_ops_complete(&self) -> u32 {
        self.read_ops_complete.load(Ordering::Relaxed)
    }

    /// Account for one write operation, returning the pending value before it
    ///
    /// Producers call this for each destination after inserting the command
    /// that writes it. Writers of one resource must not interleave a capture
    /// with another writer's reservation.
    #[inline]
    pub fn reserve_write(&self) -> u32 {
        self.admit(true).0
    }

    /// Admit one read operation, returning the pending value before it
    #[inline]
    pub fn reserve_read(&self) -> u32 {
        self.admit(false).1
    }

    /// Both pending counters as of one instant
    #[inline]
    pub fn pending(&self) -> (u32, u32) {
        split(self.pending.load(Ordering::Acquire))
    }

    /// Bump one pending counter, returning both as they were before
    fn admit(&self, write: bool) -> (u32, u32) {
        let prev = self
            .pending
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pending| {
                let (w, r) = split(pending);
                Some(if write {
                    join(w.wrapping_add(1), r)
                } else {
                    join(w, r.wrapping_add(1))
                })
            });
        match prev {
            Ok(pending) | Err(pending) => split(pending),
        }
    }

    /// Record one finished write operation
    #[inline]
    pub fn complete_write(&self) {
        self.write_ops_complete.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one finished read operation
    #[inline]
    pub fn complete_read(&self) {
        self.read_ops_complete.fetch_add(1, Ordering::Relaxed);
    }

    /// All admitted writes have finished
    pub fn writes_done(&self) -> bool {
        self.write_ops_complete() == self.write_ops_pending()
    }

    /// All admitted reads have finished
    pub fn reads_done(&self) -> bool {
        self.read_ops_complete() == self.read_ops_pending()
    }

    /// No operation of either kind is outstanding
    pub fn is_idle(&self) -> bool {
        self.writes_done() && self.reads_done()
    }
}

impl fmt::Debug for SyncData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncData")
            .field("write_pending", &self.write_ops_pending())
            .field("write_complete", &self.write_ops_complete())
            .field("read_pending", &self.read_ops_pending())
            .field("read_complete", &self.read_ops_complete())
            .finish()
    }
}

// =============================================================================
// SYNC OBJECT
// =============================================================================

/// A command's capture of a resource's pending counters
#[derive(Debug, Clone)]
pub struct SyncObject {
    /// Shared counters
    pub data: Arc<SyncData>,
    /// Write target captured at admission
    pub write_ops_pending: u32,
    /// Read target captured at admission
    pub read_ops_pending: u32,
}

impl SyncObject {
    /// Capture as a destination: the command will write the resource
    ///
    /// Leaves the counters untouched; the write target was already
    /// accounted for by the producer.
    pub fn admit_write(data: &Arc<SyncData>) -> Self {
        let (write_ops_pending, read_ops_pending) = data.pending();
        Self {
            data: Arc::clone(data),
            write_ops_pending,
            read_ops_pending,
        }
    }

    /// Capture as a source: the command will read the resource
    ///
    /// Takes one read slot, so later readers and writers wait for this read.
    pub fn admit_read(data: &Arc<SyncData>) -> Self {
        let (write_ops_pending, read_ops_pending) = data.admit(false);
        Self {
            data: Arc::clone(data),
            write_ops_pending,
            read_ops_pending,
        }
    }

    /// Rebuild a capture from stored snapshots
    pub fn from_snapshot(data: Arc<SyncData>, write_ops_pending: u32, read_ops_pending: u32) -> Self {
        Self {
            data,
            write_ops_pending,
            read_ops_pending,
        }
    }

    /// Both complete counters have reached the captured epoch
    ///
    /// Each counter must match exactly; under `flush` a counter that has
    /// moved past its snapshot is tolerated, one still behind is not.
    pub fn is_ready(&self, flush: bool) -> bool {
        counter_ready(self.data.write_ops_complete(), self.write_ops_pending, flush)
            && counter_ready(self.data.read_ops_complete(), self.read_ops_pending, flush)
    }
}

/// Exact match, or under flush any value that has reached the snapshot
#[inline]
fn counter_ready(complete: u32, snapshot: u32, flush: bool) -> bool {
    complete == snapshot || (flush && ops_reached(complete, snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_captures_unchanged() {
        let data = SyncData::new_shared();
        data.reserve_write();
        data.reserve_write();

        let w = SyncObject::admit_write(&data);
        assert_eq!(w.write_ops_pending, 2);
        assert_eq!(w.read_ops_pending, 0);
        assert_eq!(data.write_ops_pending(), 2);
        assert_eq!(data.read_ops_pending(), 0);
    }

    #[test]
    fn test_source_bumps_read_pending() {
        let data = SyncData::new_shared();
        data.reserve_write();

        let r = SyncObject::admit_read(&data);
        assert_eq!(r.write_ops_pending, 1);
        assert_eq!(r.read_ops_pending, 0);
        assert_eq!(data.read_ops_pending(), 1);
        assert_eq!(data.write_ops_pending(), 1);
    }

    #[test]
    fn test_exact_match_gating() {
        let data = SyncData::new_shared();
        let obj = SyncObject::from_snapshot(Arc::clone(&data), 5, 0);

        for _ in 0..4 {
            data.complete_write();
        }
        assert!(!obj.is_ready(false));

        data.complete_write();
        assert!(obj.is_ready(false));

        // Overshooting is not the epoch this command waits for
        data.complete_write();
        assert!(!obj.is_ready(false));
    }

    #[test]
    fn test_flush_tolerates_ahead_only() {
        let data = SyncData::new_shared();
        let obj = SyncObject::from_snapshot(Arc::clone(&data), 5, 2);
        data.complete_read();
        data.complete_read();

        for _ in 0..3 {
            data.complete_write();
        }
        assert!(!obj.is_ready(true));

        for _ in 0..4 {
            data.complete_write();
        }
        assert_eq!(data.write_ops_complete(), 7);
        assert!(obj.is_ready(true));
        assert!(!obj.is_ready(false));

        // Each counter is judged on its own
        let behind_on_reads = SyncObject::from_snapshot(Arc::clone(&data), 5, 3);
        assert!(!behind_on_reads.is_ready(true));
    }

    #[test]
    fn test_reader_waits_for_earlier_reader() {
        let data = SyncData::new_shared();
        let first = SyncObject::admit_read(&data);
        let second = SyncObject::admit_read(&data);
        assert_eq!(second.read_ops_pending, 1);

        assert!(first.is_ready(false));
        assert!(!second.is_ready(false));

        data.complete_read();
        assert!(second.is_ready(false));
        assert!(!first.is_ready(false));
    }

    #[test]
    fn test_destination_waits_for_readers() {
        let data = SyncData::new_shared();
        let _reader = SyncObject::admit_read(&data);
        let writer = SyncObject::admit_write(&data);
        assert!(!writer.is_ready(false));

        data.complete_read();
        assert!(writer.is_ready(false));
    }

    #[test]
    fn test_reader_waits_for_reserved_writer() {
        let data = SyncData::new_shared();
        let writer = SyncObject::admit_write(&data);
        data.reserve_write();
        let reader = SyncObject::admit_read(&data);

        assert!(writer.is_ready(false));
        assert!(!reader.is_ready(false));

        data.complete_write();
        assert!(reader.is_ready(false));
    }

    #[test]
    fn test_ops_reached_wraps() {
        assert!(ops_reached(5, 5));
        assert!(ops_reached(7, 5));
        assert!(!ops_reached(3, 5));
        assert!(ops_reached(2, u32::MAX - 1));
        assert!(!ops_reached(u32::MAX - 1, 2));
    }

    #[test]
    fn test_pending_halves_wrap_independently() {
        let data = SyncData::new();
        data.pending.store(join(u32::MAX, 7), Ordering::Relaxed);
        assert_eq!(data.reserve_write(), u32::MAX);
        assert_eq!(data.write_ops_pending(), 0);
        assert_eq!(data.read_ops_pending(), 7);
    }

    #[test]
    fn test_idle_queries() {
        let data = SyncData::new();
        assert!(data.is_idle());
        data.reserve_write();
        assert!(!data.writes_done());
        assert!(data.reads_done());
        data.complete_write();
        assert!(data.is_idle());
    }
}
