//! # Command Queue
//!
//! Power-of-two circular byte arena holding variably sized command records
//! in strict FIFO order.
//!
//! ## Cursors
//!
//! ```text
//!   0                 read             write              capacity   +slack
//!   ├─────────────────┼────────────────┼──────────────────┼──────────┤
//!   │      free       │  queued cmds   │       free       │ overflow │
//!   └─────────────────┴────────────────┴──────────────────┴──────────┘
//! ```
//!
//! - `write_offset` only moves on submission, after the record is complete.
//! - `read_offset` only moves after the head record has been dispatched.
//! - One byte is always kept free so a full queue never looks empty.
//! - A record starting near the end runs on into the slack area, which is
//!   `max_command_size` bytes long; records are never split.
//!
//! Between reservation and submission a queue is *staged*: exactly one
//! producer owns the bytes at `write_offset`. Other producers wait for the
//! staging token inside the same bounded wait that waits for space.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use helix_cmdq_core::{
    wait_until, Clock, CommandType, DeviceIndex, Error, ProcessId, QueueConfig, QueueId, Result,
    SyncData, SyncObject,
};
use spin::{Mutex, MutexGuard};

use crate::layout::{
    align_up, decode_sync_entry, encode_sync_entry, CommandHeader, COMMAND_ALIGN, HEADER_SIZE,
};

// =============================================================================
// QUEUE STATE
// =============================================================================

bitflags! {
    /// Queue lifecycle flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueueState: u32 {
        /// A producer holds the bytes at the write cursor
        const STAGED = 1 << 0;
        /// Destruction is waiting for the queue to drain
        const DRAINING = 1 << 1;
        /// Storage has been released
        const DESTROYED = 1 << 2;
    }
}

// =============================================================================
// HANDLES
// =============================================================================

/// Everything needed to lay out one command
#[derive(Debug, Clone, Copy)]
pub struct CommandDesc<'a> {
    /// Target device
    pub device: DeviceIndex,
    /// Command type on that device
    pub command_type: CommandType,
    /// Resources the command writes
    pub dst_syncs: &'a [Arc<SyncData>],
    /// Resources the command reads
    pub src_syncs: &'a [Arc<SyncData>],
    /// Payload length in bytes
    pub data_size: u32,
    /// Submitting process
    pub submitter: ProcessId,
}

impl<'a> CommandDesc<'a> {
    /// A command without sync dependencies or payload
    pub const fn new(device: DeviceIndex, command_type: CommandType) -> Self {
        Self {
            device,
            command_type,
            dst_syncs: &[],
            src_syncs: &[],
            data_size: 0,
            submitter: ProcessId(0),
        }
    }

    /// Set the destination (written) resources
    pub fn writes(mut self, syncs: &'a [Arc<SyncData>]) -> Self {
        self.dst_syncs = syncs;
        self
    }

    /// Set the source (read) resources
    pub fn reads(mut self, syncs: &'a [Arc<SyncData>]) -> Self {
        self.src_syncs = syncs;
        self
    }

    /// Set the payload length
    pub fn data_size(mut self, bytes: u32) -> Self {
        self.data_size = bytes;
        self
    }

    /// Set the submitting process
    pub fn submitter(mut self, pid: ProcessId) -> Self {
        self.submitter = pid;
        self
    }

    /// Size of the record this command needs
    pub fn record_size(&self) -> Result<u32> {
        CommandHeader::record_size(
            self.dst_syncs.len() as u32,
            self.src_syncs.len() as u32,
            self.data_size,
        )
    }
}

/// Bytes claimed at the write cursor, not yet holding a command
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation keeps the queue staged until used or released"]
pub struct Reservation {
    queue: QueueId,
    offset: u32,
    size: u32,
}

impl Reservation {
    /// Owning queue
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Arena offset of the reserved bytes
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Reserved length, aligned
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// A command record laid out in a queue's arena
///
/// The handle is an index, not a pointer: `(queue, offset, size)`.
///
/// A command that reads resources must be submitted: its sources took read
/// slots that later commands wait on. A command without sources can also be
/// given back unpublished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "an inserted command keeps the queue staged until submitted or released"]
pub struct Command {
    queue: QueueId,
    offset: u32,
    size: u32,
}

impl Command {
    /// Owning queue
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Arena offset of the record
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Record size in bytes
    pub fn size(&self) -> u32 {
        self.size
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Per-queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Commands published by submission
    pub submitted: u64,
    /// Commands handed to a processor and dequeued
    pub dispatched: u64,
    /// Passes where the head command's fences or slot were not ready
    pub dependency_stalls: u64,
    /// Passes where the processor declined the head command
    pub rejections: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    dependency_stalls: AtomicU64,
    rejections: AtomicU64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dependency_stalls: self.dependency_stalls.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// DEBUG INFO
// =============================================================================

/// Captured and current counters of one sync entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSnapshot {
    /// Write target captured at admission
    pub write_ops_pending: u32,
    /// Read target captured at admission
    pub read_ops_pending: u32,
    /// Current finished writes
    pub write_ops_complete: u32,
    /// Current finished reads
    pub read_ops_complete: u32,
}

/// One queued command
#[derive(Debug, Clone)]
pub struct CommandInfo {
    /// Arena offset
    pub offset: u32,
    /// Decoded header
    pub header: CommandHeader,
    /// Destination entries
    pub dst: Vec<SyncSnapshot>,
    /// Source entries
    pub src: Vec<SyncSnapshot>,
}

/// Point-in-time view of a queue
#[derive(Debug, Clone)]
pub struct QueueInfo {
    /// Queue identifier
    pub id: QueueId,
    /// Owning process
    pub owner: ProcessId,
    /// Arena capacity
    pub capacity: u32,
    /// Read cursor
    pub read_offset: u32,
    /// Write cursor
    pub write_offset: u32,
    /// Bytes available for new commands
    pub free_space: u32,
    /// Lifecycle flags
    pub state: QueueState,
    /// Counters
    pub stats: QueueStats,
    /// Published, not yet dispatched commands in FIFO order
    pub commands: Vec<CommandInfo>,
}

// =============================================================================
// STORAGE
// =============================================================================

/// Byte arena plus the shared counters referenced by its sync entries
///
/// `syncs[i]` belongs to the sync entry starting at byte `i * 4`.
struct QueueStorage {
    bytes: Box<[u8]>,
    syncs: Box<[Option<Arc<SyncData>>]>,
}

impl QueueStorage {
    fn allocate(len: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory)?;
        bytes.resize(len, 0u8);

        let words = len / COMMAND_ALIGN as usize;
        let mut syncs = Vec::new();
        syncs
            .try_reserve_exact(words)
            .map_err(|_| Error::OutOfMemory)?;
        syncs.resize_with(words, || None);

        Ok(Self {
            bytes: bytes.into_boxed_slice(),
            syncs: syncs.into_boxed_slice(),
        })
    }

    fn empty() -> Self {
        Self {
            bytes: Box::new([]),
            syncs: Box::new([]),
        }
    }

    fn is_released(&self) -> bool {
        self.bytes.is_empty()
    }

    fn sync_object(&self, at: usize) -> Option<SyncObject> {
        let (write, read) = decode_sync_entry(&self.bytes, at);
        let data = self.syncs.get(at / COMMAND_ALIGN as usize)?.as_ref()?;
        Some(SyncObject::from_snapshot(Arc::clone(data), write, read))
    }

    fn snapshot(&self, at: usize) -> Option<SyncSnapshot> {
        self.sync_object(at).map(|obj| SyncSnapshot {
            write_ops_pending: obj.write_ops_pending,
            read_ops_pending: obj.read_ops_pending,
            write_ops_complete: obj.data.write_ops_complete(),
            read_ops_complete: obj.data.read_ops_complete(),
        })
    }
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// A fixed-capacity FIFO of command records
pub struct CommandQueue {
    id: QueueId,
    owner: ProcessId,
    capacity: u32,
    config: QueueConfig,
    read_offset: AtomicU32,
    write_offset: AtomicU32,
    state: AtomicU32,
    storage: Mutex<QueueStorage>,
    counters: QueueCounters,
}

impl CommandQueue {
    /// Create a queue of `requested_size` bytes rounded up to a power of two
    pub(crate) fn new(
        id: QueueId,
        owner: ProcessId,
        requested_size: u32,
        config: &QueueConfig,
    ) -> Result<Self> {
        if requested_size == 0 {
            return Err(Error::InvalidParams);
        }
        let capacity = requested_size
            .checked_next_power_of_two()
            .ok_or(Error::OutOfMemory)?;

        let len = capacity as usize + config.max_command_size as usize;
        let storage = QueueStorage::allocate(len)?;

        Ok(Self {
            id,
            owner,
            capacity,
            config: *config,
            read_offset: AtomicU32::new(0),
            write_offset: AtomicU32::new(0),
            state: AtomicU32::new(0),
            storage: Mutex::new(storage),
            counters: QueueCounters::default(),
        })
    }

    /// Queue identifier
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Owning process
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// Arena capacity in bytes, always a power of two
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Read cursor
    pub fn read_offset(&self) -> u32 {
        self.read_offset.load(Ordering::Acquire)
    }

    /// Write cursor
    pub fn write_offset(&self) -> u32 {
        self.write_offset.load(Ordering::Acquire)
    }

    /// Lifecycle flags
    pub fn state(&self) -> QueueState {
        QueueState::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    /// Storage has been released
    pub fn is_destroyed(&self) -> bool {
        self.state().contains(QueueState::DESTROYED)
    }

    /// No published command is waiting
    pub fn is_empty(&self) -> bool {
        self.read_offset() == self.write_offset()
    }

    /// Bytes available, keeping one byte back so full never equals empty
    pub fn free_space(&self) -> u32 {
        let mask = self.capacity - 1;
        self.read_offset()
            .wrapping_sub(self.write_offset())
            .wrapping_add(mask)
            & mask
    }

    /// Bytes held by published commands
    pub fn used_space(&self) -> u32 {
        self.write_offset().wrapping_sub(self.read_offset()) & (self.capacity - 1)
    }

    /// Counters
    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Wait for `size` bytes at the write cursor and stage the queue
    pub(crate) fn get_space(&self, clock: &dyn Clock, size: u32) -> Result<Reservation> {
        if size > self.config.max_command_size {
            log::debug!(
                "CmdQueue: {:?} command of {} bytes exceeds {}",
                self.id,
                size,
                self.config.max_command_size
            );
            return Err(Error::CmdTooBig);
        }
        let size = align_up(size);

        if self.is_destroyed() {
            return Err(Error::InvalidParams);
        }

        let staged = wait_until(
            clock,
            self.config.space_timeout_us,
            self.config.poll_interval_us,
            || self.is_destroyed() || self.try_stage(size),
        );

        if self.is_destroyed() {
            return Err(Error::InvalidParams);
        }
        if !staged {
            log::warn!(
                "CmdQueue: {:?} no space for {} bytes (free {})",
                self.id,
                size,
                self.free_space()
            );
            return Err(Error::CannotGetQueueSpace);
        }

        Ok(Reservation {
            queue: self.id,
            offset: self.write_offset(),
            size,
        })
    }

    fn try_stage(&self, size: u32) -> bool {
        let prev = self
            .state
            .fetch_or(QueueState::STAGED.bits(), Ordering::AcqRel);
        if QueueState::from_bits_retain(prev).contains(QueueState::STAGED) {
            return false;
        }

        // Only the staging holder moves the write cursor, so space can only grow now
        if self.free_space() > size {
            true
        } else {
            self.unstage();
            false
        }
    }

    fn unstage(&self) {
        self.state
            .fetch_and(!QueueState::STAGED.bits(), Ordering::Release);
    }

    fn check_staged(&self, queue: QueueId, offset: u32) -> Result<()> {
        if queue != self.id
            || !self.state().contains(QueueState::STAGED)
            || offset != self.write_offset()
        {
            return Err(Error::InvalidParams);
        }
        Ok(())
    }

    /// Give back a reservation without inserting a command
    pub(crate) fn release(&self, reservation: Reservation) -> Result<()> {
        self.check_staged(reservation.queue, reservation.offset)?;
        self.unstage();
        Ok(())
    }

    /// Lay out a command in reserved bytes and admit its sync objects
    pub(crate) fn insert_reserved(
        &self,
        reservation: Reservation,
        desc: &CommandDesc<'_>,
    ) -> Result<Command> {
        self.check_staged(reservation.queue, reservation.offset)?;

        let header = match CommandHeader::new(
            desc.device,
            desc.command_type,
            desc.dst_syncs.len() as u32,
            desc.src_syncs.len() as u32,
            desc.data_size,
            desc.submitter,
        ) {
            Ok(header) if header.size <= reservation.size => header,
            Ok(_) => {
                self.unstage();
                return Err(Error::InvalidParams);
            },
            Err(e) => {
                self.unstage();
                return Err(e);
            },
        };

        let mut storage = self.storage.lock();
        if storage.is_released() {
            return Err(Error::InvalidParams);
        }

        let base = reservation.offset as usize;
        let QueueStorage { bytes, syncs } = &mut *storage;
        let record = &mut bytes[base..base + header.size as usize];
        header.encode(record);

        for (i, data) in desc.dst_syncs.iter().enumerate() {
            let at = header.dst_entry(i as u32);
            let obj = SyncObject::admit_write(data);
            encode_sync_entry(record, at, obj.write_ops_pending, obj.read_ops_pending);
            syncs[(base + at) / COMMAND_ALIGN as usize] = Some(obj.data);
        }
        for (i, data) in desc.src_syncs.iter().enumerate() {
            let at = header.src_entry(i as u32);
            let obj = SyncObject::admit_read(data);
            encode_sync_entry(record, at, obj.write_ops_pending, obj.read_ops_pending);
            syncs[(base + at) / COMMAND_ALIGN as usize] = Some(obj.data);
        }
        record[header.data_offset as usize..].fill(0);

        log::trace!(
            "CmdQueue: {:?} staged {:?}/{:?} at {} ({} bytes)",
            self.id,
            desc.device,
            desc.command_type,
            base,
            header.size
        );

        Ok(Command {
            queue: self.id,
            offset: reservation.offset,
            size: header.size,
        })
    }

    /// Give the producer the staged command's payload
    pub(crate) fn with_command_data<R>(
        &self,
        command: &Command,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        self.check_staged(command.queue, command.offset)?;

        let mut storage = self.storage.lock();
        if storage.is_released() {
            return Err(Error::InvalidParams);
        }
        let base = command.offset as usize;
        let header = CommandHeader::decode(&storage.bytes[base..]);
        let start = base + header.data_offset as usize;
        let end = start + header.data_size as usize;
        Ok(f(&mut storage.bytes[start..end]))
    }

    /// Give back a staged command without publishing it
    ///
    /// Destinations leave the shared counters untouched at insertion, so the
    /// record can simply be dropped. Sources cannot: `InvalidParams`, and the
    /// command stays staged.
    pub(crate) fn release_command(&self, command: Command) -> Result<()> {
        self.check_staged(command.queue, command.offset)?;

        let mut storage = self.storage.lock();
        if storage.is_released() {
            return Err(Error::InvalidParams);
        }
        let base = command.offset as usize;
        let header = CommandHeader::decode(&storage.bytes[base..]);
        if header.src_count != 0 {
            log::warn!(
                "CmdQueue: {:?} cannot release command at {} holding {} read slots",
                self.id,
                base,
                header.src_count
            );
            return Err(Error::InvalidParams);
        }
        for i in 0..header.dst_count {
            storage.syncs[(base + header.dst_entry(i)) / COMMAND_ALIGN as usize] = None;
        }
        drop(storage);

        self.unstage();
        log::trace!("CmdQueue: {:?} released staged command at {}", self.id, base);
        Ok(())
    }

    /// Publish the staged command to the dispatcher
    pub(crate) fn submit_command(&self, command: Command) -> Result<()> {
        self.check_staged(command.queue, command.offset)?;

        {
            let mut storage = self.storage.lock();
            if storage.is_released() {
                return Err(Error::InvalidParams);
            }
            let base = command.offset as usize;
            let mut header = CommandHeader::decode(&storage.bytes[base..]);

            #[cfg(feature = "validation")]
            if !header.is_consistent() || header.size != command.size {
                log::error!(
                    "CmdQueue: {:?} corrupt command header at {}: {:?}",
                    self.id,
                    base,
                    header
                );
                return Err(Error::InvalidParams);
            }

            header.fix_up();
            header.encode(&mut storage.bytes[base..]);
        }

        let next = command.offset.wrapping_add(command.size) & (self.capacity - 1);
        self.write_offset.store(next, Ordering::Release);
        self.unstage();
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // Dispatcher side
    // =========================================================================

    /// Lock the storage and decode the head command, if any
    pub(crate) fn head(&self) -> Option<Head<'_>> {
        let read = self.read_offset();
        if read == self.write_offset() {
            return None;
        }

        let storage = self.storage.lock();
        if storage.is_released() {
            return None;
        }
        let header = CommandHeader::decode(&storage.bytes[read as usize..]);
        Some(Head {
            queue: self,
            storage,
            offset: read,
            header,
        })
    }

    pub(crate) fn note_stall(&self) {
        self.counters
            .dependency_stalls
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_rejection(&self) {
        self.counters.rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop the arena and every sync reference it holds
    pub(crate) fn release_storage(&self) {
        self.state.fetch_or(
            QueueState::DESTROYED.bits(),
            Ordering::AcqRel,
        );
        self.state.fetch_and(
            !(QueueState::STAGED | QueueState::DRAINING).bits(),
            Ordering::AcqRel,
        );

        *self.storage.lock() = QueueStorage::empty();
        self.read_offset
            .store(self.write_offset(), Ordering::Release);
    }

    pub(crate) fn mark_draining(&self) {
        self.state
            .fetch_or(QueueState::DRAINING.bits(), Ordering::AcqRel);
    }

    /// Snapshot cursors and queued commands
    pub fn info(&self) -> QueueInfo {
        let storage = self.storage.lock();
        let read = self.read_offset();
        let write = self.write_offset();

        let mut commands = Vec::new();
        if !storage.is_released() {
            let mask = self.capacity - 1;
            let mut cursor = read;
            // A record is at least a header long; bounds the walk on corruption
            let max_records = self.capacity as usize / HEADER_SIZE + 1;
            while cursor != write && commands.len() < max_records {
                let base = cursor as usize;
                let header = CommandHeader::decode(&storage.bytes[base..]);
                if header.size == 0 {
                    break;
                }
                let dst = (0..header.dst_count)
                    .filter_map(|i| storage.snapshot(base + header.dst_entry(i)))
                    .collect();
                let src = (0..header.src_count)
                    .filter_map(|i| storage.snapshot(base + header.src_entry(i)))
                    .collect();
                commands.push(CommandInfo {
                    offset: cursor,
                    header,
                    dst,
                    src,
                });
                cursor = cursor.wrapping_add(header.size) & mask;
            }
        }

        QueueInfo {
            id: self.id,
            owner: self.owner,
            capacity: self.capacity,
            read_offset: read,
            write_offset: write,
            free_space: self.free_space(),
            state: self.state(),
            stats: self.stats(),
            commands,
        }
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("capacity", &self.capacity)
            .field("read_offset", &self.read_offset())
            .field("write_offset", &self.write_offset())
            .field("state", &self.state())
            .finish()
    }
}

// =============================================================================
// HEAD COMMAND
// =============================================================================

/// The head command of a queue, with its storage locked
pub(crate) struct Head<'q> {
    queue: &'q CommandQueue,
    storage: MutexGuard<'q, QueueStorage>,
    offset: u32,
    header: CommandHeader,
}

impl<'q> Head<'q> {
    pub(crate) fn header(&self) -> &CommandHeader {
        &self.header
    }

    fn base(&self) -> usize {
        self.offset as usize
    }

    pub(crate) fn dst_syncs(&self) -> impl Iterator<Item = SyncObject> + '_ {
        let base = self.base();
        (0..self.header.dst_count)
            .filter_map(move |i| self.storage.sync_object(base + self.header.dst_entry(i)))
    }

    pub(crate) fn src_syncs(&self) -> impl Iterator<Item = SyncObject> + '_ {
        let base = self.base();
        (0..self.header.src_count)
            .filter_map(move |i| self.storage.sync_object(base + self.header.src_entry(i)))
    }

    /// Every sync entry resolves to shared counters
    pub(crate) fn is_intact(&self) -> bool {
        self.dst_syncs().count() == self.header.dst_count as usize
            && self.src_syncs().count() == self.header.src_count as usize
    }

    /// Destination and source fences all satisfied
    pub(crate) fn fences_ready(&self, flush: bool) -> bool {
        self.is_intact()
            && self.dst_syncs().all(|obj| obj.is_ready(flush))
            && self.src_syncs().all(|obj| obj.is_ready(flush))
    }

    pub(crate) fn payload(&self) -> &[u8] {
        let start = self.base() + self.header.data_offset as usize;
        &self.storage.bytes[start..start + self.header.data_size as usize]
    }

    /// Dequeue: drop the record's sync references and advance the read cursor
    pub(crate) fn retire(self) {
        let Head {
            queue,
            mut storage,
            offset,
            header,
        } = self;

        let base = offset as usize;
        let word = COMMAND_ALIGN as usize;
        for i in 0..header.dst_count {
            storage.syncs[(base + header.dst_entry(i)) / word] = None;
        }
        for i in 0..header.src_count {
            storage.syncs[(base + header.src_entry(i)) / word] = None;
        }
        drop(storage);

        let next = offset.wrapping_add(header.size) & (queue.capacity - 1);
        queue.read_offset.store(next, Ordering::Release);
        queue.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_cmdq_core::StepClock;

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_max_command_size(256)
            .with_space_timeout_us(1_000)
            .with_poll_interval_us(10)
    }

    fn queue(size: u32) -> CommandQueue {
        CommandQueue::new(QueueId::new(1), ProcessId(7), size, &config()).unwrap()
    }

    fn desc() -> CommandDesc<'static> {
        CommandDesc::new(DeviceIndex::new(0), CommandType::new(0))
    }

    fn push(queue: &CommandQueue, clock: &StepClock, desc: &CommandDesc<'_>) -> Command {
        let size = desc.record_size().unwrap();
        let reservation = queue.get_space(clock, size).unwrap();
        let command = queue.insert_reserved(reservation, desc).unwrap();
        queue.submit_command(command).unwrap();
        command
    }

    #[test]
    fn test_capacity_rounding() {
        for n in 1..=4096u32 {
            let q = queue(n);
            assert_eq!(q.capacity(), n.next_power_of_two());
            assert!(q.capacity().is_power_of_two());
            assert!(q.capacity() >= n);
        }
        assert_eq!(queue(300).capacity(), 512);
    }

    #[test]
    fn test_create_rejects_bad_sizes() {
        let cfg = config();
        assert_eq!(
            CommandQueue::new(QueueId::new(1), ProcessId(0), 0, &cfg).unwrap_err(),
            Error::InvalidParams
        );
        assert_eq!(
            CommandQueue::new(QueueId::new(1), ProcessId(0), u32::MAX, &cfg).unwrap_err(),
            Error::OutOfMemory
        );
    }

    #[test]
    fn test_free_space_keeps_one_byte() {
        let q = queue(128);
        assert_eq!(q.free_space(), 127);
        assert!(q.is_empty());
    }

    #[test]
    fn test_get_space_rounds_and_rejects() {
        let clock = StepClock::new();
        let q = queue(128);

        assert_eq!(q.get_space(&clock, 257).unwrap_err(), Error::CmdTooBig);
        // Rejection mutates nothing
        assert!(!q.state().contains(QueueState::STAGED));

        let r = q.get_space(&clock, 13).unwrap();
        assert_eq!(r.size(), 16);
        assert_eq!(r.offset(), 0);
        q.release(r).unwrap();
    }

    #[test]
    fn test_get_space_times_out_when_full() {
        let clock = StepClock::new();
        let q = queue(128);

        push(&q, &clock, &desc().data_size(80));
        assert_eq!(q.used_space(), 120);

        let before = clock.now_us();
        assert_eq!(
            q.get_space(&clock, HEADER_SIZE as u32).unwrap_err(),
            Error::CannotGetQueueSpace
        );
        assert_eq!(clock.now_us() - before, 1_000);
        assert!(!q.state().contains(QueueState::STAGED));
    }

    #[test]
    fn test_single_staged_producer() {
        let clock = StepClock::new();
        let q = queue(128);

        let first = q.get_space(&clock, 40).unwrap();
        assert!(q.state().contains(QueueState::STAGED));
        assert_eq!(
            q.get_space(&clock, 40).unwrap_err(),
            Error::CannotGetQueueSpace
        );

        q.release(first).unwrap();
        let second = q.get_space(&clock, 40).unwrap();
        q.release(second).unwrap();
    }

    #[test]
    fn test_insert_admits_syncs() {
        let clock = StepClock::new();
        let q = queue(256);
        let target = SyncData::new_shared();
        let source = SyncData::new_shared();
        target.reserve_write();
        target.reserve_write();

        let dst = [Arc::clone(&target)];
        let src = [Arc::clone(&source)];
        let d = desc().writes(&dst).reads(&src).data_size(4);
        push(&q, &clock, &d);

        // Destinations are captured as the producer left them
        assert_eq!(target.write_ops_pending(), 2);
        assert_eq!(source.read_ops_pending(), 1);
        assert_eq!(source.write_ops_pending(), 0);

        let info = q.info();
        assert_eq!(info.commands.len(), 1);
        let cmd = &info.commands[0];
        assert_eq!(cmd.dst[0].write_ops_pending, 2);
        assert_eq!(cmd.src[0].read_ops_pending, 0);
        assert_eq!(cmd.header.size, 40 + 16 + 4);
    }

    #[test]
    fn test_submit_publishes_write_cursor() {
        let clock = StepClock::new();
        let q = queue(256);

        let size = desc().data_size(8).record_size().unwrap();
        let r = q.get_space(&clock, size).unwrap();
        let cmd = q.insert_reserved(r, &desc().data_size(8)).unwrap();

        // Inserted but not yet visible
        assert!(q.is_empty());
        assert!(q.head().is_none());

        q.with_command_data(&cmd, |data| data.copy_from_slice(b"payload!"))
            .unwrap();
        q.submit_command(cmd).unwrap();

        assert_eq!(q.write_offset(), 48);
        let head = q.head().unwrap();
        assert_eq!(head.payload(), b"payload!");
        assert_eq!(q.stats().submitted, 1);
    }

    #[test]
    fn test_submit_requires_staged_command() {
        let clock = StepClock::new();
        let q = queue(256);
        let cmd = push(&q, &clock, &desc());
        assert_eq!(q.submit_command(cmd).unwrap_err(), Error::InvalidParams);
        assert_eq!(
            q.with_command_data(&cmd, |_| ()).unwrap_err(),
            Error::InvalidParams
        );
    }

    #[test]
    fn test_retire_releases_sync_references() {
        let clock = StepClock::new();
        let q = queue(256);
        let target = SyncData::new_shared();
        let dst = [Arc::clone(&target)];
        push(&q, &clock, &desc().writes(&dst));
        drop(dst);
        assert_eq!(Arc::strong_count(&target), 2);

        let head = q.head().unwrap();
        assert!(head.fences_ready(false));
        head.retire();

        assert!(q.is_empty());
        assert_eq!(Arc::strong_count(&target), 1);
        assert_eq!(q.stats().dispatched, 1);
    }

    #[test]
    fn test_release_command_unstages() {
        let clock = StepClock::new();
        let q = queue(256);
        let target = SyncData::new_shared();
        let dst = [Arc::clone(&target)];

        let d = desc().writes(&dst).data_size(8);
        let r = q.get_space(&clock, d.record_size().unwrap()).unwrap();
        let cmd = q.insert_reserved(r, &d).unwrap();
        assert_eq!(Arc::strong_count(&target), 3);

        q.release_command(cmd).unwrap();
        assert!(!q.state().contains(QueueState::STAGED));
        assert!(q.is_empty());
        assert_eq!(Arc::strong_count(&target), 2);
        assert_eq!(target.write_ops_pending(), 0);
        assert_eq!(q.submit_command(cmd).unwrap_err(), Error::InvalidParams);

        // The space is free for the next producer
        let next = push(&q, &clock, &desc());
        assert_eq!(next.offset(), 0);
    }

    #[test]
    fn test_release_command_keeps_sources_staged() {
        let clock = StepClock::new();
        let q = queue(256);
        let source = SyncData::new_shared();
        let src = [Arc::clone(&source)];

        let d = desc().reads(&src);
        let r = q.get_space(&clock, d.record_size().unwrap()).unwrap();
        let cmd = q.insert_reserved(r, &d).unwrap();

        assert_eq!(q.release_command(cmd).unwrap_err(), Error::InvalidParams);
        assert!(q.state().contains(QueueState::STAGED));
        q.submit_command(cmd).unwrap();
        assert_eq!(source.read_ops_pending(), 1);
    }

    #[test]
    fn test_record_straddles_capacity() {
        let clock = StepClock::new();
        let q = queue(128);

        // Move both cursors to 96
        for _ in 0..2 {
            push(&q, &clock, &desc().data_size(8));
            q.head().unwrap().retire();
        }
        assert_eq!(q.read_offset(), 96);

        // 40 + 24 = 64 bytes runs from 96 into the slack
        let cmd = push(&q, &clock, &desc().data_size(24));
        assert_eq!(cmd.offset(), 96);
        assert_eq!(q.write_offset(), 32);
        assert_eq!(q.used_space(), 64);

        let head = q.head().unwrap();
        assert_eq!(head.header().size, 64);
        assert_eq!(head.payload().len(), 24);
        head.retire();
        assert!(q.is_empty());
        assert_eq!(q.read_offset(), 32);
    }

    #[test]
    fn test_release_storage() {
        let clock = StepClock::new();
        let q = queue(128);
        let target = SyncData::new_shared();
        let dst = [Arc::clone(&target)];
        push(&q, &clock, &desc().writes(&dst));
        drop(dst);

        q.release_storage();
        assert!(q.is_destroyed());
        assert!(q.is_empty());
        assert!(q.head().is_none());
        assert_eq!(Arc::strong_count(&target), 1);
        assert_eq!(q.get_space(&clock, 40).unwrap_err(), Error::InvalidParams);
    }
}
