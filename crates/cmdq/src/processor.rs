//! # Command Processors
//!
//! Per-device, per-command-type handlers and their completion slots.
//!
//! Each `(DeviceIndex, CommandType)` pair has one [`ProcessorEntry`]: the
//! handler that forwards a command's payload to the hardware, and a
//! [`CompletionSlot`] that holds the command's sync objects until the
//! hardware reports completion. A slot is single-occupancy, so at most one
//! command per pair is in flight.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use helix_cmdq_core::{CommandType, DeviceIndex, Error, Result, SyncObject};
use spin::{Mutex, RwLock};

// =============================================================================
// TRAITS
// =============================================================================

/// Forwards a dispatched command to the hardware
///
/// Returns `true` if the command was accepted; the hardware (or whoever
/// stands in for it) must later call `command_complete` with `cookie`.
/// Returning `false` leaves the command at the head of its queue.
///
/// Called with the dispatcher lock and the queue's storage held: the
/// processor may complete `cookie` inline, but must not insert commands.
pub trait CommandProcessor: Send + Sync {
    /// Handle one command
    fn process(&self, cookie: SlotCookie, data: &[u8]) -> bool;
}

impl<F> CommandProcessor for F
where
    F: Fn(SlotCookie, &[u8]) -> bool + Send + Sync,
{
    fn process(&self, cookie: SlotCookie, data: &[u8]) -> bool {
        self(cookie, data)
    }
}

/// Device notification run after dispatcher passes and completions
pub trait CommandCompleteHook: Send + Sync {
    /// Called once per pass and once per completion
    fn command_complete(&self, device: DeviceIndex);
}

impl<F> CommandCompleteHook for F
where
    F: Fn(DeviceIndex) + Send + Sync,
{
    fn command_complete(&self, device: DeviceIndex) {
        self(device)
    }
}

// =============================================================================
// SLOT COOKIE
// =============================================================================

/// Identifies one occupancy of a completion slot
///
/// The sequence number changes every time the slot is taken, so a cookie
/// from an earlier occupancy cannot complete a later command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotCookie {
    /// Device of the processor
    pub device: DeviceIndex,
    /// Command type of the processor
    pub command_type: CommandType,
    /// Occupancy number
    pub sequence: u32,
}

// =============================================================================
// COMPLETION SLOT
// =============================================================================

#[derive(Debug)]
struct SlotState {
    in_use: bool,
    sequence: u32,
    dst: Vec<SyncObject>,
    src: Vec<SyncObject>,
}

/// Single-occupancy holder of an in-flight command's sync objects
#[derive(Debug)]
pub struct CompletionSlot {
    max_dst: u32,
    max_src: u32,
    state: Mutex<SlotState>,
}

impl CompletionSlot {
    /// Allocate a slot able to hold the given sync counts
    pub fn new(max_dst: u32, max_src: u32) -> Result<Self> {
        let mut dst = Vec::new();
        dst.try_reserve_exact(max_dst as usize)
            .map_err(|_| Error::OutOfMemory)?;
        let mut src = Vec::new();
        src.try_reserve_exact(max_src as usize)
            .map_err(|_| Error::OutOfMemory)?;

        Ok(Self {
            max_dst,
            max_src,
            state: Mutex::new(SlotState {
                in_use: false,
                sequence: 0,
                dst,
                src,
            }),
        })
    }

    /// Largest destination count
    pub fn max_dst(&self) -> u32 {
        self.max_dst
    }

    /// Largest source count
    pub fn max_src(&self) -> u32 {
        self.max_src
    }

    /// Counts fit this slot
    pub fn accepts(&self, dst_count: u32, src_count: u32) -> bool {
        dst_count <= self.max_dst && src_count <= self.max_src
    }

    /// A command holds the slot
    pub fn is_in_use(&self) -> bool {
        self.state.lock().in_use
    }

    /// Take the slot and copy in the command's sync objects
    pub(crate) fn acquire(
        &self,
        device: DeviceIndex,
        command_type: CommandType,
        dst: impl Iterator<Item = SyncObject>,
        src: impl Iterator<Item = SyncObject>,
    ) -> Result<SlotCookie> {
        let mut state = self.state.lock();
        if state.in_use {
            return Err(Error::FailedDependencies);
        }

        state.dst.clear();
        state.src.clear();
        state.dst.extend(dst.take(self.max_dst as usize));
        state.src.extend(src.take(self.max_src as usize));
        state.in_use = true;
        state.sequence = state.sequence.wrapping_add(1);

        Ok(SlotCookie {
            device,
            command_type,
            sequence: state.sequence,
        })
    }

    /// Give the slot back without touching any counter
    pub(crate) fn abandon(&self, cookie: SlotCookie) {
        let mut state = self.state.lock();
        if state.in_use && state.sequence == cookie.sequence {
            state.dst.clear();
            state.src.clear();
            state.in_use = false;
        }
    }

    /// Bump the completion counters and free the slot
    ///
    /// Returns the number of `(dst, src)` objects signalled.
    pub(crate) fn complete(&self, cookie: SlotCookie) -> Result<(usize, usize)> {
        let mut state = self.state.lock();
        if !state.in_use || state.sequence != cookie.sequence {
            return Err(Error::InvalidParams);
        }

        for obj in &state.dst {
            obj.data.complete_write();
        }
        for obj in &state.src {
            obj.data.complete_read();
        }
        let signalled = (state.dst.len(), state.src.len());

        // Keeps capacity for the next occupancy
        state.dst.clear();
        state.src.clear();
        state.in_use = false;
        Ok(signalled)
    }
}

// =============================================================================
// PROCESSOR ENTRY
// =============================================================================

/// A registered processor and its slot
pub struct ProcessorEntry {
    processor: Box<dyn CommandProcessor>,
    slot: CompletionSlot,
}

impl ProcessorEntry {
    /// The handler
    pub fn processor(&self) -> &dyn CommandProcessor {
        self.processor.as_ref()
    }

    /// The completion slot
    pub fn slot(&self) -> &CompletionSlot {
        &self.slot
    }
}

impl fmt::Debug for ProcessorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorEntry")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// PROCESSOR TABLE
// =============================================================================

/// Typed map of registered processors plus device hooks
pub struct ProcessorTable {
    max_devices: u32,
    entries: RwLock<HashMap<(DeviceIndex, CommandType), Arc<ProcessorEntry>>>,
    hooks: RwLock<BTreeMap<DeviceIndex, Arc<dyn CommandCompleteHook>>>,
}

impl ProcessorTable {
    /// Create an empty table accepting devices below `max_devices`
    pub fn new(max_devices: u32) -> Self {
        Self {
            max_devices,
            entries: RwLock::new(HashMap::new()),
            hooks: RwLock::new(BTreeMap::new()),
        }
    }

    fn check_device(&self, device: DeviceIndex) -> Result<()> {
        if device.raw() >= self.max_devices {
            log::error!("Processors: {:?} out of range", device);
            return Err(Error::InvalidParams);
        }
        Ok(())
    }

    /// Register one processor per command type `0..processors.len()`
    ///
    /// `max_syncs[i]` is `[max_dst, max_src]` for command type `i`.
    pub fn register(
        &self,
        device: DeviceIndex,
        processors: Vec<Box<dyn CommandProcessor>>,
        max_syncs: &[[u32; 2]],
    ) -> Result<()> {
        self.check_device(device)?;
        if processors.is_empty() || processors.len() != max_syncs.len() {
            return Err(Error::InvalidParams);
        }

        let mut built = Vec::new();
        built
            .try_reserve_exact(processors.len())
            .map_err(|_| Error::OutOfMemory)?;
        for (index, (processor, [max_dst, max_src])) in
            processors.into_iter().zip(max_syncs.iter().copied()).enumerate()
        {
            let entry = ProcessorEntry {
                processor,
                slot: CompletionSlot::new(max_dst, max_src)?,
            };
            built.push(((device, CommandType::new(index as u32)), Arc::new(entry)));
        }

        let mut entries = self.entries.write();
        if entries.keys().any(|(dev, _)| *dev == device) {
            log::warn!("Processors: {:?} already registered", device);
            return Err(Error::InvalidParams);
        }
        let count = built.len();
        entries.extend(built);
        drop(entries);

        log::info!("Processors: registered {} types on {:?}", count, device);
        Ok(())
    }

    /// Remove command types `0..count` of `device`
    pub fn remove(&self, device: DeviceIndex, count: u32) -> Result<()> {
        self.check_device(device)?;

        let mut entries = self.entries.write();
        let mut removed = 0;
        for index in 0..count {
            let key = (device, CommandType::new(index));
            if let Some(entry) = entries.remove(&key) {
                if entry.slot.is_in_use() {
                    log::warn!(
                        "Processors: removing {:?}/{:?} with a command in flight",
                        device,
                        key.1
                    );
                }
                removed += 1;
            }
        }
        drop(entries);

        if removed == 0 {
            return Err(Error::InvalidParams);
        }
        log::info!("Processors: removed {} types from {:?}", removed, device);
        Ok(())
    }

    /// Entry for a `(device, type)` pair
    pub fn lookup(&self, device: DeviceIndex, command_type: CommandType) -> Option<Arc<ProcessorEntry>> {
        self.entries.read().get(&(device, command_type)).cloned()
    }

    /// Reject commands no processor can take
    pub fn check_command(
        &self,
        device: DeviceIndex,
        command_type: CommandType,
        dst_count: u32,
        src_count: u32,
    ) -> Result<()> {
        self.check_device(device)?;
        let entry = self
            .lookup(device, command_type)
            .ok_or(Error::InvalidParams)?;
        if !entry.slot.accepts(dst_count, src_count) {
            log::debug!(
                "Processors: {:?}/{:?} takes at most {}/{} syncs, got {}/{}",
                device,
                command_type,
                entry.slot.max_dst,
                entry.slot.max_src,
                dst_count,
                src_count
            );
            return Err(Error::InvalidParams);
        }
        Ok(())
    }

    /// Complete the occupancy named by `cookie`
    pub fn complete(&self, cookie: SlotCookie) -> Result<(usize, usize)> {
        let entry = self
            .lookup(cookie.device, cookie.command_type)
            .ok_or(Error::InvalidParams)?;
        entry.slot.complete(cookie)
    }

    /// Number of registered `(device, type)` pairs
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// No processor registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    // =========================================================================
    // Hooks
    // =========================================================================

    /// Install (or replace) a device's command-complete hook
    pub fn set_hook(&self, device: DeviceIndex, hook: Arc<dyn CommandCompleteHook>) -> Result<()> {
        self.check_device(device)?;
        self.hooks.write().insert(device, hook);
        Ok(())
    }

    /// Remove a device's hook
    pub fn clear_hook(&self, device: DeviceIndex) -> Result<()> {
        self.check_device(device)?;
        self.hooks
            .write()
            .remove(&device)
            .map(|_| ())
            .ok_or(Error::InvalidParams)
    }

    /// Call every hook, in device order, without holding the hook list
    pub fn notify_hooks(&self) {
        let hooks: Vec<(DeviceIndex, Arc<dyn CommandCompleteHook>)> = self
            .hooks
            .read()
            .iter()
            .map(|(device, hook)| (*device, Arc::clone(hook)))
            .collect();

        for (device, hook) in hooks {
            hook.command_complete(device);
        }
    }
}

impl fmt::Debug for ProcessorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorTable")
            .field("max_devices", &self.max_devices)
            .field("entries", &self.entries.read().len())
            .field("hooks", &self.hooks.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};
    use helix_cmdq_core::SyncData;

    fn accept_all() -> Box<dyn CommandProcessor> {
        Box::new(|_: SlotCookie, _: &[u8]| true)
    }

    fn dev(n: u32) -> DeviceIndex {
        DeviceIndex::new(n)
    }

    #[test]
    fn test_register_and_lookup() {
        let table = ProcessorTable::new(4);
        table
            .register(dev(1), alloc::vec![accept_all(), accept_all()], &[[1, 0], [2, 3]])
            .unwrap();

        assert_eq!(table.len(), 2);
        let entry = table.lookup(dev(1), CommandType::new(1)).unwrap();
        assert_eq!(entry.slot().max_dst(), 2);
        assert_eq!(entry.slot().max_src(), 3);
        assert!(table.lookup(dev(1), CommandType::new(2)).is_none());
        assert!(table.lookup(dev(0), CommandType::new(0)).is_none());
    }

    #[test]
    fn test_register_rejects_bad_input() {
        let table = ProcessorTable::new(4);
        assert_eq!(
            table.register(dev(4), alloc::vec![accept_all()], &[[0, 0]]),
            Err(Error::InvalidParams)
        );
        assert_eq!(
            table.register(dev(0), alloc::vec![accept_all()], &[[0, 0], [0, 0]]),
            Err(Error::InvalidParams)
        );
        assert_eq!(table.register(dev(0), Vec::new(), &[]), Err(Error::InvalidParams));

        table.register(dev(0), alloc::vec![accept_all()], &[[0, 0]]).unwrap();
        assert_eq!(
            table.register(dev(0), alloc::vec![accept_all()], &[[0, 0]]),
            Err(Error::InvalidParams)
        );
    }

    #[test]
    fn test_remove() {
        let table = ProcessorTable::new(4);
        table
            .register(dev(2), alloc::vec![accept_all(), accept_all()], &[[0, 0], [0, 0]])
            .unwrap();
        table.remove(dev(2), 2).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.remove(dev(2), 2), Err(Error::InvalidParams));

        // Device can be registered again afterwards
        table.register(dev(2), alloc::vec![accept_all()], &[[0, 0]]).unwrap();
    }

    #[test]
    fn test_check_command() {
        let table = ProcessorTable::new(4);
        table.register(dev(0), alloc::vec![accept_all()], &[[1, 2]]).unwrap();

        assert!(table.check_command(dev(0), CommandType::new(0), 1, 2).is_ok());
        assert_eq!(
            table.check_command(dev(0), CommandType::new(0), 2, 0),
            Err(Error::InvalidParams)
        );
        assert_eq!(
            table.check_command(dev(0), CommandType::new(1), 0, 0),
            Err(Error::InvalidParams)
        );
        assert_eq!(
            table.check_command(dev(9), CommandType::new(0), 0, 0),
            Err(Error::InvalidParams)
        );
    }

    #[test]
    fn test_slot_single_occupancy() {
        let slot = CompletionSlot::new(1, 1).unwrap();
        let data = SyncData::new_shared();
        let dst = SyncObject::admit_write(&data);

        let cookie = slot
            .acquire(dev(0), CommandType::new(0), core::iter::once(dst), core::iter::empty())
            .unwrap();
        assert!(slot.is_in_use());
        assert_eq!(
            slot.acquire(dev(0), CommandType::new(0), core::iter::empty(), core::iter::empty()),
            Err(Error::FailedDependencies)
        );

        assert_eq!(slot.complete(cookie), Ok((1, 0)));
        assert_eq!(data.write_ops_complete(), 1);
        assert!(!slot.is_in_use());
    }

    #[test]
    fn test_stale_cookie_rejected() {
        let slot = CompletionSlot::new(0, 0).unwrap();
        let first = slot
            .acquire(dev(0), CommandType::new(0), core::iter::empty(), core::iter::empty())
            .unwrap();
        slot.complete(first).unwrap();
        assert_eq!(slot.complete(first), Err(Error::InvalidParams));

        let second = slot
            .acquire(dev(0), CommandType::new(0), core::iter::empty(), core::iter::empty())
            .unwrap();
        assert_ne!(first.sequence, second.sequence);
        assert_eq!(slot.complete(first), Err(Error::InvalidParams));
        assert!(slot.complete(second).is_ok());
    }

    #[test]
    fn test_abandon_leaves_counters() {
        let slot = CompletionSlot::new(1, 0).unwrap();
        let data = SyncData::new_shared();
        let cookie = slot
            .acquire(
                dev(0),
                CommandType::new(0),
                core::iter::once(SyncObject::admit_write(&data)),
                core::iter::empty(),
            )
            .unwrap();
        slot.abandon(cookie);
        assert!(!slot.is_in_use());
        assert_eq!(data.write_ops_complete(), 0);
        // The abandoned objects no longer hold the counters
        assert_eq!(Arc::strong_count(&data), 1);
    }

    #[test]
    fn test_hooks() {
        let table = ProcessorTable::new(4);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        table
            .set_hook(
                dev(3),
                Arc::new(move |device: DeviceIndex| {
                    assert_eq!(device, DeviceIndex::new(3));
                    seen.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        table.notify_hooks();
        table.notify_hooks();
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        table.clear_hook(dev(3)).unwrap();
        table.notify_hooks();
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(table.clear_hook(dev(3)), Err(Error::InvalidParams));
    }
}
