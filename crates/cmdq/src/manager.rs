//! # Queue Manager
//!
//! Process-wide owner of the queue list, the processor table and the
//! dispatcher lock.
//!
//! There is no scheduler thread. Dispatcher passes run on whichever context
//! calls [`QueueManager::process_queues`] or
//! [`QueueManager::command_complete`]: a submitting process, the kernel, or
//! the interrupt path.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use helix_cmdq_core::{
    wait_until, CallerId, Clock, CommandType, DeviceIndex, Error, ProcessId, QueueConfig,
    QueueId, Result,
};
use spin::Once;

use crate::deferred::DeferredExecutor;
use crate::dispatch::{run_passes, DispatchCounters, DispatchStats};
use crate::lock::ProcessLock;
use crate::processor::{CommandCompleteHook, CommandProcessor, ProcessorTable, SlotCookie};
use crate::queue::{Command, CommandDesc, CommandQueue, QueueInfo, Reservation};

type QueueList = Vec<Arc<CommandQueue>>;

// =============================================================================
// MANAGER STATE
// =============================================================================

struct ManagerInner {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    executor: Arc<dyn DeferredExecutor>,
    processors: ProcessorTable,
    /// Created with the first queue
    queues: Once<ProcessLock<QueueList>>,
    next_id: AtomicU32,
    counters: DispatchCounters,
}

impl ManagerInner {
    fn process_queues(&self, caller: CallerId, flush: bool) -> Result<()> {
        let Some(lock) = self.queues.get() else {
            self.processors.notify_hooks();
            return Ok(());
        };

        let Some(mut guard) = lock.try_lock_or_flag(caller) else {
            DispatchCounters::bump(&self.counters.blocked_calls);
            if caller.is_isr() {
                return Ok(());
            }
            log::debug!("Dispatcher: {:?} blocked, pass left to lock holder", caller);
            return Err(Error::ProcessingBlocked);
        };

        loop {
            run_passes(lock, &guard, &self.processors, flush, &self.counters);
            drop(guard);

            // A request that raced with unlocking
            if !lock.reprocess_requested() {
                break;
            }
            guard = match lock.try_lock_or_flag(caller) {
                Some(guard) => guard,
                None => break,
            };
            DispatchCounters::bump(&self.counters.reprocess_runs);
        }

        self.processors.notify_hooks();
        Ok(())
    }
}

// =============================================================================
// QUEUE MANAGER
// =============================================================================

/// Command queue services for one GPU
///
/// Cloning gives another handle to the same services.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl QueueManager {
    /// Create the services
    pub fn new(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        executor: Arc<dyn DeferredExecutor>,
    ) -> Result<Self> {
        if !config.is_valid() {
            log::error!("CmdQueue: invalid configuration {:?}", config);
            return Err(Error::InvalidParams);
        }

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                clock,
                executor,
                processors: ProcessorTable::new(config.max_devices),
                queues: Once::new(),
                next_id: AtomicU32::new(1),
                counters: DispatchCounters::default(),
            }),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Dispatcher counters
    pub fn stats(&self) -> DispatchStats {
        self.inner.counters.snapshot()
    }

    /// Processor table
    pub fn processors(&self) -> &ProcessorTable {
        &self.inner.processors
    }

    fn queue_lock(&self) -> &ProcessLock<QueueList> {
        self.inner
            .queues
            .call_once(|| ProcessLock::new(Vec::new()))
    }

    // =========================================================================
    // Queue lifecycle
    // =========================================================================

    /// Create a queue of at least `size` bytes owned by `owner`
    pub fn create_queue(&self, owner: ProcessId, size: u32) -> Result<Arc<CommandQueue>> {
        let id = QueueId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(CommandQueue::new(id, owner, size, &self.inner.config)?);

        let mut queues = self.queue_lock().lock_blocking(CallerId::from(owner));
        queues.try_reserve(1).map_err(|_| Error::OutOfMemory)?;
        queues.push(Arc::clone(&queue));
        drop(queues);

        log::debug!(
            "CmdQueue: created {:?} for {:?}, {} bytes",
            id,
            owner,
            queue.capacity()
        );
        Ok(queue)
    }

    /// Wait for `queue` to drain, then unlink it and free its storage
    ///
    /// Destruction goes ahead on a drain timeout; the timeout is still
    /// reported as [`Error::CannotFlushQueue`].
    pub fn destroy_queue(&self, queue: &Arc<CommandQueue>) -> Result<()> {
        let lock = self.inner.queues.get().ok_or(Error::InvalidParams)?;
        if queue.is_destroyed() {
            return Err(Error::InvalidParams);
        }

        queue.mark_draining();
        let config = &self.inner.config;
        let drained = wait_until(
            self.inner.clock.as_ref(),
            config.drain_timeout_us,
            config.poll_interval_us,
            || queue.is_empty(),
        );
        if !drained {
            log::warn!(
                "CmdQueue: {:?} did not drain, {} bytes still queued",
                queue.id(),
                queue.used_space()
            );
        }

        let mut queues = lock.lock_blocking(CallerId::Kernel);
        let Some(index) = queues.iter().position(|q| Arc::ptr_eq(q, queue)) else {
            return Err(Error::InvalidParams);
        };
        queues.remove(index);
        drop(queues);

        queue.release_storage();
        log::debug!("CmdQueue: destroyed {:?}", queue.id());

        if drained {
            Ok(())
        } else {
            Err(Error::CannotFlushQueue)
        }
    }

    /// Destroy every queue owned by `owner`, returning how many went
    ///
    /// All of them are destroyed even if some fail to drain; that is then
    /// reported as [`Error::CannotFlushQueue`].
    pub fn destroy_process_queues(&self, owner: ProcessId) -> Result<usize> {
        let Some(lock) = self.inner.queues.get() else {
            return Ok(0);
        };
        let owned: Vec<Arc<CommandQueue>> = lock
            .lock_blocking(CallerId::Kernel)
            .iter()
            .filter(|q| q.owner() == owner)
            .cloned()
            .collect();

        let mut destroyed = 0;
        let mut flush_failed = false;
        for queue in &owned {
            match self.destroy_queue(queue) {
                Ok(()) => destroyed += 1,
                Err(Error::CannotFlushQueue) => {
                    destroyed += 1;
                    flush_failed = true;
                },
                // Already gone through another path
                Err(_) => {},
            }
        }

        if destroyed > 0 {
            log::info!("CmdQueue: released {} queues of {:?}", destroyed, owner);
        }
        if flush_failed {
            Err(Error::CannotFlushQueue)
        } else {
            Ok(destroyed)
        }
    }

    /// Number of live queues
    pub fn queue_count(&self) -> usize {
        self.inner
            .queues
            .get()
            .map_or(0, |lock| lock.lock_blocking(CallerId::Kernel).len())
    }

    /// Snapshot every live queue and log it
    pub fn dump_queues(&self) -> Vec<QueueInfo> {
        let Some(lock) = self.inner.queues.get() else {
            return Vec::new();
        };
        let queues: Vec<Arc<CommandQueue>> = lock.lock_blocking(CallerId::Kernel).clone();

        let infos: Vec<QueueInfo> = queues.iter().map(|q| q.info()).collect();
        for info in &infos {
            log::info!(
                "CmdQueue: {:?} owner {:?} cap {} read {} write {} free {} state {:?}",
                info.id,
                info.owner,
                info.capacity,
                info.read_offset,
                info.write_offset,
                info.free_space,
                info.state
            );
            for cmd in &info.commands {
                log::info!(
                    "CmdQueue:   @{} {:?}/{:?} size {} dst {:?} src {:?}",
                    cmd.offset,
                    cmd.header.device,
                    cmd.header.command_type,
                    cmd.header.size,
                    cmd.dst,
                    cmd.src
                );
            }
        }
        infos
    }

    // =========================================================================
    // Producer side
    // =========================================================================

    /// Reserve `size` bytes at the queue's write cursor
    pub fn get_space(&self, queue: &CommandQueue, size: u32) -> Result<Reservation> {
        queue.get_space(self.inner.clock.as_ref(), size)
    }

    /// Give back an unused reservation
    pub fn release_space(&self, queue: &CommandQueue, reservation: Reservation) -> Result<()> {
        queue.release(reservation)
    }

    /// Lay out a command in a reservation
    pub fn insert_reserved(
        &self,
        queue: &CommandQueue,
        reservation: Reservation,
        desc: &CommandDesc<'_>,
    ) -> Result<Command> {
        if let Err(e) = self.check_desc(desc) {
            queue.release(reservation)?;
            return Err(e);
        }
        queue.insert_reserved(reservation, desc)
    }

    /// Reserve space for and lay out a command
    ///
    /// The command is staged: fill its payload with
    /// [`with_command_data`](Self::with_command_data), then publish it with
    /// [`submit_command`](Self::submit_command).
    pub fn insert_command(&self, queue: &CommandQueue, desc: &CommandDesc<'_>) -> Result<Command> {
        self.check_desc(desc)?;
        let size = desc.record_size()?;
        let reservation = self.get_space(queue, size)?;
        queue.insert_reserved(reservation, desc)
    }

    fn check_desc(&self, desc: &CommandDesc<'_>) -> Result<()> {
        self.inner.processors.check_command(
            desc.device,
            desc.command_type,
            desc.dst_syncs.len() as u32,
            desc.src_syncs.len() as u32,
        )
    }

    /// Access a staged command's payload
    pub fn with_command_data<R>(
        &self,
        queue: &CommandQueue,
        command: &Command,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        queue.with_command_data(command, f)
    }

    /// Give back a staged command that carries no sources
    pub fn release_command(&self, queue: &CommandQueue, command: Command) -> Result<()> {
        queue.release_command(command)
    }

    /// Publish a staged command to the dispatcher
    pub fn submit_command(&self, queue: &CommandQueue, command: Command) -> Result<()> {
        queue.submit_command(command)
    }

    // =========================================================================
    // Dispatch and completion
    // =========================================================================

    /// Run dispatcher passes over every live queue
    ///
    /// If another context is already dispatching, the request is handed to
    /// it: interrupt callers get `Ok`, everyone else
    /// [`Error::ProcessingBlocked`].
    pub fn process_queues(&self, caller: CallerId, flush: bool) -> Result<()> {
        self.inner.process_queues(caller, flush)
    }

    /// Report that the command holding `cookie` has finished
    ///
    /// Signals the command's sync objects, frees its slot, runs the device
    /// hooks, then re-runs the dispatcher: through the deferred executor if
    /// `schedule_deferred`, otherwise right here as the interrupt identity.
    pub fn command_complete(&self, cookie: SlotCookie, schedule_deferred: bool) -> Result<()> {
        let (dst, src) = match self.inner.processors.complete(cookie) {
            Ok(signalled) => signalled,
            Err(e) => {
                log::error!("Dispatcher: completion for {:?} with no command in flight", cookie);
                debug_assert!(false, "completion without a command in flight");
                return Err(e);
            },
        };
        DispatchCounters::bump(&self.inner.counters.completions);
        log::trace!(
            "Dispatcher: {:?}/{:?} complete, {} dst {} src signalled",
            cookie.device,
            cookie.command_type,
            dst,
            src
        );

        self.inner.processors.notify_hooks();

        if schedule_deferred {
            let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
            self.inner.executor.schedule(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    // Interrupt identity never reports contention
                    let _ = inner.process_queues(CallerId::Isr, false);
                }
            }));
            Ok(())
        } else {
            self.inner.process_queues(CallerId::Isr, false)
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register processors for command types `0..processors.len()` of `device`
    pub fn register_cmd_processors(
        &self,
        device: DeviceIndex,
        processors: Vec<Box<dyn CommandProcessor>>,
        max_syncs: &[[u32; 2]],
    ) -> Result<()> {
        self.inner.processors.register(device, processors, max_syncs)
    }

    /// Remove the processors for command types `0..count` of `device`
    pub fn remove_cmd_processors(&self, device: DeviceIndex, count: u32) -> Result<()> {
        self.inner.processors.remove(device, count)
    }

    /// Install a device's command-complete hook
    pub fn set_command_complete_hook(
        &self,
        device: DeviceIndex,
        hook: Arc<dyn CommandCompleteHook>,
    ) -> Result<()> {
        self.inner.processors.set_hook(device, hook)
    }

    /// Remove a device's command-complete hook
    pub fn clear_command_complete_hook(&self, device: DeviceIndex) -> Result<()> {
        self.inner.processors.clear_hook(device)
    }

    /// Processor slot is holding a command
    pub fn is_in_flight(&self, device: DeviceIndex, command_type: CommandType) -> bool {
        self.inner
            .processors
            .lookup(device, command_type)
            .map_or(false, |entry| entry.slot().is_in_use())
    }
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("config", &self.inner.config)
            .field("processors", &self.inner.processors)
            .field("queues", &self.queue_count())
            .finish()
    }
}
