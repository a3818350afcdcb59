use std::mem;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::errors::{QueueError, Result};
use crate::region::{Permissions, Region};
use crate::ring::{blocks_needed, Recovery, Ring};
use crate::sink::ReceiveSink;
use crate::sync::{Condition, LockState, SyncGuard};

/// Outcome of a blocking `send` or `receive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Succeeded,
    /// The queue was stopped before the operation could complete.
    Aborted,
}

/// What `send` does when the message does not fit right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicy {
    #[serde(rename = "block")]
    BlockOnOverflow,
    #[serde(rename = "throw")]
    ThrowOnOverflow,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::BlockOnOverflow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    CreateOnly,
    OpenOrCreate,
    OpenOnly,
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::OpenOrCreate
    }
}

struct Attachment {
    region: Arc<Region>,
    policy: OverflowPolicy,
}

/// Exclusive access to a region, with dead-owner repair applied.
struct QueueLock<'a> {
    guard: SyncGuard<'a>,
    region: &'a Region,
}

impl<'a> QueueLock<'a> {
    fn acquire(region: &'a Region) -> Result<QueueLock<'a>> {
        let (guard, state) = region.sync().lock()?;
        let lock = QueueLock { guard, region };
        if state == LockState::OwnerDied {
            lock.recover()?;
        }
        Ok(lock)
    }

    fn recover(&self) -> Result<()> {
        // SAFETY: the robust mutex is held.
        match unsafe { self.ring().recover() } {
            Recovery::Intact => warn!(
                "message queue {:?}: previous lock owner died, queue state is intact",
                self.region.name()
            ),
            Recovery::RolledForward => warn!(
                "message queue {:?}: previous lock owner died mid-update, update completed",
                self.region.name()
            ),
            Recovery::Cleared => warn!(
                "message queue {:?}: previous lock owner died leaving damaged state, pending messages discarded",
                self.region.name()
            ),
        }
        self.guard.mark_consistent()
    }

    fn wait(&mut self, condition: Condition) -> Result<()> {
        if self.guard.wait(condition)? == LockState::OwnerDied {
            self.recover()?;
        }
        Ok(())
    }

    #[inline]
    fn ring(&self) -> Ring {
        self.region.ring()
    }

    fn has_room(&self, message: &[u8]) -> bool {
        let ring = self.ring();
        ring.free_blocks() >= blocks_needed(message.len() as u32, ring.block_size())
    }

    fn try_push(&self, message: &[u8]) -> bool {
        // SAFETY: the lock is held and the size was checked by the caller.
        unsafe { self.ring().try_push(message) }
    }

    fn pop<S: ReceiveSink + ?Sized>(&self, sink: &mut S) -> Result<bool> {
        // SAFETY: the lock is held.
        unsafe { self.ring().pop(sink) }
    }

    fn clear(&self) {
        // SAFETY: the lock is held.
        unsafe { self.ring().clear() }
    }
}

fn stop_region(region: &Region) -> Result<()> {
    let lock = QueueLock::acquire(region)?;
    lock.guard.set_running(false);
    lock.guard.notify_all();
    info!("message queue {:?} stopped", region.name());
    Ok(())
}

/// A handle to a named, interprocess, block-structured message queue.
///
/// The handle is move-only; [`ReliableMessageQueue::default`] is the
/// unattached state, and dropping an attached handle closes it. The queue is
/// destroyed when the last handle in any process closes.
///
/// All operations except `close` and the attach methods take `&self` and may
/// be called from several threads at once.
#[derive(Default)]
pub struct ReliableMessageQueue {
    attachment: Option<Attachment>,
}

impl ReliableMessageQueue {
    pub fn new() -> ReliableMessageQueue {
        ReliableMessageQueue::default()
    }

    /// Creates a new queue, failing with `AlreadyExists` if the name is taken.
    pub fn create(
        name: &str,
        capacity: u32,
        block_size: u32,
        perms: Permissions,
        policy: OverflowPolicy,
    ) -> Result<ReliableMessageQueue> {
        let mut queue = ReliableMessageQueue::new();
        queue.attach_create(name, capacity, block_size, perms, policy)?;
        Ok(queue)
    }

    /// Creates the queue or attaches to an existing one. In the latter case
    /// `capacity` and `block_size` are ignored in favour of the existing
    /// queue's parameters.
    pub fn open_or_create(
        name: &str,
        capacity: u32,
        block_size: u32,
        perms: Permissions,
        policy: OverflowPolicy,
    ) -> Result<ReliableMessageQueue> {
        let mut queue = ReliableMessageQueue::new();
        queue.attach_open_or_create(name, capacity, block_size, perms, policy)?;
        Ok(queue)
    }

    /// Attaches to an existing queue, failing with `NotFound` if absent.
    pub fn open(name: &str, policy: OverflowPolicy) -> Result<ReliableMessageQueue> {
        let mut queue = ReliableMessageQueue::new();
        queue.attach_open(name, policy)?;
        Ok(queue)
    }

    pub fn from_config(cfg: &QueueConfig) -> Result<ReliableMessageQueue> {
        let mut queue = ReliableMessageQueue::new();
        queue.attach(cfg)?;
        Ok(queue)
    }

    /// Attaches this handle as described by `cfg`.
    pub fn attach(&mut self, cfg: &QueueConfig) -> Result<()> {
        let perms = Permissions::new(cfg.permissions);
        match cfg.open_mode {
            OpenMode::CreateOnly => {
                self.attach_create(&cfg.name, cfg.capacity, cfg.block_size, perms, cfg.overflow_policy)
            }
            OpenMode::OpenOrCreate => {
                self.attach_open_or_create(&cfg.name, cfg.capacity, cfg.block_size, perms, cfg.overflow_policy)
            }
            OpenMode::OpenOnly => self.attach_open(&cfg.name, cfg.overflow_policy),
        }
    }

    pub fn attach_create(
        &mut self,
        name: &str,
        capacity: u32,
        block_size: u32,
        perms: Permissions,
        policy: OverflowPolicy,
    ) -> Result<()> {
        self.ensure_detached()?;
        let region = Region::create(name, capacity, block_size, perms)?;
        self.install(region, policy);
        Ok(())
    }

    pub fn attach_open_or_create(
        &mut self,
        name: &str,
        capacity: u32,
        block_size: u32,
        perms: Permissions,
        policy: OverflowPolicy,
    ) -> Result<()> {
        self.ensure_detached()?;
        let (region, created) = Region::open_or_create(name, capacity, block_size, perms)?;
        if !created && (region.ring().capacity() != capacity || region.ring().block_size() != block_size) {
            debug!(
                "message queue {:?} already exists with {} blocks of {} bytes, requested {} of {}",
                name,
                region.ring().capacity(),
                region.ring().block_size(),
                capacity,
                block_size
            );
        }
        self.install(region, policy);
        Ok(())
    }

    pub fn attach_open(&mut self, name: &str, policy: OverflowPolicy) -> Result<()> {
        self.ensure_detached()?;
        let region = Region::open(name)?;
        self.install(region, policy);
        Ok(())
    }

    fn ensure_detached(&self) -> Result<()> {
        match &self.attachment {
            Some(attachment) => Err(QueueError::AlreadyOpen(attachment.region.name().to_string())),
            None => Ok(()),
        }
    }

    fn install(&mut self, region: Region, policy: OverflowPolicy) {
        self.attachment = Some(Attachment {
            region: Arc::new(region),
            policy,
        });
    }

    #[inline]
    fn attachment(&self) -> Result<&Attachment> {
        self.attachment.as_ref().ok_or(QueueError::NotOpen)
    }

    #[inline]
    fn region(&self) -> Result<&Region> {
        Ok(&self.attachment()?.region)
    }

    pub fn is_open(&self) -> bool {
        self.attachment.is_some()
    }

    /// Detaches from the queue, destroying it if this was the last handle.
    /// Calling it on an unattached handle does nothing.
    pub fn close(&mut self) {
        if let Some(attachment) = self.attachment.take() {
            debug!("closing handle to message queue {:?}", attachment.region.name());
        }
    }

    /// Moves the attachment out, leaving this handle unattached.
    pub fn take(&mut self) -> ReliableMessageQueue {
        mem::take(self)
    }

    pub fn swap(&mut self, other: &mut ReliableMessageQueue) {
        mem::swap(&mut self.attachment, &mut other.attachment);
    }

    pub fn name(&self) -> Result<&str> {
        Ok(self.region()?.name())
    }

    /// Number of blocks of the attached queue, which may differ from the
    /// requested value if the queue already existed.
    pub fn capacity(&self) -> Result<u32> {
        Ok(self.region()?.ring().capacity())
    }

    pub fn block_size(&self) -> Result<u32> {
        Ok(self.region()?.ring().block_size())
    }

    pub fn max_message_size(&self) -> Result<u32> {
        Ok(self.region()?.ring().max_message_size())
    }

    pub fn overflow_policy(&self) -> Result<OverflowPolicy> {
        Ok(self.attachment()?.policy)
    }

    /// Queue-wide running state, as last set by `stop` or `reset` in any process.
    pub fn is_running(&self) -> Result<bool> {
        Ok(self.region()?.sync().is_running())
    }

    /// Puts the queue in stopped state and wakes every blocked `send` and
    /// `receive` in every process; they return [`OperationResult::Aborted`].
    /// Returns without waiting for them.
    pub fn stop(&self) -> Result<()> {
        stop_region(self.region()?)
    }

    /// Puts the queue back in running state.
    pub fn reset(&self) -> Result<()> {
        let region = self.region()?;
        let lock = QueueLock::acquire(region)?;
        lock.guard.set_running(true);
        info!("message queue {:?} reset to running", region.name());
        Ok(())
    }

    /// Discards every pending message. Blocked senders are woken to retry
    /// against the emptied buffer.
    pub fn clear(&self) -> Result<()> {
        let region = self.region()?;
        let lock = QueueLock::acquire(region)?;
        lock.clear();
        lock.guard.notify(Condition::SpaceAvailable);
        info!("message queue {:?} cleared", region.name());
        Ok(())
    }

    fn check_message(&self, message: &[u8]) -> Result<&Attachment> {
        let attachment = self.attachment()?;
        let limit = attachment.region.ring().max_message_size();
        if message.len() > limit as usize {
            return Err(QueueError::MessageTooLarge {
                size: message.len(),
                limit,
            });
        }
        Ok(attachment)
    }

    /// Sends a message, blocking while the queue lacks space and is running.
    /// On a stopped queue it returns `Aborted` at once, even with room.
    ///
    /// With [`OverflowPolicy::ThrowOnOverflow`] a message that does not fit
    /// fails with `QueueFull` instead of blocking, whether or not the queue
    /// is running.
    pub fn send(&self, message: &[u8]) -> Result<OperationResult> {
        let attachment = self.check_message(message)?;
        let throw = attachment.policy == OverflowPolicy::ThrowOnOverflow;
        let mut lock = QueueLock::acquire(&attachment.region)?;
        loop {
            if !lock.guard.is_running() {
                if throw && !lock.has_room(message) {
                    return Err(QueueError::QueueFull);
                }
                return Ok(OperationResult::Aborted);
            }
            if lock.try_push(message) {
                lock.guard.notify(Condition::MessageAvailable);
                return Ok(OperationResult::Succeeded);
            }
            if throw {
                return Err(QueueError::QueueFull);
            }
            lock.wait(Condition::SpaceAvailable)?;
        }
    }

    /// Sends a message if it fits right now. Never blocks.
    pub fn try_send(&self, message: &[u8]) -> Result<bool> {
        let attachment = self.check_message(message)?;
        let lock = QueueLock::acquire(&attachment.region)?;
        if lock.try_push(message) {
            lock.guard.notify(Condition::MessageAvailable);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Receives one message into `sink`, blocking while the queue is empty
    /// and running.
    pub fn receive<S: ReceiveSink + ?Sized>(&self, sink: &mut S) -> Result<OperationResult> {
        let mut lock = QueueLock::acquire(self.region()?)?;
        loop {
            if lock.pop(sink)? {
                lock.guard.notify(Condition::SpaceAvailable);
                return Ok(OperationResult::Succeeded);
            }
            if !lock.guard.is_running() {
                return Ok(OperationResult::Aborted);
            }
            lock.wait(Condition::MessageAvailable)?;
        }
    }

    /// Receives one message into `sink` if one is pending. Never blocks.
    pub fn try_receive<S: ReceiveSink + ?Sized>(&self, sink: &mut S) -> Result<bool> {
        let lock = QueueLock::acquire(self.region()?)?;
        if lock.pop(sink)? {
            lock.guard.notify(Condition::SpaceAvailable);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Blocking receive into a fresh vector; `None` when aborted.
    pub fn receive_vec(&self) -> Result<Option<Vec<u8>>> {
        let mut message = Vec::new();
        match self.receive(&mut message)? {
            OperationResult::Succeeded => Ok(Some(message)),
            OperationResult::Aborted => Ok(None),
        }
    }

    /// A cloneable capability to stop this queue from other threads. It keeps
    /// the queue attached until dropped.
    pub fn stopper(&self) -> Result<Stopper> {
        Ok(Stopper {
            region: Arc::clone(&self.attachment()?.region),
        })
    }

    /// Unlinks the named queue even if handles are still attached; those
    /// keep working on the unlinked segment. Returns whether it existed.
    pub fn remove(name: &str) -> Result<bool> {
        Region::remove(name)
    }

    #[cfg(test)]
    pub(crate) fn shared_region(&self) -> Result<&Arc<Region>> {
        Ok(&self.attachment()?.region)
    }
}

impl Drop for ReliableMessageQueue {
    fn drop(&mut self) {
        self.close();
    }
}

/// Stops a queue from any thread; see [`ReliableMessageQueue::stopper`].
#[derive(Clone)]
pub struct Stopper {
    region: Arc<Region>,
}

impl Stopper {
    pub fn stop(&self) -> Result<()> {
        stop_region(&self.region)
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }
}
