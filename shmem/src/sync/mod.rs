//! Robust, process-shared mutual exclusion and condition variables.
//!
//! Every primitive here lives inside the shared region and is initialised in
//! place by the creator. The mutex is a POSIX robust mutex: when a holder
//! dies, the next locker is told so through [`LockState::OwnerDied`] and must
//! repair the protected state before calling [`SyncGuard::mark_consistent`].

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::errors::{QueueError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Consistent,
    /// The previous holder terminated while holding the lock.
    OwnerDied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    SpaceAvailable,
    MessageAvailable,
}

#[inline]
fn check(op: &'static str, rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(QueueError::system(op, rc))
    }
}

fn lock_result(op: &'static str, rc: libc::c_int) -> Result<LockState> {
    match rc {
        0 => Ok(LockState::Consistent),
        libc::EOWNERDEAD => Ok(LockState::OwnerDied),
        libc::ENOTRECOVERABLE => Err(QueueError::Corrupted(
            "a lock owner died and the queue state was never made consistent".to_string(),
        )),
        rc => Err(QueueError::system(op, rc)),
    }
}

#[repr(C)]
pub struct RobustMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

impl RobustMutex {
    unsafe fn init(this: *mut RobustMutex) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check("pthread_mutexattr_init", libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;

        let mut op = "pthread_mutexattr_setpshared";
        let mut rc = libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        if rc == 0 {
            op = "pthread_mutexattr_setrobust";
            rc = libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST);
        }
        if rc == 0 {
            op = "pthread_mutex_init";
            rc = libc::pthread_mutex_init(UnsafeCell::raw_get(ptr::addr_of!((*this).raw)), attr.as_ptr());
        }
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        check(op, rc)
    }

    fn lock(&self) -> Result<LockState> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        lock_result("pthread_mutex_lock", rc)
    }

    fn unlock(&self) {
        // EPERM here means the lock was lost to ENOTRECOVERABLE; nothing to release.
        unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
    }
}

#[repr(C)]
pub struct Condvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

impl Condvar {
    unsafe fn init(this: *mut Condvar) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check("pthread_condattr_init", libc::pthread_condattr_init(attr.as_mut_ptr()))?;

        let mut op = "pthread_condattr_setpshared";
        let mut rc = libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        if rc == 0 {
            op = "pthread_cond_init";
            rc = libc::pthread_cond_init(UnsafeCell::raw_get(ptr::addr_of!((*this).raw)), attr.as_ptr());
        }
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        check(op, rc)
    }

    fn wait(&self, mutex: &RobustMutex) -> Result<LockState> {
        let rc = unsafe { libc::pthread_cond_wait(self.raw.get(), mutex.raw.get()) };
        lock_result("pthread_cond_wait", rc)
    }

    fn notify_all(&self) {
        let rc = unsafe { libc::pthread_cond_broadcast(self.raw.get()) };
        debug_assert_eq!(rc, 0);
    }
}

/// The lock, both wait conditions and the queue-wide running flag.
#[repr(C)]
pub struct SyncCore {
    mutex: RobustMutex,
    space_available: Condvar,
    message_available: Condvar,
    running: AtomicU32,
}

unsafe impl Send for SyncCore {}
unsafe impl Sync for SyncCore {}

impl SyncCore {
    /// Initialises the primitives in place, leaving the queue running.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory that no other thread or process
    /// is using yet.
    pub unsafe fn init(this: *mut SyncCore) -> Result<()> {
        RobustMutex::init(ptr::addr_of_mut!((*this).mutex))?;
        Condvar::init(ptr::addr_of_mut!((*this).space_available))?;
        Condvar::init(ptr::addr_of_mut!((*this).message_available))?;
        ptr::addr_of_mut!((*this).running).write(AtomicU32::new(1));
        Ok(())
    }

    pub fn lock(&self) -> Result<(SyncGuard<'_>, LockState)> {
        let state = self.mutex.lock()?;
        Ok((
            SyncGuard {
                core: self,
                _not_send: PhantomData,
            },
            state,
        ))
    }

    /// Lock-free read of the queue-wide running flag.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) != 0
    }

    fn condvar(&self, condition: Condition) -> &Condvar {
        match condition {
            Condition::SpaceAvailable => &self.space_available,
            Condition::MessageAvailable => &self.message_available,
        }
    }
}

/// Exclusive access to the region. Unlocks on drop.
pub struct SyncGuard<'a> {
    core: &'a SyncCore,
    // pthread mutexes must be released by the thread that locked them.
    _not_send: PhantomData<*const ()>,
}

impl<'a> SyncGuard<'a> {
    /// Releases the lock, sleeps until `condition` is notified, and re-locks.
    pub fn wait(&mut self, condition: Condition) -> Result<LockState> {
        self.core.condvar(condition).wait(&self.core.mutex)
    }

    pub fn notify(&self, condition: Condition) {
        // Every waiter re-checks: a woken receiver may refuse the message or
        // die inside the wait, and senders may need different run lengths.
        self.core.condvar(condition).notify_all();
    }

    pub fn notify_all(&self) {
        self.core.space_available.notify_all();
        self.core.message_available.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    pub fn set_running(&self, running: bool) {
        self.core.running.store(running as u32, Ordering::Release);
    }

    /// Declares the protected state repaired after [`LockState::OwnerDied`].
    pub fn mark_consistent(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_consistent(self.core.mutex.raw.get()) };
        check("pthread_mutex_consistent", rc)
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.core.mutex.unlock();
    }
}
