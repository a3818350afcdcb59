//! Named shared memory segment holding one queue.
//!
//! Layout of the segment, all offsets relative to its base:
//!
//! ```text
//! 0            Header { abi_tag, ref_count, RingState, SyncCore }
//! DATA_OFFSET  capacity * block_size bytes of blocks
//! ```
//!
//! The creator publishes `abi_tag` last; openers wait for it before reading
//! anything else. `ref_count` counts attached handles in all processes and the
//! handle that drops it to zero unlinks the segment.

use std::ffi::CString;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};
use serde_derive::{Deserialize, Serialize};
use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::errors::{QueueError, Result};
use crate::ring::{Ring, RingState, MESSAGE_HEADER_SIZE};
use crate::sync::SyncCore;

pub const MAX_NAME_LEN: usize = 200;

const DATA_ALIGNMENT: usize = 64;
const DATA_OFFSET: usize = (mem::size_of::<Header>() + DATA_ALIGNMENT - 1) & !(DATA_ALIGNMENT - 1);
const ABI_TAG: u32 = 0x524d_5100 ^ mem::size_of::<Header>() as u32;

const OPEN_RETRIES: u32 = 100;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(1);
const INIT_TIMEOUT: Duration = Duration::from_secs(5);

#[repr(C)]
struct Header {
    abi_tag: AtomicU32,
    ref_count: AtomicU32,
    ring: RingState,
    sync: SyncCore,
}

/// Access mode applied to the segment at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u32);

impl Permissions {
    pub fn new(mode: u32) -> Permissions {
        Permissions(mode & 0o777)
    }

    /// Read/write for every user.
    pub fn unrestricted() -> Permissions {
        Permissions(0o666)
    }

    pub fn mode(&self) -> u32 {
        self.0
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions(0o600)
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(QueueError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };
    let mut chars = name.chars();
    match chars.next() {
        None => return invalid("name is empty"),
        Some(c) if !(c.is_ascii_alphabetic() || c == '_') => {
            return invalid("name must start with a letter or '_'")
        }
        _ => {}
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return invalid("name may only contain ASCII letters, digits and '_'");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("name is too long");
    }
    Ok(())
}

pub fn validate_geometry(capacity: u32, block_size: u32) -> Result<()> {
    if capacity == 0 {
        return Err(QueueError::InvalidArgument("capacity must be at least 1".to_string()));
    }
    if !block_size.is_power_of_two() || block_size < MESSAGE_HEADER_SIZE {
        return Err(QueueError::InvalidArgument(format!(
            "block size {} must be a power of two no smaller than {}",
            block_size, MESSAGE_HEADER_SIZE
        )));
    }
    if capacity.checked_mul(block_size).is_none() {
        return Err(QueueError::InvalidArgument(format!(
            "{} blocks of {} bytes exceed the 4 GiB queue limit",
            capacity, block_size
        )));
    }
    Ok(())
}

#[inline]
fn os_id(name: &str) -> String {
    format!("/{}", name)
}

fn region_size(capacity: u32, block_size: u32) -> usize {
    DATA_OFFSET + capacity as usize * block_size as usize
}

/// One attachment to a named segment.
pub struct Region {
    shmem: Shmem,
    name: String,
    header: NonNull<Header>,
    ring: Ring,
}

// Header fields are atomics or guarded by the robust mutex inside it.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Creates the segment, failing with `AlreadyExists` if the name is taken.
    pub fn create(name: &str, capacity: u32, block_size: u32, perms: Permissions) -> Result<Region> {
        validate_name(name)?;
        validate_geometry(capacity, block_size)?;

        let mut shmem = match ShmemConf::new()
            .os_id(os_id(name))
            .size(region_size(capacity, block_size))
            .create()
        {
            Ok(v) => v,
            Err(ShmemError::MappingIdExists) => return Err(QueueError::AlreadyExists(name.to_string())),
            Err(e) => return Err(e.into()),
        };

        // Still the owner: an error below unlinks the half-built segment.
        let header = shmem.as_ptr() as *mut Header;
        unsafe {
            RingState::init(ptr::addr_of_mut!((*header).ring), capacity, block_size);
            SyncCore::init(ptr::addr_of_mut!((*header).sync))?;
            (*header).ref_count.store(1, Ordering::Relaxed);
        }
        apply_permissions(name, perms)?;
        unsafe { (*header).abi_tag.store(ABI_TAG, Ordering::Release) };
        shmem.set_owner(false);

        debug!(
            "created message queue {:?}: {} blocks of {} bytes, mode {:o}",
            name,
            capacity,
            block_size,
            perms.mode()
        );
        Ok(Region::attached(shmem, name))
    }

    /// Attaches to an existing segment, failing with `NotFound` if absent.
    pub fn open(name: &str) -> Result<Region> {
        validate_name(name)?;
        let shmem = open_mapping(name)?;
        let header = unsafe { &*(shmem.as_ptr() as *const Header) };

        let deadline = Instant::now() + INIT_TIMEOUT;
        while header.abi_tag.load(Ordering::Acquire) != ABI_TAG {
            if header.abi_tag.load(Ordering::Relaxed) != 0 {
                return Err(QueueError::Corrupted(format!(
                    "segment {:?} was created by an incompatible queue layout",
                    name
                )));
            }
            if Instant::now() >= deadline {
                return Err(QueueError::Corrupted(format!("segment {:?} was never initialised", name)));
            }
            thread::yield_now();
        }

        let (capacity, block_size) = (header.ring.capacity(), header.ring.block_size());
        if validate_geometry(capacity, block_size).is_err() || shmem.len() < region_size(capacity, block_size) {
            return Err(QueueError::Corrupted(format!(
                "segment {:?} of {} bytes cannot hold {} blocks of {} bytes",
                name,
                shmem.len(),
                capacity,
                block_size
            )));
        }

        // A zero count means the last handle is tearing the segment down.
        let mut count = header.ref_count.load(Ordering::Acquire);
        loop {
            if count == 0 {
                return Err(QueueError::NotFound(name.to_string()));
            }
            match header
                .ref_count
                .compare_exchange_weak(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => count = current,
            }
        }

        debug!("opened message queue {:?} ({} handles)", name, count + 1);
        Ok(Region::attached(shmem, name))
    }

    /// Creates the segment, or attaches to it when it already exists. The
    /// returned flag tells whether this call created it.
    pub fn open_or_create(name: &str, capacity: u32, block_size: u32, perms: Permissions) -> Result<(Region, bool)> {
        let mut attempts = 0;
        loop {
            match Region::create(name, capacity, block_size, perms) {
                Ok(region) => return Ok((region, true)),
                Err(QueueError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
            match Region::open(name) {
                Ok(region) => return Ok((region, false)),
                // Destroyed between our two attempts: let the unlink land, then create again.
                Err(QueueError::NotFound(_)) if attempts < OPEN_RETRIES => {
                    attempts += 1;
                    thread::sleep(OPEN_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unlinks a named segment regardless of attached handles. Returns
    /// whether it existed.
    pub fn remove(name: &str) -> Result<bool> {
        validate_name(name)?;
        let id = CString::new(os_id(name)).map_err(|_| QueueError::InvalidName {
            name: name.to_string(),
            reason: "name contains a NUL byte",
        })?;
        if unsafe { libc::shm_unlink(id.as_ptr()) } == 0 {
            debug!("removed message queue {:?}", name);
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            Ok(false)
        } else {
            Err(QueueError::System {
                op: "shm_unlink",
                source: err,
            })
        }
    }

    fn attached(shmem: Shmem, name: &str) -> Region {
        let base = shmem.as_ptr();
        let header = base as *mut Header;
        let ring = unsafe { Ring::from_raw(ptr::addr_of_mut!((*header).ring), base.add(DATA_OFFSET)) };
        Region {
            header: unsafe { NonNull::new_unchecked(header) },
            ring,
            shmem,
            name: name.to_string(),
        }
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { self.header.as_ref() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn sync(&self) -> &SyncCore {
        &self.header().sync
    }

    pub fn ref_count(&self) -> u32 {
        self.header().ref_count.load(Ordering::Acquire)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let previous = self.header().ref_count.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 {
            // Dropping the mapping as owner unlinks the name.
            self.shmem.set_owner(true);
            debug!("destroying message queue {:?}", self.name);
        } else {
            debug!("detached from message queue {:?} ({} handles left)", self.name, previous - 1);
        }
    }
}

fn open_mapping(name: &str) -> Result<Shmem> {
    let mut attempts = 0;
    loop {
        match ShmemConf::new().os_id(os_id(name)).open() {
            Ok(shmem) if shmem.len() >= DATA_OFFSET => return Ok(shmem),
            Ok(_) => {}
            Err(ShmemError::MapOpenFailed(code)) if code as i32 == libc::ENOENT => {
                return Err(QueueError::NotFound(name.to_string()))
            }
            // The creator may not have sized the object yet.
            Err(e) if attempts >= OPEN_RETRIES => return Err(e.into()),
            Err(_) => {}
        }
        if attempts >= OPEN_RETRIES {
            return Err(QueueError::Corrupted(format!("segment {:?} is too small to hold a queue", name)));
        }
        attempts += 1;
        thread::sleep(OPEN_RETRY_DELAY);
    }
}

#[cfg(target_os = "linux")]
fn apply_permissions(name: &str, perms: Permissions) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let path = format!("/dev/shm/{}", name);
    fs::set_permissions(&path, fs::Permissions::from_mode(perms.mode())).map_err(|e| {
        error!("failed to apply mode {:o} to {}: {}", perms.mode(), path, e);
        QueueError::from(e)
    })
}

#[cfg(not(target_os = "linux"))]
fn apply_permissions(name: &str, perms: Permissions) -> Result<()> {
    debug!(
        "leaving default permissions on {:?}; mode {:o} is only applied on Linux",
        name,
        perms.mode()
    );
    Ok(())
}
