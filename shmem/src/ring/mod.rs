//! Block-granular circular buffer living in the shared region.
//!
//! The data area is `capacity` blocks of `block_size` bytes. A message takes a
//! run of `blocks_needed(size)` consecutive blocks (wrapping past the last block
//! back to block 0). Its first block starts with an 8-byte header:
//!
//! ```text
//! offset 0: u32 LE  payload size
//! offset 4: u32 LE  seal = size ^ 0xA5C3_5A3C
//! offset 8: payload bytes
//! ```
//!
//! Cursors are block indices, never addresses, so every process can map the
//! region at a different base. Cursor updates go through a one-entry journal:
//! the target cursors are written first, then `pending` is raised, then the
//! cursors are applied. A lock holder dying anywhere in that sequence leaves
//! either the old state or a journal that can be rolled forward.

use std::cmp;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::errors::{QueueError, Result};
use crate::sink::ReceiveSink;

pub const MESSAGE_HEADER_SIZE: u32 = 8;

const SEAL: u32 = 0xA5C3_5A3C;

#[inline]
pub fn blocks_needed(size: u32, block_size: u32) -> u32 {
    let bytes = size as u64 + MESSAGE_HEADER_SIZE as u64;
    ((bytes + block_size as u64 - 1) / block_size as u64) as u32
}

/// Largest payload that fits into an empty queue.
#[inline]
pub fn max_message_size(capacity: u32, block_size: u32) -> u32 {
    capacity * block_size - MESSAGE_HEADER_SIZE
}

pub fn encode_header(size: u32) -> [u8; MESSAGE_HEADER_SIZE as usize] {
    let mut bytes = [0u8; MESSAGE_HEADER_SIZE as usize];
    bytes[..4].copy_from_slice(&size.to_le_bytes());
    bytes[4..].copy_from_slice(&(size ^ SEAL).to_le_bytes());
    bytes
}

/// Returns the payload size, or `None` when the seal does not match.
pub fn decode_header(bytes: &[u8; MESSAGE_HEADER_SIZE as usize]) -> Option<u32> {
    let size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let seal = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if seal == size ^ SEAL {
        Some(size)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursors {
    pub head: u32,
    pub tail: u32,
    pub free: u32,
}

/// Header part of the circular buffer, shared by all processes.
#[repr(C)]
pub struct RingState {
    capacity: u32,
    block_size: u32,
    free_blocks: AtomicU32,
    head: AtomicU32,
    tail: AtomicU32,
    pending: AtomicU32,
    journal: [AtomicU32; 3],
}

impl RingState {
    pub fn new(capacity: u32, block_size: u32) -> RingState {
        RingState {
            capacity,
            block_size,
            free_blocks: AtomicU32::new(capacity),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            journal: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
        }
    }

    /// # Safety
    ///
    /// `this` must be valid for writes and not yet visible to other processes.
    pub unsafe fn init(this: *mut RingState, capacity: u32, block_size: u32) {
        ptr::write(this, RingState::new(capacity, block_size));
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Cursors and message chain were already consistent.
    Intact,
    /// An interrupted cursor update was completed from the journal.
    RolledForward,
    /// The chain could not be validated; every pending message was discarded.
    Cleared,
}

/// Process-local view over a [`RingState`] and its data blocks.
///
/// Methods marked `unsafe` read or mutate shared state and must only be
/// called while holding the region lock.
#[derive(Clone, Copy)]
pub struct Ring {
    state: NonNull<RingState>,
    data: NonNull<u8>,
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// # Safety
    ///
    /// `state` must point to an initialised [`RingState`] and `data` to
    /// `capacity * block_size` bytes, both outliving the returned view.
    pub unsafe fn from_raw(state: *mut RingState, data: *mut u8) -> Ring {
        Ring {
            state: NonNull::new_unchecked(state),
            data: NonNull::new_unchecked(data),
        }
    }

    #[inline]
    fn state(&self) -> &RingState {
        unsafe { self.state.as_ref() }
    }

    pub fn capacity(&self) -> u32 {
        self.state().capacity
    }

    pub fn block_size(&self) -> u32 {
        self.state().block_size
    }

    pub fn free_blocks(&self) -> u32 {
        self.state().free_blocks.load(Ordering::Acquire)
    }

    pub fn max_message_size(&self) -> u32 {
        max_message_size(self.capacity(), self.block_size())
    }

    #[inline]
    fn buffer_len(&self) -> usize {
        self.capacity() as usize * self.block_size() as usize
    }

    #[inline]
    fn block_offset(&self, block: u32) -> usize {
        block as usize * self.block_size() as usize
    }

    pub(crate) fn cursors(&self) -> Cursors {
        let state = self.state();
        Cursors {
            head: state.head.load(Ordering::Acquire),
            tail: state.tail.load(Ordering::Acquire),
            free: state.free_blocks.load(Ordering::Acquire),
        }
    }

    /// Appends `message` as one block run at the tail. Returns `false` when
    /// there are not enough free blocks right now.
    ///
    /// # Safety
    ///
    /// Caller holds the region lock and has checked the size against
    /// [`Ring::max_message_size`].
    pub unsafe fn try_push(&self, message: &[u8]) -> bool {
        match self.stage_push(message) {
            Some(target) => {
                self.commit(target);
                true
            }
            None => false,
        }
    }

    /// Copies `message` into the free blocks after the tail and returns the
    /// cursors that publish it. Nothing is visible until those are committed.
    pub(crate) unsafe fn stage_push(&self, message: &[u8]) -> Option<Cursors> {
        let capacity = self.capacity();
        let needed = blocks_needed(message.len() as u32, self.block_size());
        debug_assert!(needed <= capacity);

        let current = self.cursors();
        if current.free < needed {
            return None;
        }
        let pos = self.write_wrapped(self.block_offset(current.tail), &encode_header(message.len() as u32));
        self.write_wrapped(pos, message);
        Some(Cursors {
            head: current.head,
            tail: (current.tail + needed) % capacity,
            free: current.free - needed,
        })
    }

    /// Hands the message at the head to `sink` and releases its blocks.
    /// Returns `Ok(false)` when the queue is empty. When `sink` refuses the
    /// message it stays queued.
    ///
    /// # Safety
    ///
    /// Caller holds the region lock.
    pub unsafe fn pop<S: ReceiveSink + ?Sized>(&self, sink: &mut S) -> Result<bool> {
        let capacity = self.capacity();
        let current = self.cursors();
        if current.free >= capacity {
            return Ok(false);
        }

        let start = self.block_offset(current.head);
        let size = self.read_header(start).ok_or_else(|| {
            QueueError::Corrupted(format!("message header at block {} is damaged", current.head))
        })?;
        let needed = blocks_needed(size, self.block_size());
        if needed > capacity - current.free {
            return Err(QueueError::Corrupted(format!(
                "message at block {} claims {} blocks but only {} are occupied",
                current.head,
                needed,
                capacity - current.free
            )));
        }

        sink.begin(size as usize)?;
        self.read_wrapped((start + MESSAGE_HEADER_SIZE as usize) % self.buffer_len(), size as usize, sink);

        self.commit(Cursors {
            head: (current.head + needed) % capacity,
            tail: current.tail,
            free: current.free + needed,
        });
        Ok(true)
    }

    /// Discards every pending message.
    ///
    /// # Safety
    ///
    /// Caller holds the region lock.
    pub unsafe fn clear(&self) {
        self.commit(Cursors {
            head: 0,
            tail: 0,
            free: self.capacity(),
        });
    }

    /// Brings the ring back to a consistent state after a lock holder died.
    ///
    /// # Safety
    ///
    /// Caller holds the region lock.
    pub unsafe fn recover(&self) -> Recovery {
        let state = self.state();
        let rolled_forward = state.pending.load(Ordering::SeqCst) != 0;
        if rolled_forward {
            let target = Cursors {
                head: state.journal[0].load(Ordering::SeqCst),
                tail: state.journal[1].load(Ordering::SeqCst),
                free: state.journal[2].load(Ordering::SeqCst),
            };
            self.apply(target);
            state.pending.store(0, Ordering::SeqCst);
        }

        match self.validate() {
            Ok(()) if rolled_forward => Recovery::RolledForward,
            Ok(()) => Recovery::Intact,
            Err(reason) => {
                log::debug!("discarding queue contents: {}", reason);
                self.clear();
                Recovery::Cleared
            }
        }
    }

    /// Walks the sealed message headers from head to tail and checks that
    /// they account for exactly the occupied blocks.
    pub(crate) unsafe fn validate(&self) -> std::result::Result<(), String> {
        let capacity = self.capacity();
        let Cursors { head, tail, free } = self.cursors();
        if head >= capacity || tail >= capacity || free > capacity {
            return Err(format!(
                "cursors out of range: head={} tail={} free={} capacity={}",
                head, tail, free, capacity
            ));
        }

        let used = capacity - free;
        if (head + used) % capacity != tail {
            return Err(format!("head={} plus {} used blocks does not reach tail={}", head, used, tail));
        }

        let mut walked = 0u32;
        let mut block = head;
        while walked < used {
            let size = self
                .read_header(self.block_offset(block))
                .ok_or_else(|| format!("unsealed message header at block {}", block))?;
            if size > self.max_message_size() {
                return Err(format!("message at block {} is {} bytes long", block, size));
            }
            let needed = blocks_needed(size, self.block_size());
            walked += needed;
            if walked > used {
                return Err(format!("message at block {} overruns the tail", block));
            }
            block = (block + needed) % capacity;
        }
        Ok(())
    }

    pub(crate) unsafe fn commit(&self, target: Cursors) {
        self.journal(target);
        self.apply(target);
        self.state().pending.store(0, Ordering::SeqCst);
    }

    pub(crate) unsafe fn journal(&self, target: Cursors) {
        let state = self.state();
        state.journal[0].store(target.head, Ordering::SeqCst);
        state.journal[1].store(target.tail, Ordering::SeqCst);
        state.journal[2].store(target.free, Ordering::SeqCst);
        state.pending.store(1, Ordering::SeqCst);
    }

    unsafe fn apply(&self, target: Cursors) {
        let state = self.state();
        state.head.store(target.head, Ordering::SeqCst);
        state.tail.store(target.tail, Ordering::SeqCst);
        state.free_blocks.store(target.free, Ordering::SeqCst);
    }

    unsafe fn read_header(&self, offset: usize) -> Option<u32> {
        // Blocks are at least as large as the header, so it never wraps.
        let mut bytes = [0u8; MESSAGE_HEADER_SIZE as usize];
        ptr::copy_nonoverlapping(self.data.as_ptr().add(offset), bytes.as_mut_ptr(), bytes.len());
        decode_header(&bytes)
    }

    unsafe fn write_wrapped(&self, pos: usize, bytes: &[u8]) -> usize {
        let len = self.buffer_len();
        let first = cmp::min(bytes.len(), len - pos);
        ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.as_ptr().add(pos), first);
        ptr::copy_nonoverlapping(bytes.as_ptr().add(first), self.data.as_ptr(), bytes.len() - first);
        (pos + bytes.len()) % len
    }

    unsafe fn read_wrapped<S: ReceiveSink + ?Sized>(&self, pos: usize, count: usize, sink: &mut S) {
        let len = self.buffer_len();
        let first = cmp::min(count, len - pos);
        sink.append(slice::from_raw_parts(self.data.as_ptr().add(pos), first));
        if count > first {
            sink.append(slice::from_raw_parts(self.data.as_ptr(), count - first));
        }
    }

    /// Raw access to the data blocks.
    #[cfg(test)]
    pub(crate) unsafe fn data_mut(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.data.as_ptr(), self.buffer_len())
    }
}
