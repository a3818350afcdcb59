use std::collections::VecDeque;

use crate::errors::{QueueError, Result};

/// Destination for a dequeued message.
///
/// `begin` is called once with the exact message size before any byte is
/// delivered; returning an error leaves the message in the queue. The bytes
/// then arrive through one or two `append` calls (two when the message wraps
/// around the end of the buffer).
pub trait ReceiveSink {
    fn begin(&mut self, size: usize) -> Result<()>;
    fn append(&mut self, bytes: &[u8]);
}

/// Appends the message to the end of the vector.
impl ReceiveSink for Vec<u8> {
    fn begin(&mut self, size: usize) -> Result<()> {
        self.reserve(size);
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl ReceiveSink for VecDeque<u8> {
    fn begin(&mut self, size: usize) -> Result<()> {
        self.reserve(size);
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) {
        self.extend(bytes.iter().copied());
    }
}

impl<S: ReceiveSink + ?Sized> ReceiveSink for &mut S {
    fn begin(&mut self, size: usize) -> Result<()> {
        (**self).begin(size)
    }

    fn append(&mut self, bytes: &[u8]) {
        (**self).append(bytes)
    }
}

/// A caller-owned buffer receiving one message from its start.
pub struct FixedBuffer<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> FixedBuffer<'a> {
    pub fn new(buf: &'a mut [u8]) -> FixedBuffer<'a> {
        FixedBuffer { buf, len: 0 }
    }

    /// Size of the last received message.
    pub fn message_size(&self) -> usize {
        self.len
    }

    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl ReceiveSink for FixedBuffer<'_> {
    fn begin(&mut self, size: usize) -> Result<()> {
        if size > self.buf.len() {
            return Err(QueueError::BufferTooSmall {
                size,
                capacity: self.buf.len(),
            });
        }
        self.len = 0;
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }
}
