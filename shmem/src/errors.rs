use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors surfaced by queue operations.
///
/// Interruption by `stop()` is not an error: blocking calls report it as
/// [`OperationResult::Aborted`](crate::OperationResult::Aborted).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message queue is not open")]
    NotOpen,
    #[error("message queue handle is already attached to {0:?}")]
    AlreadyOpen(String),
    #[error("invalid message queue name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("message of {size} bytes exceeds the queue limit of {limit} bytes")]
    MessageTooLarge { size: usize, limit: u32 },
    #[error("receive buffer of {capacity} bytes is too small for a message of {size} bytes")]
    BufferTooSmall { size: usize, capacity: usize },

    #[error("message queue {0:?} already exists")]
    AlreadyExists(String),
    #[error("message queue {0:?} not found")]
    NotFound(String),

    #[error("message queue is full")]
    QueueFull,

    #[error("message queue is corrupted: {0}")]
    Corrupted(String),

    #[error("shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    #[error("{op} failed: {source}")]
    System {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] confy::ConfyError),
}

impl QueueError {
    /// Wraps an error code returned by a pthread function.
    pub(crate) fn system(op: &'static str, code: i32) -> QueueError {
        QueueError::System {
            op,
            source: io::Error::from_raw_os_error(code),
        }
    }
}
