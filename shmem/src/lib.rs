//! A named, bounded, crash-tolerant message queue shared between processes.
//!
//! Messages are opaque byte strings packed into runs of fixed-size blocks of
//! a circular buffer that lives in shared memory. Any number of processes can
//! send and receive through handles opened by name; a robust process-shared
//! lock keeps the queue usable when one of them dies mid-operation.

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
compile_error!("reliable_shmem_queue needs POSIX robust process-shared mutexes (Linux or FreeBSD)");

mod errors;
pub mod config;
mod queue;
mod region;
mod ring;
pub mod shutdown;
mod sink;
mod sync;

#[cfg(test)]
mod tests;

pub use config::{QueueConfig, QueueConfigBuilder};
pub use errors::{QueueError, Result};
pub use queue::{OpenMode, OperationResult, OverflowPolicy, ReliableMessageQueue, Stopper};
pub use region::{Permissions, MAX_NAME_LEN};
pub use ring::MESSAGE_HEADER_SIZE;
pub use sink::{FixedBuffer, ReceiveSink};

/// Number of blocks a message of `size` bytes occupies.
pub fn blocks_needed(size: u32, block_size: u32) -> u32 {
    ring::blocks_needed(size, block_size)
}
