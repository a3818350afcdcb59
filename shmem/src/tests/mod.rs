use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{OverflowPolicy, Permissions, ReliableMessageQueue};


/// A queue name no other test (or test process) uses.
pub(crate) fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "rmq_{}_{}_{}",
        prefix,
        process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

pub(crate) fn open_test_queue(name: &str, capacity: u32, block_size: u32) -> ReliableMessageQueue {
    ReliableMessageQueue::create(
        name,
        capacity,
        block_size,
        Permissions::default(),
        OverflowPolicy::BlockOnOverflow,
    )
    .expect("failed to create test queue")
}
