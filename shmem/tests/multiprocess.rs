//! Cross-process behaviour. The test binary re-executes itself to run the
//! `child_*` tests in a separate process; without the queue variable in the
//! environment those tests return immediately.

use std::convert::TryInto;
use std::env;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{self, Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use reliable_shmem_queue::{
    OperationResult, OverflowPolicy, Permissions, QueueError, ReceiveSink, ReliableMessageQueue,
};

const QUEUE_VAR: &str = "RMQ_MULTIPROCESS_QUEUE";
const MESSAGES: u64 = 5_000;
const INSIDE_LOCK: &str = "ready:inside-lock";
const WAITING: &str = "ready:waiting";

fn unique_name(prefix: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!("rmq_mp_{}_{}_{}", prefix, process::id(), COUNTER.fetch_add(1, Ordering::SeqCst))
}

fn spawn_child(test: &str, queue: &str) -> Child {
    Command::new(env::current_exe().expect("no test executable"))
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(QUEUE_VAR, queue)
        .spawn()
        .expect("failed to spawn child test process")
}

/// Spawns a child whose stdout is read until it prints `marker`.
fn spawn_child_until(test: &str, queue: &str, marker: &str) -> Child {
    let mut child = Command::new(env::current_exe().expect("no test executable"))
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(QUEUE_VAR, queue)
        .stdout(Stdio::piped())
        .spawn()
        .expect("failed to spawn child test process");
    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
    loop {
        match lines.next() {
            Some(Ok(line)) if line.contains(marker) => break,
            Some(Ok(_)) => {}
            other => panic!("child exited before printing {:?}: {:?}", marker, other.map(|l| l.ok())),
        }
    }
    child
}

fn announce(marker: &str) {
    println!("\n{}", marker);
    io::stdout().flush().unwrap();
}

fn create(name: &str, capacity: u32, block_size: u32) -> ReliableMessageQueue {
    ReliableMessageQueue::create(
        name,
        capacity,
        block_size,
        Permissions::default(),
        OverflowPolicy::BlockOnOverflow,
    )
    .unwrap()
}

#[test]
fn messages_cross_process_boundaries_in_order() {
    let name = unique_name("fifo");
    let queue = create(&name, 8, 64);
    let mut child = spawn_child("child_sends_sequence", &name);

    let mut expected = 0u64;
    loop {
        let message = queue.receive_vec().unwrap().expect("queue stopped");
        if message.is_empty() {
            break;
        }
        let seq = u64::from_le_bytes(message[0..8].try_into().unwrap());
        assert_eq!(seq, expected);
        assert_eq!(message.len(), 8 + (seq % 100) as usize);
        expected += 1;
    }
    assert_eq!(expected, MESSAGES);
    assert!(child.wait().unwrap().success());
}

#[test]
fn child_sends_sequence() {
    let name = match env::var(QUEUE_VAR) {
        Ok(name) => name,
        Err(_) => return,
    };
    let queue = ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow).unwrap();
    for seq in 0..MESSAGES {
        let mut message = seq.to_le_bytes().to_vec();
        message.resize(8 + (seq % 100) as usize, 0xab);
        assert_eq!(queue.send(&message).unwrap(), OperationResult::Succeeded);
    }
    assert_eq!(queue.send(&[]).unwrap(), OperationResult::Succeeded);
}

#[test]
fn second_process_adopts_existing_parameters() {
    let name = unique_name("adopt");
    let queue = create(&name, 8, 64);
    let mut child = spawn_child("child_reattaches_with_other_parameters", &name);

    assert_eq!(queue.receive_vec().unwrap(), Some(b"8x64".to_vec()));
    assert!(child.wait().unwrap().success());
}

#[test]
fn child_reattaches_with_other_parameters() {
    let name = match env::var(QUEUE_VAR) {
        Ok(name) => name,
        Err(_) => return,
    };
    let queue =
        ReliableMessageQueue::open_or_create(&name, 16, 256, Permissions::default(), OverflowPolicy::ThrowOnOverflow)
            .unwrap();
    let geometry = format!("{}x{}", queue.capacity().unwrap(), queue.block_size().unwrap());
    queue.send(geometry.as_bytes()).unwrap();
}

#[test]
fn stop_in_one_process_aborts_receiver_in_another() {
    let name = unique_name("stop");
    let queue = create(&name, 4, 64);
    let mut child = spawn_child("child_blocks_until_stopped", &name);

    // The child either is already blocked or attaches to a stopped queue;
    // both end in Aborted.
    thread::sleep(Duration::from_millis(300));
    queue.stop().unwrap();
    assert!(child.wait().unwrap().success());
}

#[test]
fn child_blocks_until_stopped() {
    let name = match env::var(QUEUE_VAR) {
        Ok(name) => name,
        Err(_) => return,
    };
    let queue = ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow).unwrap();
    assert_eq!(queue.receive(&mut Vec::<u8>::new()).unwrap(), OperationResult::Aborted);
}

#[test]
fn killed_process_leaves_queue_usable_and_removable() {
    let name = unique_name("killed");
    let mut queue = create(&name, 4, 64);
    let mut child = spawn_child("child_attaches_and_sleeps", &name);

    assert_eq!(queue.receive_vec().unwrap(), Some(b"attached".to_vec()));
    child.kill().unwrap();
    child.wait().unwrap();

    queue.send(b"still works").unwrap();
    assert_eq!(queue.receive_vec().unwrap(), Some(b"still works".to_vec()));

    // The killed handle is never released, so closing ours does not destroy the queue.
    queue.close();
    drop(ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow).unwrap());

    assert!(ReliableMessageQueue::remove(&name).unwrap());
    assert!(matches!(
        ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow),
        Err(QueueError::NotFound(_))
    ));
    assert!(!ReliableMessageQueue::remove(&name).unwrap());
}

#[test]
fn child_attaches_and_sleeps() {
    let name = match env::var(QUEUE_VAR) {
        Ok(name) => name,
        Err(_) => return,
    };
    let queue = ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow).unwrap();
    queue.send(b"attached").unwrap();
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

/// Parks forever once handed a message, keeping the queue lock held.
struct ParkingSink;

impl ReceiveSink for ParkingSink {
    fn begin(&mut self, _size: usize) -> reliable_shmem_queue::Result<()> {
        announce(INSIDE_LOCK);
        loop {
            thread::sleep(Duration::from_secs(1));
        }
    }

    fn append(&mut self, _bytes: &[u8]) {}
}

#[test]
fn process_killed_while_holding_the_lock_does_not_wedge_peers() {
    let name = unique_name("held_lock");
    let queue = create(&name, 2, 64);
    queue.send(b"in flight").unwrap();

    let mut child = spawn_child_until("child_parks_inside_receive", &name, INSIDE_LOCK);
    child.kill().unwrap();
    child.wait().unwrap();

    // The dead holder never committed its receive, so the message is still there.
    assert_eq!(queue.receive_vec().unwrap(), Some(b"in flight".to_vec()));

    // A blocking send on a full queue completes once a peer makes room.
    let full = vec![7u8; queue.max_message_size().unwrap() as usize];
    assert_eq!(queue.send(&full).unwrap(), OperationResult::Succeeded);
    let sender = ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow).unwrap();
    let (tx, rx) = mpsc::channel();
    let blocked = thread::spawn(move || tx.send(sender.send(b"after").unwrap()).unwrap());
    thread::sleep(Duration::from_millis(100));
    assert_eq!(queue.receive_vec().unwrap(), Some(full));
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)), Ok(OperationResult::Succeeded));
    blocked.join().unwrap();
    assert_eq!(queue.receive_vec().unwrap(), Some(b"after".to_vec()));

    // The killed child's attachment is never released.
    drop(queue);
    assert!(ReliableMessageQueue::remove(&name).unwrap());
}

#[test]
fn child_parks_inside_receive() {
    let name = match env::var(QUEUE_VAR) {
        Ok(name) => name,
        Err(_) => return,
    };
    let queue = ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow).unwrap();
    queue.receive(&mut ParkingSink).unwrap();
}

#[test]
fn process_killed_while_waiting_does_not_swallow_wakeups() {
    let name = unique_name("dead_waiter");
    let queue = create(&name, 4, 64);

    let mut child = spawn_child_until("child_waits_in_receive", &name, WAITING);
    // Let the child get into the condition wait.
    thread::sleep(Duration::from_millis(300));
    child.kill().unwrap();
    child.wait().unwrap();

    let receiver = ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow).unwrap();
    let (tx, rx) = mpsc::channel();
    let waiting = thread::spawn(move || tx.send(receiver.receive_vec().unwrap()).unwrap());
    thread::sleep(Duration::from_millis(100));

    assert_eq!(queue.send(b"wake up").unwrap(), OperationResult::Succeeded);
    let received = rx.recv_timeout(Duration::from_secs(10));
    queue.stop().unwrap();
    waiting.join().unwrap();
    assert_eq!(received, Ok(Some(b"wake up".to_vec())));

    drop(queue);
    assert!(ReliableMessageQueue::remove(&name).unwrap());
}

#[test]
fn child_waits_in_receive() {
    let name = match env::var(QUEUE_VAR) {
        Ok(name) => name,
        Err(_) => return,
    };
    let queue = ReliableMessageQueue::open(&name, OverflowPolicy::BlockOnOverflow).unwrap();
    announce(WAITING);
    queue.receive_vec().unwrap();
}
