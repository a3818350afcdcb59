//! Stops a queue when the process receives a termination signal, so peers
//! blocked in `send` or `receive` return `Aborted` instead of waiting on a
//! process that is going away.

use std::thread::{self, JoinHandle};

use log::{error, info};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

use crate::errors::Result;
use crate::queue::Stopper;

pub const TERMINATION_SIGNALS: [i32; 4] = [SIGHUP, SIGINT, SIGQUIT, SIGTERM];

/// Keeps the signal thread alive. Dropping it unregisters the handlers.
pub struct SignalGuard {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

pub fn stop_on_signals(stopper: Stopper) -> Result<SignalGuard> {
    stop_on(stopper, &TERMINATION_SIGNALS)
}

pub fn stop_on(stopper: Stopper, signals: &[i32]) -> Result<SignalGuard> {
    let mut signals = Signals::new(signals)?;
    let handle = signals.handle();
    let thread = thread::Builder::new()
        .name("queue-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                info!("signal {} received, stopping message queue {:?}", signal, stopper.name());
                if let Err(e) = stopper.stop() {
                    error!("failed to stop message queue {:?}: {}", stopper.name(), e);
                }
            }
        })?;
    Ok(SignalGuard {
        handle,
        thread: Some(thread),
    })
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("signal thread panicked before shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{open_test_queue, unique_name};
    use crate::OperationResult;
    use std::time::{Duration, Instant};

    #[test]
    fn signal_stops_blocked_receiver() {
        let queue = open_test_queue(&unique_name("signal_stop"), 4, 64);
        // SIGUSR1 keeps the test runner's own handling out of the picture.
        let _guard = stop_on(queue.stopper().unwrap(), &[libc::SIGUSR1]).unwrap();

        let started = Instant::now();
        let raiser = thread::spawn(|| {
            thread::sleep(Duration::from_millis(100));
            signal_hook::low_level::raise(libc::SIGUSR1).unwrap();
        });

        let mut out = Vec::<u8>::new();
        assert_eq!(queue.receive(&mut out).unwrap(), OperationResult::Aborted);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!queue.is_running().unwrap());
        raiser.join().unwrap();
    }

    #[test]
    fn dropping_the_guard_ends_the_signal_thread() {
        let queue = open_test_queue(&unique_name("signal_drop"), 4, 64);
        let guard = stop_on(queue.stopper().unwrap(), &[libc::SIGUSR2]).unwrap();
        let started = Instant::now();
        drop(guard);
        assert!(started.elapsed() < Duration::from_secs(10));
        // No signal arrived, so the queue keeps running.
        assert!(queue.is_running().unwrap());
    }
}
