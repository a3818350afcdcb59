use std::cmp;
use std::error::Error;
use std::time::Instant;

use clap::{self, Parser};
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};

use reliable_shmem_queue::shutdown;
use reliable_shmem_queue::{OperationResult, QueueConfig, ReliableMessageQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "reliable-queue.toml")]
    config: String,
    #[clap(short = 'n', long = "count", default_value = "1000000")]
    count: u64,
    /// Bytes per message; the first eight carry the sequence number.
    #[clap(short = 's', long = "message-size", default_value = "64")]
    message_size: usize,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
struct BenchConfig {
    queue: QueueConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    cfg.queue.validate()?;

    let queue = ReliableMessageQueue::from_config(&cfg.queue)?;
    let _signals = shutdown::stop_on_signals(queue.stopper()?)?;
    info!(
        "sending {} messages of {} bytes to {:?} ({} blocks of {} bytes)",
        opts.count,
        opts.message_size,
        queue.name()?,
        queue.capacity()?,
        queue.block_size()?
    );
    run(&queue, &opts)
}

fn run(queue: &ReliableMessageQueue, opts: &Opts) -> Result<(), Box<dyn Error>> {
    let size = cmp::max(opts.message_size, 8);
    let mut buff = vec![0u8; size];

    let start = Instant::now();
    let mut sent = 0u64;
    while sent < opts.count {
        buff[0..8].copy_from_slice(&sent.to_le_bytes());
        if queue.send(&buff)? == OperationResult::Aborted {
            warn!("queue stopped after {} messages", sent);
            break;
        }
        sent += 1;
        if sent % 500_000 == 0 {
            eprint!("\rTotal {} ops", sent);
        }
    }
    // An empty message tells the receiver we are done.
    if sent == opts.count && queue.send(&[])? == OperationResult::Aborted {
        warn!("queue stopped before the end marker was sent");
    }

    let duration = start.elapsed();
    let iops = (sent as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K messages sent/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
