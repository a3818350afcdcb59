use std::convert::TryInto;
use std::error::Error;
use std::time::Instant;

use clap::Parser;
use log::{info, warn};
use serde_derive::{Deserialize, Serialize};

use reliable_shmem_queue::shutdown;
use reliable_shmem_queue::{OperationResult, QueueConfig, ReliableMessageQueue};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "reliable-queue.toml")]
    config: String,
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
    info!("receiving from {:?}", queue.name()?);
    run(&queue)
}

fn run(queue: &ReliableMessageQueue) -> Result<(), Box<dyn Error>> {
    let mut message = Vec::new();
    let mut expected = 0u64;

    let start = Instant::now();
    loop {
        message.clear();
        if queue.receive(&mut message)? == OperationResult::Aborted {
            warn!("queue stopped after {} messages", expected);
            break;
        }
        if message.is_empty() {
            println!("\nEnd marker after {} messages", expected);
            break;
        }
        let seq = message
            .get(0..8)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| format!("message {} is only {} bytes long", expected, message.len()))?;
        if seq != expected {
            return Err(format!("expected message {} but received {}", expected, seq).into());
        }
        expected += 1;
        if expected % 500_000 == 0 {
            eprint!("\rTotal {} ops (current value: {})", expected, seq);
        }
    }

    let duration = start.elapsed();
    let iops = (expected as f64) / duration.as_secs_f64().max(f64::EPSILON);
    println!(
        "\n{:#?}K messages received/s. Total time: {:#?}",
        (iops / 1000f64) as u64,
        duration
    );
    Ok(())
}
