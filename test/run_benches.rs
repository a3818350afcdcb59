use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{self, Command};

use log::{info, warn};
use tempfile::Builder;

use reliable_shmem_queue::{QueueConfig, ReliableMessageQueue};

const MESSAGES: u64 = 200_000;

fn bench(cargo: &str, package: &str, config: &Path) -> Command {
    let mut cmd = Command::new(cargo);
    cmd.arg("run")
        .arg("--release")
        .arg("--package")
        .arg(package)
        .arg("--")
        .arg("--config")
        .arg(config);
    cmd
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let temp_dir = Builder::new().prefix("rmq_bench").tempdir()?;
    let config_file_path: PathBuf = temp_dir.path().join("bench_config.toml");
    let name = format!("bench_queue_{}", process::id());

    let config_content = format!(
        "[queue]\n\
        name = \"{}\"\n\
        capacity = 64\n\
        block_size = 128\n\
        overflow_policy = \"block\"\n\
        open_mode = \"open_or_create\"\n",
        name
    );
    File::create(&config_file_path)?.write_all(config_content.as_bytes())?;
    info!("benchmark config written to {}", config_file_path.display());

    // Hold a handle for the whole run so the queue outlives whichever bench exits first.
    let cfg = QueueConfig::builder().name(name.as_str()).capacity(64).block_size(128).build()?;
    let keeper = ReliableMessageQueue::from_config(&cfg)?;

    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    println!("--- Starting receiver_bench ---");
    let mut receiver = bench(&cargo, "receiver_bench", &config_file_path).spawn()?;

    println!("--- Running sender_bench ---");
    let sender_output = bench(&cargo, "sender_bench", &config_file_path)
        .arg("--count")
        .arg(MESSAGES.to_string())
        .output()?;
    println!("sender_bench stdout:\n{}", String::from_utf8_lossy(&sender_output.stdout));
    println!("sender_bench stderr:\n{}", String::from_utf8_lossy(&sender_output.stderr));

    if !sender_output.status.success() {
        // Unblock the receiver before reporting.
        keeper.stop()?;
        let _ = receiver.wait();
        ReliableMessageQueue::remove(&name)?;
        return Err(format!("sender_bench failed with status: {}", sender_output.status).into());
    }

    let receiver_status = receiver.wait()?;
    drop(keeper);
    if ReliableMessageQueue::remove(&name)? {
        warn!("queue {:?} was still linked after every handle closed", name);
    }

    if !receiver_status.success() {
        return Err(format!("receiver_bench failed with status: {}", receiver_status).into());
    }
    println!("\nBoth benches completed successfully.");
    Ok(())
}
