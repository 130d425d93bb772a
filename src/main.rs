use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bitdb::config::Config;
use bitdb::daemon;

/// A persistent key-value store daemon backed by an append-only log.
#[derive(Parser, Debug)]
#[command(name = "bitdbd", about = "Bitcask-style key-value store daemon", version)]
struct Cli {
    /// Directory holding segment files (created if missing)
    #[arg(short, long, default_value = "db")]
    dir: PathBuf,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = bitdb::config::DEFAULT_PORT)]
    port: u16,

    /// Number of worker threads servicing client connections
    #[arg(short, long, default_value_t = bitdb::config::DEFAULT_WORKERS)]
    workers: usize,

    /// Maximum size in bytes before a segment rotates
    #[arg(long, default_value_t = bitdb::config::DEFAULT_MAX_SEGMENT_SIZE)]
    max_segment_size: u64,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let config = Config {
        dir: cli.dir,
        port: cli.port,
        workers: cli.workers,
        max_segment_size: cli.max_segment_size,
    };

    match daemon::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("daemon exited with error: {e}");
            ExitCode::FAILURE
        }
    }
}
