//! Worker process entry point.
//!
//! Started by a `Launcher` in process mode. It receives everything it needs on the command line:
//! the staging directory of the result channel and how long to compute for.

use std::{process::ExitCode, time::Duration};

use clap::Parser;
use longtask::{worker, ChannelHandle, WorkerConfig};

#[derive(Debug, Parser)]
#[command(name = "longtask-worker", about = "Compute for a while and hand back one result")]
struct Args {
    /// Staging directory of the result channel to write into.
    #[arg(long)]
    channel: ChannelHandle,

    /// How long to compute for, in seconds.
    #[arg(long, default_value = "3", value_parser = worker::parse_duration)]
    duration: Duration,

    /// Crash with an arithmetic fault instead of producing a result.
    #[arg(long)]
    force_error: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = WorkerConfig::new(args.duration).force_error(args.force_error);

    match worker::run(&config, &args.channel) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(worker::WRITE_FAILURE_EXIT_CODE as u8)
        }
    }
}
