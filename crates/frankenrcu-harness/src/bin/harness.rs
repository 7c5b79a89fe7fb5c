//! CLI entry point for the demonstration workload.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use frankenrcu_harness::{LogEmitter, Scenario, run};

#[derive(Parser, Debug)]
#[command(
    name = "harness",
    about = "Run the frankenrcu reader/writer demonstration workload"
)]
struct Args {
    /// Number of reader threads.
    #[arg(long, default_value_t = 10)]
    readers: usize,

    /// Number of writer threads.
    #[arg(long, default_value_t = 3)]
    writers: usize,

    /// Read-side iterations per reader.
    #[arg(long, default_value_t = 1000)]
    reader_iters: u64,

    /// Publish+synchronize iterations per writer.
    #[arg(long, default_value_t = 1000)]
    writer_iters: u64,

    /// Microseconds to hold each read-side critical section.
    #[arg(long, default_value_t = 0)]
    reader_hold_us: u64,

    /// Write JSONL run records to this file instead of stdout.
    #[arg(long)]
    log: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let emitter = match &args.log {
        Some(path) => match LogEmitter::to_file(path) {
            Ok(emitter) => emitter,
            Err(err) => {
                eprintln!("harness: cannot open log {}: {err}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => LogEmitter::stdout(),
    };

    let scenario = Scenario {
        readers: args.readers,
        writers: args.writers,
        reader_iters: args.reader_iters,
        writer_iters: args.writer_iters,
        reader_hold: Duration::from_micros(args.reader_hold_us),
    };

    match run(&scenario, &Arc::new(emitter)) {
        Ok(summary) => {
            eprintln!(
                "harness: {} readers / {} writers done in {:?}; final value {}, {} grace periods",
                args.readers,
                args.writers,
                summary.elapsed,
                summary.final_value,
                summary.grace_periods
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("harness: {err}");
            ExitCode::FAILURE
        }
    }
}
