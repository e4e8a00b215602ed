//! lanpulse-worker: the measurement process staged on remote hosts.
//!
//! Stdout carries exactly one JSON report line; all diagnostics go to
//! stderr so the controller can parse the result unambiguously.

use std::io::Write;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use lanpulse::protocol::{WorkerReport, DEFAULT_WORKER_PORT};
use lanpulse::worker;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// TCP black hole: accept and discard until killed.
    Sink,
    /// Throughput source: transmit to the sink for a fixed window.
    Source,
    /// Latency probe: time a single TCP connect.
    Probe,
}

#[derive(Debug, Parser)]
#[command(name = "lanpulse-worker", about = "lanpulse measurement worker")]
struct Args {
    /// Operation mode.
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Target address ("host:port") for source and probe modes.
    #[arg(long)]
    target: Option<String>,

    /// Port to listen on in sink mode.
    #[arg(long, default_value_t = DEFAULT_WORKER_PORT)]
    port: u16,
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    match args.mode {
        Some(Mode::Sink) => {
            if let Err(e) = worker::run_sink(args.port) {
                eprintln!("worker error listening: {}", e);
                std::process::exit(1);
            }
        }
        Some(Mode::Source) => emit(worker::run_source(&require_target(args.target))),
        Some(Mode::Probe) => emit(worker::run_probe(&require_target(args.target))),
        None => {
            eprintln!("usage: lanpulse-worker --mode [sink|source|probe] ...");
            std::process::exit(1);
        }
    }
}

fn require_target(target: Option<String>) -> String {
    match target {
        Some(t) if !t.is_empty() => t,
        _ => {
            eprintln!("--target is required for source and probe modes");
            std::process::exit(1);
        }
    }
}

/// Print the report and give the SSH transport a moment to flush.
fn emit(report: WorkerReport) {
    match serde_json::to_string(&report) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("worker failed to encode report: {}", e),
    }
    let _ = std::io::stdout().flush();
    std::thread::sleep(Duration::from_millis(100));
}
