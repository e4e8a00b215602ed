//! Measurement routines behind the worker binary's three modes.
//!
//! Everything here is deliberately blocking `std::net`: the worker is a
//! short-lived single-purpose process and precise wall-clock timing matters
//! more than concurrency.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info};

use crate::protocol::WorkerReport;

/// Chunk size for both the sink's reads and the source's writes.
const CHUNK_SIZE: usize = 32 * 1024;

/// How long the throughput source transmits.
const SOURCE_DURATION: Duration = Duration::from_secs(10);

const SOURCE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Run the TCP sink: accept connections and discard everything until killed.
pub fn run_sink(port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    info!(port, "sink listening");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                thread::spawn(move || discard_stream(stream));
            }
            Err(e) => error!("sink accept error: {}", e),
        }
    }
    Ok(())
}

fn discard_stream(mut stream: TcpStream) {
    if let Ok(peer) = stream.peer_addr() {
        info!(%peer, "sink accepted connection");
    }
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// Run the throughput source against `target` ("host:port").
pub fn run_source(target: &str) -> WorkerReport {
    transfer(target, SOURCE_DURATION)
}

fn transfer(target: &str, duration: Duration) -> WorkerReport {
    let addr = match resolve(target) {
        Ok(addr) => addr,
        Err(e) => return WorkerReport::failed(format!("resolve error: {}", e)),
    };

    info!(%addr, "source connecting");
    let start = Instant::now();
    let mut stream = match TcpStream::connect_timeout(&addr, SOURCE_CONNECT_TIMEOUT) {
        Ok(s) => s,
        Err(e) => {
            error!("source dial error: {}", e);
            return WorkerReport::failed(format!("dial error: {}", e));
        }
    };

    info!("source connected, starting data transfer");

    let buf = [0u8; CHUNK_SIZE];
    let deadline = start + duration;
    let mut total_bytes: u64 = 0;

    loop {
        // Write timeouts are per call, so shrink each one toward the
        // deadline: a stalled peer cannot hold the transfer past its window.
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let _ = stream.set_write_timeout(Some(remaining));

        match stream.write(&buf) {
            Ok(n) => total_bytes += n as u64,
            Err(e) => {
                error!("source write error: {}", e);
                break;
            }
        }
    }

    let elapsed = start.elapsed().as_secs_f64();
    let mbps = (total_bytes as f64 * 8.0 / 1_000_000.0) / elapsed;
    info!(total_bytes, mbps, "source finished");

    WorkerReport {
        success: true,
        bandwidth_mbps: mbps,
        ..Default::default()
    }
}

/// Run the latency probe against `target` ("host:port").
///
/// Latency is the interval from immediately before the dial to the
/// connection being established. The probe is single-shot, so jitter and
/// packet loss stay at 0.
pub fn run_probe(target: &str) -> WorkerReport {
    let addr = match resolve(target) {
        Ok(addr) => addr,
        Err(e) => return WorkerReport::failed(format!("resolve error: {}", e)),
    };

    let start = Instant::now();
    match TcpStream::connect_timeout(&addr, PROBE_CONNECT_TIMEOUT) {
        Ok(_stream) => {
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
            info!(latency_ms, "probe success");
            WorkerReport {
                success: true,
                latency_ms,
                ..Default::default()
            }
        }
        Err(e) => {
            error!("probe error: {}", e);
            WorkerReport::failed(e.to_string())
        }
    }
}

fn resolve(target: &str) -> std::io::Result<SocketAddr> {
    target.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {}", target),
        )
    })
}
