//! Wire contract between the controller and the worker process.
//!
//! The worker is staged at a fixed path on every device and invoked over
//! SSH. It emits exactly one JSON object on stdout; everything on stderr is
//! human diagnostics. Parsers must tolerate missing and unknown fields.

use serde::{Deserialize, Serialize};

/// Where the worker binary is staged on remote hosts.
pub const WORKER_REMOTE_PATH: &str = "/tmp/lanpulse-worker";

/// Default data-plane port the sink listens on. Distinct from the SSH port.
pub const DEFAULT_WORKER_PORT: u16 = 8090;

/// The one-line JSON report a worker prints on stdout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default)]
    pub jitter_ms: f64,
    #[serde(default)]
    pub packet_loss: f64,
    #[serde(default)]
    pub bandwidth_mbps: f64,
}

impl WorkerReport {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            ..Default::default()
        }
    }
}

/// Command line that starts the sink on a target host.
pub fn sink_command(port: u16) -> String {
    format!("{} --mode sink --port {}", WORKER_REMOTE_PATH, port)
}

/// Command line that runs the throughput source against `addr:port`.
pub fn source_command(addr: &str, port: u16) -> String {
    format!("{} --mode source --target {}:{}", WORKER_REMOTE_PATH, addr, port)
}

/// Command line that runs the latency probe against `addr:port`.
pub fn probe_command(addr: &str, port: u16) -> String {
    format!("{} --mode probe --target {}:{}", WORKER_REMOTE_PATH, addr, port)
}

/// Best-effort command that frees the data-plane port on a target host.
pub fn kill_sink_command(port: u16) -> String {
    format!("fuser -k {port}/tcp || pkill -f 'mode sink --port {port}'")
}
