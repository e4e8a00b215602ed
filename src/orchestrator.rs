//! Measurement choreography.
//!
//! Turns "measure from S to T" into a staged remote execution: open SSH
//! control channels to both devices, make sure the worker binary is in
//! place, bring up a transient TCP sink on the target, drive the source (or
//! probe) on the origin, tear the sink down, and parse the worker's JSON
//! report into a [`Measurement`].
//!
//! The orchestrator does not constrain concurrency itself; the task queue's
//! single consumer is what keeps two tests from colliding on the data port.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task;
use tracing::{info, warn};

use crate::db::{Device, Measurement, TestKind};
use crate::protocol::{self, WorkerReport, WORKER_REMOTE_PATH};
use crate::shell::{ShellClient, ShellError};

/// Which side of a measurement an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Source,
    Target,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Source => f.write_str("source"),
            Endpoint::Target => f.write_str("target"),
        }
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("failed to connect to {which} {host}: {detail}")]
    Unreachable {
        which: Endpoint,
        host: String,
        detail: String,
    },
    #[error("failed to deploy worker to {which}: {detail}")]
    DeployFailed { which: Endpoint, detail: String },
    #[error("worker command on {which} failed (exit {exit}); stdout: {stdout}; stderr: {stderr}")]
    RemoteCommandFailed {
        which: Endpoint,
        stdout: String,
        stderr: String,
        exit: i32,
    },
    #[error("no parseable JSON in worker output; stdout: {stdout}; stderr: {stderr}")]
    Unparseable { stdout: String, stderr: String },
    #[error("worker reported failure: {message}")]
    WorkerReported { message: String },
}

/// Drives measurements between device pairs.
pub struct Orchestrator {
    /// Controller-local path of the worker binary to stage.
    worker_path: PathBuf,
    /// Data-plane port the sink listens on (process-wide constant).
    worker_port: u16,
    /// Private key for SSH authentication.
    key_path: PathBuf,
}

impl Orchestrator {
    pub fn new(worker_path: PathBuf, worker_port: u16, key_path: PathBuf) -> Self {
        Self {
            worker_path,
            worker_port,
            key_path,
        }
    }

    /// Measure TCP-connect latency from `source` to `target`.
    pub async fn run_ping(
        &self,
        source: &Device,
        target: &Device,
    ) -> Result<Measurement, OrchestratorError> {
        self.run_test(TestKind::Ping, source, target).await
    }

    /// Measure TCP throughput from `source` to `target`.
    pub async fn run_speed(
        &self,
        source: &Device,
        target: &Device,
    ) -> Result<Measurement, OrchestratorError> {
        self.run_test(TestKind::Speed, source, target).await
    }

    async fn run_test(
        &self,
        kind: TestKind,
        source: &Device,
        target: &Device,
    ) -> Result<Measurement, OrchestratorError> {
        info!(%kind, source = %source.name, target = %target.name, "starting measurement");

        // Control channels to both ends, in parallel.
        let (source_client, target_client) = tokio::try_join!(
            self.connect(Endpoint::Source, source),
            self.connect(Endpoint::Target, target),
        )?;
        let source_client = Arc::new(source_client);
        let target_client = Arc::new(target_client);

        self.stage_worker(Endpoint::Source, source_client.clone()).await?;
        self.stage_worker(Endpoint::Target, target_client.clone()).await?;

        // Free the data-plane port from any stale sink. Errors don't matter;
        // the port may simply be unused.
        let kill_cmd = protocol::kill_sink_command(self.worker_port);
        {
            let client = target_client.clone();
            let cmd = kill_cmd.clone();
            let _ = task::spawn_blocking(move || client.run_ignore_status(&cmd)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        // The sink runs on its own SSH connection: the blocking read on that
        // channel is what keeps the remote process alive, and the control
        // session must stay free for the teardown kill.
        let sink_client = self.connect(Endpoint::Target, target).await?;
        let sink_cmd = protocol::sink_command(self.worker_port);
        let sink_task = task::spawn_blocking(move || {
            let _ = sink_client.run_ignore_status(&sink_cmd);
            sink_client.close();
        });
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Data-plane address: explicit IP wins over the control hostname.
        let data_addr = if target.ip.is_empty() {
            target.hostname.clone()
        } else {
            target.ip.clone()
        };

        let run_cmd = match kind {
            TestKind::Ping => protocol::probe_command(&data_addr, self.worker_port),
            TestKind::Speed => protocol::source_command(&data_addr, self.worker_port),
        };
        let run_result = {
            let client = source_client.clone();
            let cmd = run_cmd.clone();
            task::spawn_blocking(move || client.run(&cmd)).await
        };

        // Teardown happens regardless of the run outcome.
        {
            let client = target_client.clone();
            let cmd = kill_cmd.clone();
            let _ = task::spawn_blocking(move || client.run_ignore_status(&cmd)).await;
        }
        if tokio::time::timeout(Duration::from_secs(5), sink_task).await.is_err() {
            warn!(target = %target.name, "sink session did not exit after teardown");
        }
        source_client.close();
        target_client.close();

        let output = match run_result {
            Ok(Ok(output)) => output,
            Ok(Err(ShellError::CommandFailed { stdout, stderr, exit })) => {
                return Err(OrchestratorError::RemoteCommandFailed {
                    which: Endpoint::Source,
                    stdout,
                    stderr,
                    exit,
                })
            }
            Ok(Err(e)) => {
                return Err(OrchestratorError::RemoteCommandFailed {
                    which: Endpoint::Source,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    exit: -1,
                })
            }
            Err(e) => {
                return Err(OrchestratorError::RemoteCommandFailed {
                    which: Endpoint::Source,
                    stdout: String::new(),
                    stderr: format!("worker task aborted: {}", e),
                    exit: -1,
                })
            }
        };

        let report = parse_worker_output(&output.stdout, &output.stderr, self.worker_port)?;
        let measurement = to_measurement(kind, source.id, target.id, &report);
        info!(%kind, source = %source.name, target = %target.name,
              latency_ms = measurement.latency_ms, bandwidth_mbps = measurement.bandwidth_mbps,
              "measurement complete");
        Ok(measurement)
    }

    async fn connect(
        &self,
        which: Endpoint,
        device: &Device,
    ) -> Result<ShellClient, OrchestratorError> {
        let user = device.ssh_user.clone();
        let host = device.hostname.clone();
        let port = device.ssh_port;
        let key_path = self.key_path.clone();

        let result = task::spawn_blocking(move || ShellClient::connect(&user, &host, port, &key_path))
            .await
            .map_err(|e| OrchestratorError::Unreachable {
                which,
                host: device.hostname.clone(),
                detail: format!("connect task aborted: {}", e),
            })?;

        result.map_err(|e| OrchestratorError::Unreachable {
            which,
            host: device.hostname.clone(),
            detail: e.to_string(),
        })
    }

    /// Upload the worker binary unless it is already staged.
    async fn stage_worker(
        &self,
        which: Endpoint,
        client: Arc<ShellClient>,
    ) -> Result<(), OrchestratorError> {
        let worker_path = self.worker_path.clone();

        let result = task::spawn_blocking(move || -> Result<(), ShellError> {
            if client.exists(WORKER_REMOTE_PATH)? {
                return Ok(());
            }
            let data = std::fs::read(&worker_path)?;
            client.upload(&data, WORKER_REMOTE_PATH, 0o755)
        })
        .await
        .map_err(|e| OrchestratorError::DeployFailed {
            which,
            detail: format!("deploy task aborted: {}", e),
        })?;

        result.map_err(|e| OrchestratorError::DeployFailed {
            which,
            detail: e.to_string(),
        })
    }
}

/// Map a successful worker report onto the measurement record.
fn to_measurement(kind: TestKind, source_id: i64, target_id: i64, report: &WorkerReport) -> Measurement {
    match kind {
        TestKind::Ping => Measurement::ping(
            source_id,
            target_id,
            report.latency_ms,
            report.jitter_ms,
            report.packet_loss,
        ),
        TestKind::Speed => Measurement::speed(source_id, target_id, report.bandwidth_mbps),
    }
}

/// Extract the JSON report from worker stdout.
///
/// SSH banners, shell profiles, and the worker's own preamble may precede
/// the report, so parsing starts at the first `{`.
fn parse_worker_output(
    stdout: &str,
    stderr: &str,
    worker_port: u16,
) -> Result<WorkerReport, OrchestratorError> {
    let json_start = stdout.find('{').ok_or_else(|| OrchestratorError::Unparseable {
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    })?;

    let report: WorkerReport =
        serde_json::from_str(&stdout[json_start..]).map_err(|_| OrchestratorError::Unparseable {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        })?;

    if !report.success {
        return Err(OrchestratorError::WorkerReported {
            message: enhance_error(&report.error, stderr, worker_port),
        });
    }
    Ok(report)
}

/// Add a troubleshooting hint for well-known connection failures.
fn enhance_error(error: &str, stderr: &str, port: u16) -> String {
    let combined = format!("{} {}", error, stderr);

    if combined.contains("no route to host") {
        return format!(
            "{} (stderr: {}) [Hint: check that the target device's firewall allows incoming \
             connections on port {port}, e.g. 'sudo iptables -A INPUT -p tcp --dport {port} -j ACCEPT' \
             or 'sudo ufw allow {port}/tcp']",
            error, stderr
        );
    }

    if combined.contains("connection refused") {
        return format!(
            "{} (stderr: {}) [Hint: the worker may not be running on port {port}. The sink may have \
             failed to start on the target, the target address may be wrong, or a firewall is \
             rejecting the connection]",
            error, stderr
        );
    }

    if combined.contains("connection timed out") || combined.contains("i/o timeout") {
        return format!(
            "{} (stderr: {}) [Hint: connection to port {port} timed out; check network connectivity \
             between the devices and that firewall rules allow traffic on this port]",
            error, stderr
        );
    }

    format!("{} (stderr: {})", error, stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_report_with_preamble() {
        let stdout = "Last login: Sat Aug  2\nmotd noise\n{\"success\":true,\"latency_ms\":1.23}\n";
        let report = parse_worker_output(stdout, "", 8090).unwrap();
        assert!(report.success);
        assert_eq!(report.latency_ms, 1.23);
    }

    #[test]
    fn missing_json_is_unparseable() {
        let err = parse_worker_output("no braces here", "some stderr", 8090).unwrap_err();
        match err {
            OrchestratorError::Unparseable { stdout, stderr } => {
                assert_eq!(stdout, "no braces here");
                assert_eq!(stderr, "some stderr");
            }
            other => panic!("expected Unparseable, got {:?}", other),
        }
    }

    #[test]
    fn malformed_json_is_unparseable() {
        let err = parse_worker_output("{not json", "", 8090).unwrap_err();
        assert!(matches!(err, OrchestratorError::Unparseable { .. }));
    }

    #[test]
    fn refused_connection_gets_sink_hint() {
        let stdout = r#"{"success":false,"error":"dial error: connection refused"}"#;
        let err = parse_worker_output(stdout, "connection refused", 8090).unwrap_err();
        match err {
            OrchestratorError::WorkerReported { message } => {
                assert!(message.contains("worker may not be running on port 8090"), "{}", message);
                assert!(message.contains("dial error: connection refused"));
            }
            other => panic!("expected WorkerReported, got {:?}", other),
        }
    }

    #[test]
    fn no_route_gets_firewall_hint() {
        let msg = enhance_error("dial error: no route to host", "", 8090);
        assert!(msg.contains("firewall"));
        assert!(msg.contains("8090"));
    }

    #[test]
    fn timeout_gets_connectivity_hint() {
        let msg = enhance_error("dial error: i/o timeout", "", 8090);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("8090"));
    }

    #[test]
    fn unknown_error_keeps_stderr() {
        let msg = enhance_error("something odd", "trace here", 8090);
        assert_eq!(msg, "something odd (stderr: trace here)");
    }

    #[test]
    fn ping_report_maps_latency_only() {
        let report = WorkerReport {
            success: true,
            latency_ms: 1.23,
            ..Default::default()
        };
        let m = to_measurement(TestKind::Ping, 1, 2, &report);
        assert_eq!(m.source_id, 1);
        assert_eq!(m.target_id, 2);
        assert_eq!(m.kind, TestKind::Ping);
        assert_eq!(m.latency_ms, 1.23);
        assert_eq!(m.bandwidth_mbps, 0.0);
        assert!(m.error.is_empty());
    }

    #[test]
    fn speed_report_maps_bandwidth_only() {
        let report = WorkerReport {
            success: true,
            bandwidth_mbps: 941.2,
            latency_ms: 99.0,
            ..Default::default()
        };
        let m = to_measurement(TestKind::Speed, 1, 2, &report);
        assert_eq!(m.kind, TestKind::Speed);
        assert_eq!(m.bandwidth_mbps, 941.2);
        assert_eq!(m.latency_ms, 0.0);
    }
}
