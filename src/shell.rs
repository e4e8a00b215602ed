//! Remote shell client over SSH.
//!
//! Wraps a blocking libssh2 session. Host-key verification is deliberately
//! permissive: this runs against a private homelab fleet where key material
//! churns with reinstalls. A hardened deployment would check known_hosts and
//! surface a mismatch as its own error.
//!
//! All methods block; callers on the async runtime go through
//! `spawn_blocking`. The interior mutex serializes channel use so the client
//! can be shared across tasks.

use ssh2::Session;
use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// TCP connect timeout for the control connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(7);

/// Cap on any single blocking operation on an established session. Long
/// enough for a full throughput run plus teardown slack.
const SESSION_TIMEOUT_MS: u32 = 30_000;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("host {0} unreachable: {1}")]
    Unreachable(String, String),
    #[error("connection to {0} timed out")]
    ConnectTimeout(String),
    #[error("authentication failed for {0}: {1}")]
    AuthFailed(String, String),
    #[error("no usable private key (tried {0})")]
    NoKey(String),
    #[error("ssh error: {0}")]
    Ssh(#[from] ssh2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("remote command exited with status {exit}; stderr: {stderr}")]
    CommandFailed {
        stdout: String,
        stderr: String,
        exit: i32,
    },
}

/// Output of a completed remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// An authenticated SSH connection to one host.
pub struct ShellClient {
    session: Mutex<Session>,
    host: String,
}

impl ShellClient {
    /// Connect and authenticate with the private key at `key_path`.
    pub fn connect(user: &str, host: &str, port: u16, key_path: &Path) -> Result<Self, ShellError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| ShellError::Unreachable(host.to_string(), e.to_string()))?
            .next()
            .ok_or_else(|| {
                ShellError::Unreachable(host.to_string(), "no addresses resolved".to_string())
            })?;

        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                ShellError::ConnectTimeout(host.to_string())
            } else {
                ShellError::Unreachable(host.to_string(), e.to_string())
            }
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;

        session
            .userauth_pubkey_file(user, None, key_path, None)
            .map_err(|e| ShellError::AuthFailed(host.to_string(), e.to_string()))?;
        if !session.authenticated() {
            return Err(ShellError::AuthFailed(
                host.to_string(),
                "server rejected key".to_string(),
            ));
        }

        session.set_timeout(SESSION_TIMEOUT_MS);
        debug!(host, port, user, "ssh session established");

        Ok(Self {
            session: Mutex::new(session),
            host: host.to_string(),
        })
    }

    /// Run a command, capturing stdout and stderr separately.
    ///
    /// A non-zero exit is an error carrying both streams.
    pub fn run(&self, cmd: &str) -> Result<CommandOutput, ShellError> {
        let (output, exit) = self.run_captured(cmd)?;
        if exit != 0 {
            return Err(ShellError::CommandFailed {
                stdout: output.stdout,
                stderr: output.stderr,
                exit,
            });
        }
        Ok(output)
    }

    /// Run a command whose exit status is expected to be irrelevant, such as
    /// a best-effort kill. Only transport failures are errors.
    pub fn run_ignore_status(&self, cmd: &str) -> Result<CommandOutput, ShellError> {
        self.run_captured(cmd).map(|(output, _)| output)
    }

    fn run_captured(&self, cmd: &str) -> Result<(CommandOutput, i32), ShellError> {
        let session = self.session.lock().unwrap();
        let mut channel = session.channel_session()?;
        channel.exec(cmd)?;

        let mut stdout_raw = Vec::new();
        channel.read_to_end(&mut stdout_raw)?;
        let mut stderr_raw = Vec::new();
        channel.stderr().read_to_end(&mut stderr_raw)?;

        channel.wait_close()?;
        let exit = channel.exit_status()?;

        let stdout = clean_output(&stdout_raw);
        let stderr = clean_output(&stderr_raw);
        debug!(host = %self.host, cmd, exit, "remote command finished");

        Ok((CommandOutput { stdout, stderr }, exit))
    }

    /// Check whether a regular file exists on the remote host.
    pub fn exists(&self, remote_path: &str) -> Result<bool, ShellError> {
        match self.run(&format!("test -f {}", remote_path)) {
            Ok(_) => Ok(true),
            Err(ShellError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Upload `data` to `remote_path` with the given mode.
    ///
    /// The whole transfer is one shell invocation reading stdin, staged
    /// beside the destination and moved into place, so readers never see a
    /// partially written file.
    pub fn upload(&self, data: &[u8], remote_path: &str, mode: u32) -> Result<(), ShellError> {
        let session = self.session.lock().unwrap();
        let mut channel = session.channel_session()?;
        channel.exec(&upload_command(remote_path, mode))?;

        use std::io::Write;
        channel.write_all(data)?;
        channel.send_eof()?;
        channel.wait_eof()?;

        let mut stderr_raw = Vec::new();
        channel.stderr().read_to_end(&mut stderr_raw)?;
        channel.close()?;
        channel.wait_close()?;
        let exit = channel.exit_status()?;

        if exit != 0 {
            return Err(ShellError::CommandFailed {
                stdout: String::new(),
                stderr: clean_output(&stderr_raw),
                exit,
            });
        }
        debug!(host = %self.host, remote_path, bytes = data.len(), "upload complete");
        Ok(())
    }

    /// Release the underlying connection.
    pub fn close(&self) {
        let session = self.session.lock().unwrap();
        let _ = session.disconnect(None, "closing", None);
    }
}

/// Shell line that receives stdin into `remote_path` atomically with `mode`.
fn upload_command(remote_path: &str, mode: u32) -> String {
    format!(
        "cat > {path}.upload && chmod {mode:o} {path}.upload && mv {path}.upload {path}",
        path = remote_path,
        mode = mode
    )
}

/// Strip NUL bytes and surrounding whitespace from captured output.
fn clean_output(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace('\0', "")
        .trim()
        .to_string()
}

/// Locate the default private key (`~/.ssh/id_ed25519`, then `~/.ssh/id_rsa`).
pub fn default_key_path() -> Result<PathBuf, ShellError> {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let candidates = [
        PathBuf::from(&home).join(".ssh/id_ed25519"),
        PathBuf::from(&home).join(".ssh/id_rsa"),
    ];
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    Err(ShellError::NoKey(
        candidates
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_output_strips_nuls_and_whitespace() {
        assert_eq!(clean_output(b"  hello\0 world \n"), "hello world");
        assert_eq!(clean_output(b"\0\0"), "");
        assert_eq!(clean_output(b"plain"), "plain");
    }

    #[test]
    fn upload_command_is_one_shell_invocation() {
        let cmd = upload_command("/tmp/lanpulse-worker", 0o755);
        assert_eq!(
            cmd,
            "cat > /tmp/lanpulse-worker.upload && chmod 755 /tmp/lanpulse-worker.upload && mv /tmp/lanpulse-worker.upload /tmp/lanpulse-worker"
        );
    }

    #[test]
    fn command_failed_display_carries_stderr() {
        let err = ShellError::CommandFailed {
            stdout: String::new(),
            stderr: "permission denied".to_string(),
            exit: 126,
        };
        let msg = err.to_string();
        assert!(msg.contains("126"));
        assert!(msg.contains("permission denied"));
    }
}
