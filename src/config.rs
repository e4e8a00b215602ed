//! Configuration loaded from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;

use crate::protocol::DEFAULT_WORKER_PORT;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP port for the API server (default: 8080).
    pub server_port: u16,
    /// Path to the SQLite database file.
    pub database_path: String,
    /// Data-plane port the sink listens on.
    pub worker_port: u16,
    /// Controller-local path of the worker binary staged on devices.
    pub worker_path: String,
    /// Explicit SSH private key; falls back to the usual ~/.ssh candidates.
    pub ssh_key_path: Option<PathBuf>,
    /// Default ping schedule seeded when none exists.
    pub ping_schedule: String,
    /// Default speed-test schedule seeded when none exists.
    pub speed_schedule: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: 8080,
            database_path: "data/lanpulse.db".to_string(),
            worker_port: DEFAULT_WORKER_PORT,
            worker_path: "./lanpulse-worker".to_string(),
            ssh_key_path: None,
            ping_schedule: "1m".to_string(),
            speed_schedule: "15m".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Recognized variables: `SERVER_PORT`, `DATABASE_PATH`, `WORKER_PORT`,
    /// `WORKER_PATH`, `SSH_KEY_PATH`, `PING_SCHEDULE`, `SPEEDTEST_SCHEDULE`.
    /// Malformed numeric values keep their defaults.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port) = env::var("SERVER_PORT") {
            if let Ok(port) = port.parse() {
                cfg.server_port = port;
            }
        }
        if let Ok(path) = env::var("DATABASE_PATH") {
            if !path.is_empty() {
                cfg.database_path = path;
            }
        }
        if let Ok(port) = env::var("WORKER_PORT") {
            if let Ok(port) = port.parse() {
                cfg.worker_port = port;
            }
        }
        if let Ok(path) = env::var("WORKER_PATH") {
            if !path.is_empty() {
                cfg.worker_path = path;
            }
        }
        if let Ok(path) = env::var("SSH_KEY_PATH") {
            if !path.is_empty() {
                cfg.ssh_key_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(schedule) = env::var("PING_SCHEDULE") {
            if !schedule.is_empty() {
                cfg.ping_schedule = schedule;
            }
        }
        if let Ok(schedule) = env::var("SPEEDTEST_SCHEDULE") {
            if !schedule.is_empty() {
                cfg.speed_schedule = schedule;
            }
        }

        cfg
    }
}
