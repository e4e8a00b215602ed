//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp format used in the database and on the wire (UTC, second granularity).
pub const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Kind of measurement a schedule or result refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Ping,
    Speed,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Ping => "ping",
            TestKind::Speed => "speed",
        }
    }

    pub fn parse(s: &str) -> Option<TestKind> {
        match s {
            "ping" => Some(TestKind::Ping),
            "speed" => Some(TestKind::Speed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered host reachable over SSH.
///
/// `hostname` is the control-plane address used for the SSH connection;
/// `ip`, when non-empty, overrides it as the data-plane address the worker
/// dials during a measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub ip: String,
    pub ssh_user: String,
    pub ssh_port: u16,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            hostname: String::new(),
            ip: String::new(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
        }
    }
}

/// A measurement schedule. One row per kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: TestKind,
    /// Duration string like "30s" or "5m".
    pub interval: String,
    pub enabled: bool,
}

/// The immutable outcome of a single probe between an ordered device pair.
///
/// For ping results `bandwidth_mbps` is 0; for speed results the latency
/// fields are 0. Failed measurements keep all numeric fields at 0 and carry
/// the error string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measurement {
    pub source_id: i64,
    pub target_id: i64,
    #[serde(rename = "type")]
    pub kind: TestKind,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub bandwidth_mbps: f64,
    #[serde(with = "second_ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: String,
}

impl Measurement {
    pub fn ping(source_id: i64, target_id: i64, latency_ms: f64, jitter_ms: f64, packet_loss: f64) -> Self {
        Self {
            source_id,
            target_id,
            kind: TestKind::Ping,
            latency_ms,
            jitter_ms,
            packet_loss,
            bandwidth_mbps: 0.0,
            timestamp: now_seconds(),
            error: String::new(),
        }
    }

    pub fn speed(source_id: i64, target_id: i64, bandwidth_mbps: f64) -> Self {
        Self {
            source_id,
            target_id,
            kind: TestKind::Speed,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss: 0.0,
            bandwidth_mbps,
            timestamp: now_seconds(),
            error: String::new(),
        }
    }

    pub fn failure(source_id: i64, target_id: i64, kind: TestKind, error: String) -> Self {
        Self {
            source_id,
            target_id,
            kind,
            latency_ms: 0.0,
            jitter_ms: 0.0,
            packet_loss: 0.0,
            bandwidth_mbps: 0.0,
            timestamp: now_seconds(),
            error,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

/// Current UTC time truncated to second granularity.
pub fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}

/// Alert rule event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEvent {
    SpeedBelow,
    PingAbove,
    PacketLossAbove,
    TestError,
}

impl AlertEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEvent::SpeedBelow => "speed_below",
            AlertEvent::PingAbove => "ping_above",
            AlertEvent::PacketLossAbove => "packet_loss_above",
            AlertEvent::TestError => "test_error",
        }
    }

    pub fn parse(s: &str) -> Option<AlertEvent> {
        match s {
            "speed_below" => Some(AlertEvent::SpeedBelow),
            "ping_above" => Some(AlertEvent::PingAbove),
            "packet_loss_above" => Some(AlertEvent::PacketLossAbove),
            "test_error" => Some(AlertEvent::TestError),
            _ => None,
        }
    }
}

/// A persisted alert rule.
///
/// Unset `source_device_id` / `target_device_id` mean "any device".
/// `threshold` is required for every event kind except `test_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    pub event_type: AlertEvent,
    pub threshold: Option<f64>,
    pub source_device_id: Option<i64>,
    pub target_device_id: Option<i64>,
    #[serde(default)]
    pub notify_push: bool,
    #[serde(default)]
    pub push_topic: String,
    #[serde(default)]
    pub notify_email: bool,
    /// Comma-separated recipient list.
    #[serde(default)]
    pub email_recipients: String,
    pub enabled: bool,
}

/// Serde helper for second-granularity timestamps.
pub mod second_ts {
    use super::TS_FORMAT;
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.format(TS_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, TS_FORMAT)
            .map(|n| DateTime::from_naive_utc_and_offset(n, Utc))
            .map_err(serde::de::Error::custom)
    }
}
