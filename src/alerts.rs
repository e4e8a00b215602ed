//! Alert rule evaluation.
//!
//! Every freshly produced measurement is matched against the persisted
//! rules; each hit becomes a composed (title, body) pair handed to the
//! notification manager. Evaluation is pure so the predicates can be tested
//! without any transport.

use std::sync::Arc;

use tracing::{error, info};

use crate::db::{AlertEvent, AlertRule, Device, Measurement, Store, TestKind};
use crate::notify::NotificationManager;

/// A rule that matched a measurement, with its composed message.
#[derive(Debug, Clone)]
pub struct TriggeredAlert {
    pub rule: AlertRule,
    pub title: String,
    pub body: String,
}

pub struct AlertEngine {
    store: Arc<Store>,
    notifier: Arc<NotificationManager>,
}

impl AlertEngine {
    pub fn new(store: Arc<Store>, notifier: Arc<NotificationManager>) -> Self {
        Self { store, notifier }
    }

    /// Evaluate all rules against a measurement and dispatch what fires.
    ///
    /// Dispatch failures are logged; they never abort the remaining rules.
    pub async fn process(&self, measurement: &Measurement, devices: &[Device]) {
        let rules = match self.store.list_alert_rules() {
            Ok(rules) => rules,
            Err(e) => {
                error!("failed to load alert rules: {}", e);
                return;
            }
        };

        for alert in evaluate(&rules, measurement, devices) {
            info!(rule = %alert.rule.name, "alert triggered: {}", alert.body);
            self.notifier.dispatch(&alert).await;
        }
    }
}

/// Match a measurement against a rule set.
pub fn evaluate(rules: &[AlertRule], m: &Measurement, devices: &[Device]) -> Vec<TriggeredAlert> {
    let source_name = device_name(devices, m.source_id);
    let target_name = device_name(devices, m.target_id);

    let mut triggered = Vec::new();
    for rule in rules {
        if !rule.enabled {
            continue;
        }
        if matches!(rule.source_device_id, Some(id) if id != m.source_id) {
            continue;
        }
        if matches!(rule.target_device_id, Some(id) if id != m.target_id) {
            continue;
        }

        let hit = match rule.event_type {
            AlertEvent::SpeedBelow => rule.threshold.and_then(|threshold| {
                (m.kind == TestKind::Speed && !m.is_error() && m.bandwidth_mbps < threshold).then(|| {
                    (
                        format!("Speed alert: {} -> {}", source_name, target_name),
                        format!(
                            "Bandwidth {:.2} Mbps is below threshold {:.2} Mbps",
                            m.bandwidth_mbps, threshold
                        ),
                    )
                })
            }),
            AlertEvent::PingAbove => rule.threshold.and_then(|threshold| {
                (m.kind == TestKind::Ping && !m.is_error() && m.latency_ms > threshold).then(|| {
                    (
                        format!("Latency alert: {} -> {}", source_name, target_name),
                        format!(
                            "Latency {:.2} ms is above threshold {:.2} ms",
                            m.latency_ms, threshold
                        ),
                    )
                })
            }),
            AlertEvent::PacketLossAbove => rule.threshold.and_then(|threshold| {
                (m.kind == TestKind::Ping && !m.is_error() && m.packet_loss > threshold).then(|| {
                    (
                        format!("Packet loss alert: {} -> {}", source_name, target_name),
                        format!(
                            "Packet loss {:.2}% is above threshold {:.2}%",
                            m.packet_loss, threshold
                        ),
                    )
                })
            }),
            AlertEvent::TestError => m.is_error().then(|| {
                (
                    format!("Test error: {} -> {}", source_name, target_name),
                    format!("Test failed: {}", m.error),
                )
            }),
        };

        if let Some((title, body)) = hit {
            triggered.push(TriggeredAlert {
                rule: rule.clone(),
                title,
                body,
            });
        }
    }
    triggered
}

fn device_name(devices: &[Device], id: i64) -> String {
    devices
        .iter()
        .find(|d| d.id == id)
        .map(|d| d.name.clone())
        .unwrap_or_else(|| format!("device {}", id))
}
