//! SQLite store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("invalid {field} value: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Thread-safe database store.
///
/// Writes are serialized through the connection mutex; SQLite's busy
/// timeout covers contention from other connections on the same file.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Apply the embedded schema. Safe to run on an already-initialized file.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();

        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("schema apply failed: {}", e)))?;

        // Back-fill for databases created before the error column existed.
        let _ = conn.execute("ALTER TABLE results ADD COLUMN error TEXT NOT NULL DEFAULT ''", []);

        Ok(())
    }

    // --- Devices ---

    pub fn list_devices(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, hostname, IFNULL(ip, ''), ssh_user, ssh_port FROM devices ORDER BY id",
        )?;

        let devices = stmt
            .query_map([], |row| {
                Ok(Device {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    hostname: row.get(2)?,
                    ip: row.get(3)?,
                    ssh_user: row.get(4)?,
                    ssh_port: row.get(5)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(devices)
    }

    /// Insert a device and assign its id.
    pub fn add_device(&self, device: &mut Device) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO devices (name, hostname, ip, ssh_user, ssh_port) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![device.name, device.hostname, device.ip, device.ssh_user, device.ssh_port],
        )?;
        let id = conn.last_insert_rowid();
        device.id = id;
        Ok(id)
    }

    pub fn delete_device(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Schedules ---

    pub fn get_schedules(&self) -> Result<Vec<Schedule>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, type, interval, enabled FROM schedules ORDER BY id")?;

        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(1)?;
                Ok((row.get::<_, i64>(0)?, kind, row.get::<_, String>(2)?, row.get::<_, bool>(3)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut schedules = Vec::with_capacity(rows.len());
        for (id, kind, interval, enabled) in rows {
            let kind = TestKind::parse(&kind)
                .ok_or(DbError::InvalidField { field: "type", value: kind })?;
            schedules.push(Schedule { id, kind, interval, enabled });
        }
        Ok(schedules)
    }

    /// Insert or update the single schedule row for `kind`.
    pub fn upsert_schedule(&self, kind: TestKind, interval: &str, enabled: bool) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO schedules (type, interval, enabled) VALUES (?1, ?2, ?3)
             ON CONFLICT(type) DO UPDATE SET interval = excluded.interval, enabled = excluded.enabled",
            params![kind.as_str(), interval, enabled],
        )?;
        Ok(())
    }

    // --- Results ---

    pub fn insert_result(&self, m: &Measurement) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO results
                (source_device_id, target_device_id, type, latency_ms, jitter_ms, packet_loss, bandwidth_mbps, timestamp, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                m.source_id,
                m.target_id,
                m.kind.as_str(),
                m.latency_ms,
                m.jitter_ms,
                m.packet_loss,
                m.bandwidth_mbps,
                m.timestamp.format(TS_FORMAT).to_string(),
                m.error,
            ],
        )?;
        Ok(())
    }

    /// Most recent results first. Rows may reference deleted devices.
    pub fn history(&self, limit: i64) -> Result<Vec<Measurement>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_device_id, target_device_id, type, latency_ms, jitter_ms, packet_loss,
                    bandwidth_mbps, timestamp, IFNULL(error, '')
             FROM results ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map(params![limit], row_to_measurement)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    /// The matrix view: the newest result per (source, target, type) triple.
    /// Timestamp ties may yield any one of the tied rows.
    pub fn latest(&self) -> Result<Vec<Measurement>, DbError> {
        let conn = self.conn.lock().unwrap();
        // The trailing GROUP BY + MAX(r.id) breaks second-granularity
        // timestamp ties so each triple yields exactly one row.
        let mut stmt = conn.prepare(
            "SELECT r.source_device_id, r.target_device_id, r.type, r.latency_ms, r.jitter_ms,
                    r.packet_loss, r.bandwidth_mbps, r.timestamp, IFNULL(r.error, ''), MAX(r.id)
             FROM results r
             INNER JOIN (
                 SELECT source_device_id, target_device_id, type, MAX(timestamp) AS max_ts
                 FROM results
                 GROUP BY source_device_id, target_device_id, type
             ) latest ON r.source_device_id = latest.source_device_id
                     AND r.target_device_id = latest.target_device_id
                     AND r.type = latest.type
                     AND r.timestamp = latest.max_ts
             GROUP BY r.source_device_id, r.target_device_id, r.type",
        )?;

        let rows = stmt
            .query_map([], row_to_measurement)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows)
    }

    // --- Alert rules ---

    pub fn list_alert_rules(&self) -> Result<Vec<AlertRule>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, event_type, threshold, source_device_id, target_device_id,
                    notify_push, push_topic, notify_email, email_recipients, enabled
             FROM alert_rules ORDER BY id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let event: String = row.get(2)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    event,
                    row.get::<_, Option<f64>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, bool>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, bool>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, bool>(10)?,
                ))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut rules = Vec::with_capacity(rows.len());
        for (id, name, event, threshold, src, dst, push, topic, email, recipients, enabled) in rows {
            let event_type = AlertEvent::parse(&event)
                .ok_or(DbError::InvalidField { field: "event_type", value: event })?;
            rules.push(AlertRule {
                id,
                name,
                event_type,
                threshold,
                source_device_id: src,
                target_device_id: dst,
                notify_push: push,
                push_topic: topic,
                notify_email: email,
                email_recipients: recipients,
                enabled,
            });
        }
        Ok(rules)
    }

    pub fn create_alert_rule(&self, rule: &mut AlertRule) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO alert_rules
                (name, event_type, threshold, source_device_id, target_device_id,
                 notify_push, push_topic, notify_email, email_recipients, enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                rule.name,
                rule.event_type.as_str(),
                rule.threshold,
                rule.source_device_id,
                rule.target_device_id,
                rule.notify_push,
                rule.push_topic,
                rule.notify_email,
                rule.email_recipients,
                rule.enabled,
            ],
        )?;
        let id = conn.last_insert_rowid();
        rule.id = id;
        Ok(id)
    }

    pub fn update_alert_rule(&self, rule: &AlertRule) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE alert_rules SET name = ?1, event_type = ?2, threshold = ?3,
                 source_device_id = ?4, target_device_id = ?5, notify_push = ?6,
                 push_topic = ?7, notify_email = ?8, email_recipients = ?9, enabled = ?10
             WHERE id = ?11",
            params![
                rule.name,
                rule.event_type.as_str(),
                rule.threshold,
                rule.source_device_id,
                rule.target_device_id,
                rule.notify_push,
                rule.push_topic,
                rule.notify_email,
                rule.email_recipients,
                rule.enabled,
                rule.id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_alert_rule(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM alert_rules WHERE id = ?1", params![id])?;
        Ok(())
    }

    // --- Notification settings ---

    pub fn get_notification_setting(&self, key: &str) -> Result<Option<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row(
                "SELECT value FROM notification_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_notification_setting(&self, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notification_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_all_notification_settings(&self) -> Result<HashMap<String, String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT key, value FROM notification_settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(rows.into_iter().collect())
    }
}

fn row_to_measurement(row: &Row<'_>) -> SqlResult<Measurement> {
    let kind: String = row.get(2)?;
    let ts: String = row.get(7)?;
    Ok(Measurement {
        source_id: row.get(0)?,
        target_id: row.get(1)?,
        kind: TestKind::parse(&kind).unwrap_or(TestKind::Ping),
        latency_ms: row.get(3)?,
        jitter_ms: row.get(4)?,
        packet_loss: row.get(5)?,
        bandwidth_mbps: row.get(6)?,
        timestamp: parse_db_time(&ts).unwrap_or_else(Utc::now),
        error: row.get::<_, String>(8)?.trim().to_string(),
    })
}

/// Parse a timestamp string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TS_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%SZ"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn schema_is_idempotent() {
        let tmp = NamedTempFile::new().unwrap();
        let first = Store::new(tmp.path()).unwrap();
        let mut dev = Device {
            name: "nas".to_string(),
            hostname: "nas.lan".to_string(),
            ..Default::default()
        };
        first.add_device(&mut dev).unwrap();
        drop(first);

        // Reopening must not fail and must preserve rows.
        let second = Store::new(tmp.path()).unwrap();
        let devices = second.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "nas");
    }

    #[test]
    fn device_roundtrip() {
        let (_tmp, store) = open_store();

        let mut dev = Device {
            name: "TestNAS".to_string(),
            hostname: "nas.local".to_string(),
            ip: "100.64.0.1".to_string(),
            ssh_user: "root".to_string(),
            ssh_port: 22,
            ..Default::default()
        };
        let id = store.add_device(&mut dev).unwrap();
        assert!(id > 0);

        let devices = store.list_devices().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "TestNAS");
        assert_eq!(devices[0].hostname, "nas.local");
        assert_eq!(devices[0].ip, "100.64.0.1");
        assert_eq!(devices[0].ssh_port, 22);

        store.delete_device(id).unwrap();
        assert!(store.list_devices().unwrap().is_empty());
    }

    #[test]
    fn schedule_upsert_is_idempotent() {
        let (_tmp, store) = open_store();

        store.upsert_schedule(TestKind::Ping, "1m", true).unwrap();
        store.upsert_schedule(TestKind::Ping, "30s", false).unwrap();

        let schedules = store.get_schedules().unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].kind, TestKind::Ping);
        assert_eq!(schedules[0].interval, "30s");
        assert!(!schedules[0].enabled);
    }

    #[test]
    fn history_is_newest_first() {
        let (_tmp, store) = open_store();

        let mut old = Measurement::ping(1, 2, 5.0, 0.0, 0.0);
        old.timestamp -= TimeDelta::seconds(60);
        store.insert_result(&old).unwrap();
        store.insert_result(&Measurement::ping(1, 2, 7.0, 0.0, 0.0)).unwrap();

        let history = store.history(10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].latency_ms, 7.0);
        assert_eq!(history[1].latency_ms, 5.0);

        assert_eq!(store.history(1).unwrap().len(), 1);
    }

    #[test]
    fn latest_returns_one_row_per_triple() {
        let (_tmp, store) = open_store();

        let mut old = Measurement::ping(1, 2, 5.0, 0.0, 0.0);
        old.timestamp -= TimeDelta::seconds(60);
        store.insert_result(&old).unwrap();
        store.insert_result(&Measurement::ping(1, 2, 7.0, 0.0, 0.0)).unwrap();
        store.insert_result(&Measurement::speed(1, 2, 940.0)).unwrap();
        store.insert_result(&Measurement::ping(2, 1, 3.0, 0.0, 0.0)).unwrap();

        let latest = store.latest().unwrap();
        assert_eq!(latest.len(), 3);

        let ping_12 = latest
            .iter()
            .find(|m| m.source_id == 1 && m.target_id == 2 && m.kind == TestKind::Ping)
            .unwrap();
        assert_eq!(ping_12.latency_ms, 7.0);
    }

    #[test]
    fn failed_measurement_is_persisted() {
        let (_tmp, store) = open_store();

        let m = Measurement::failure(1, 2, TestKind::Speed, "worker reported failure".to_string());
        store.insert_result(&m).unwrap();

        let history = store.history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].error, "worker reported failure");
        assert_eq!(history[0].bandwidth_mbps, 0.0);
    }

    #[test]
    fn alert_rule_crud() {
        let (_tmp, store) = open_store();

        let mut rule = AlertRule {
            id: 0,
            name: "slow link".to_string(),
            event_type: AlertEvent::SpeedBelow,
            threshold: Some(100.0),
            source_device_id: None,
            target_device_id: Some(2),
            notify_push: true,
            push_topic: "net".to_string(),
            notify_email: false,
            email_recipients: String::new(),
            enabled: true,
        };
        let id = store.create_alert_rule(&mut rule).unwrap();
        assert!(id > 0);

        let rules = store.list_alert_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].event_type, AlertEvent::SpeedBelow);
        assert_eq!(rules[0].threshold, Some(100.0));
        assert_eq!(rules[0].target_device_id, Some(2));

        let mut updated = rules[0].clone();
        updated.threshold = Some(50.0);
        store.update_alert_rule(&updated).unwrap();
        assert_eq!(store.list_alert_rules().unwrap()[0].threshold, Some(50.0));

        store.delete_alert_rule(id).unwrap();
        assert!(store.list_alert_rules().unwrap().is_empty());
    }

    #[test]
    fn notification_settings_roundtrip() {
        let (_tmp, store) = open_store();

        assert_eq!(store.get_notification_setting("ntfy_topic").unwrap(), None);
        store.set_notification_setting("ntfy_topic", "lab").unwrap();
        store.set_notification_setting("ntfy_topic", "net").unwrap();
        assert_eq!(
            store.get_notification_setting("ntfy_topic").unwrap(),
            Some("net".to_string())
        );

        store.set_notification_setting("smtp_host", "mail.lan").unwrap();
        let all = store.get_all_notification_settings().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["ntfy_topic"], "net");
    }
}
