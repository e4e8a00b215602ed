//! Notification settings and dispatch.
//!
//! Settings live as key-value rows in the store, but any value supplied via
//! environment variable shadows its row and locks it against UI updates.
//! The manager keeps the effective configuration in memory and rebuilds it
//! on every settings update.

mod email;
mod ntfy;

pub use email::send_email;
pub use ntfy::NtfyClient;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::alerts::TriggeredAlert;
use crate::db::{DbError, Store};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push server returned status {0}")]
    Status(u16),
    #[error("no push topic configured")]
    NoTopic,
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("smtp error: {0}")]
    Smtp(String),
}

/// ntfy push configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtfySettings {
    pub enabled: bool,
    pub server: String,
    pub topic: String,
    pub token: String,
}

impl Default for NtfySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server: "https://ntfy.sh".to_string(),
            topic: String::new(),
            token: String::new(),
        }
    }
}

/// SMTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 587,
            user: String::new(),
            password: String::new(),
            from: String::new(),
        }
    }
}

/// Which settings are pinned by environment variables.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EnvLocked {
    pub ntfy_enabled: bool,
    pub ntfy_server: bool,
    pub ntfy_topic: bool,
    pub ntfy_token: bool,
    pub smtp_enabled: bool,
    pub smtp_host: bool,
    pub smtp_port: bool,
    pub smtp_user: bool,
    pub smtp_password: bool,
    pub smtp_from: bool,
}

/// The full settings view handed to the API.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationSettings {
    pub ntfy: NtfySettings,
    pub smtp: SmtpSettings,
    pub env_locked: EnvLocked,
}

/// Incoming settings update (env-locked fields are ignored).
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationSettingsUpdate {
    pub ntfy: NtfySettings,
    pub smtp: SmtpSettings,
}

struct Effective {
    ntfy: NtfySettings,
    smtp: SmtpSettings,
}

pub struct NotificationManager {
    store: Arc<Store>,
    effective: RwLock<Effective>,
    env: EnvLocked,
    push: NtfyClient,
}

impl NotificationManager {
    /// Build from process environment plus stored settings.
    pub fn new(store: Arc<Store>) -> Self {
        let env_vars: HashMap<String, String> = std::env::vars().collect();
        Self::with_env(store, &env_vars)
    }

    /// Build with an explicit environment map. Env values win and lock.
    pub fn with_env(store: Arc<Store>, env_vars: &HashMap<String, String>) -> Self {
        let stored = store.get_all_notification_settings().unwrap_or_else(|e| {
            warn!("failed to load notification settings: {}", e);
            HashMap::new()
        });

        let mut ntfy = NtfySettings::default();
        let mut smtp = SmtpSettings::default();
        let mut env = EnvLocked::default();

        let pick = |env_key: &str, db_key: &str, locked: &mut bool| -> Option<String> {
            if let Some(v) = env_vars.get(env_key).filter(|v| !v.is_empty()) {
                *locked = true;
                return Some(v.clone());
            }
            stored.get(db_key).cloned()
        };

        if let Some(v) = pick("NTFY_ENABLED", "ntfy_enabled", &mut env.ntfy_enabled) {
            ntfy.enabled = truthy(&v);
        }
        if let Some(v) = pick("NTFY_SERVER", "ntfy_server", &mut env.ntfy_server) {
            if !v.is_empty() {
                ntfy.server = v;
            }
        }
        if let Some(v) = pick("NTFY_TOPIC", "ntfy_topic", &mut env.ntfy_topic) {
            ntfy.topic = v;
        }
        if let Some(v) = pick("NTFY_TOKEN", "ntfy_token", &mut env.ntfy_token) {
            ntfy.token = v;
        }

        if let Some(v) = pick("SMTP_ENABLED", "smtp_enabled", &mut env.smtp_enabled) {
            smtp.enabled = truthy(&v);
        }
        if let Some(v) = pick("SMTP_HOST", "smtp_host", &mut env.smtp_host) {
            smtp.host = v;
        }
        if let Some(v) = pick("SMTP_PORT", "smtp_port", &mut env.smtp_port) {
            if let Ok(port) = v.parse() {
                smtp.port = port;
            }
        }
        if let Some(v) = pick("SMTP_USER", "smtp_user", &mut env.smtp_user) {
            smtp.user = v;
        }
        if let Some(v) = pick("SMTP_PASSWORD", "smtp_password", &mut env.smtp_password) {
            smtp.password = v;
        }
        if let Some(v) = pick("SMTP_FROM", "smtp_from", &mut env.smtp_from) {
            smtp.from = v;
        }

        Self {
            store,
            effective: RwLock::new(Effective { ntfy, smtp }),
            env,
            push: NtfyClient::new(),
        }
    }

    pub fn settings(&self) -> NotificationSettings {
        let effective = self.effective.read().unwrap();
        NotificationSettings {
            ntfy: effective.ntfy.clone(),
            smtp: effective.smtp.clone(),
            env_locked: self.env,
        }
    }

    /// Apply a UI settings update. Fields locked by the environment keep
    /// their env values and are not written to the store.
    pub fn update_settings(&self, update: NotificationSettingsUpdate) -> Result<(), DbError> {
        let mut effective = self.effective.write().unwrap();

        if !self.env.ntfy_enabled {
            self.store
                .set_notification_setting("ntfy_enabled", if update.ntfy.enabled { "true" } else { "false" })?;
            effective.ntfy.enabled = update.ntfy.enabled;
        }
        if !self.env.ntfy_server {
            self.store.set_notification_setting("ntfy_server", &update.ntfy.server)?;
            effective.ntfy.server = update.ntfy.server;
        }
        if !self.env.ntfy_topic {
            self.store.set_notification_setting("ntfy_topic", &update.ntfy.topic)?;
            effective.ntfy.topic = update.ntfy.topic;
        }
        if !self.env.ntfy_token {
            self.store.set_notification_setting("ntfy_token", &update.ntfy.token)?;
            effective.ntfy.token = update.ntfy.token;
        }

        if !self.env.smtp_enabled {
            self.store
                .set_notification_setting("smtp_enabled", if update.smtp.enabled { "true" } else { "false" })?;
            effective.smtp.enabled = update.smtp.enabled;
        }
        if !self.env.smtp_host {
            self.store.set_notification_setting("smtp_host", &update.smtp.host)?;
            effective.smtp.host = update.smtp.host;
        }
        if !self.env.smtp_port {
            self.store
                .set_notification_setting("smtp_port", &update.smtp.port.to_string())?;
            effective.smtp.port = update.smtp.port;
        }
        if !self.env.smtp_user {
            self.store.set_notification_setting("smtp_user", &update.smtp.user)?;
            effective.smtp.user = update.smtp.user;
        }
        if !self.env.smtp_password {
            self.store
                .set_notification_setting("smtp_password", &update.smtp.password)?;
            effective.smtp.password = update.smtp.password;
        }
        if !self.env.smtp_from {
            self.store.set_notification_setting("smtp_from", &update.smtp.from)?;
            effective.smtp.from = update.smtp.from;
        }

        Ok(())
    }

    /// Send a triggered alert through every channel its rule enables.
    pub async fn dispatch(&self, alert: &TriggeredAlert) {
        let (ntfy, smtp) = {
            let effective = self.effective.read().unwrap();
            (effective.ntfy.clone(), effective.smtp.clone())
        };

        if alert.rule.notify_push {
            let topic = if alert.rule.push_topic.is_empty() {
                ntfy.topic.clone()
            } else {
                alert.rule.push_topic.clone()
            };
            if ntfy.enabled && !topic.is_empty() {
                match self.push.send(&ntfy, &topic, &alert.title, &alert.body, "high").await {
                    Ok(()) => info!(%topic, "push notification sent"),
                    Err(e) => warn!("failed to send push notification: {}", e),
                }
            }
        }

        if alert.rule.notify_email {
            let recipients = parse_recipients(&alert.rule.email_recipients);
            if smtp.enabled && !recipients.is_empty() {
                let body = format!("Alert: {}\n\n{}\n\nRule: {}", alert.title, alert.body, alert.rule.name);
                match send_email(&smtp, &recipients, &alert.title, &body).await {
                    Ok(()) => info!(recipients = %recipients.join(", "), "email notification sent"),
                    Err(e) => warn!("failed to send email notification: {}", e),
                }
            }
        }
    }
}

fn truthy(v: &str) -> bool {
    v == "true" || v == "1"
}

/// Split a comma-separated recipient list, dropping empty entries.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_store() -> (NamedTempFile, Arc<Store>) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        (tmp, store)
    }

    fn update(ntfy: NtfySettings, smtp: SmtpSettings) -> NotificationSettingsUpdate {
        NotificationSettingsUpdate { ntfy, smtp }
    }

    #[test]
    fn defaults_when_nothing_configured() {
        let (_tmp, store) = open_store();
        let manager = NotificationManager::with_env(store, &HashMap::new());

        let settings = manager.settings();
        assert!(!settings.ntfy.enabled);
        assert_eq!(settings.ntfy.server, "https://ntfy.sh");
        assert_eq!(settings.smtp.port, 587);
        assert!(!settings.env_locked.ntfy_topic);
    }

    #[test]
    fn db_settings_are_loaded() {
        let (_tmp, store) = open_store();
        store.set_notification_setting("ntfy_enabled", "true").unwrap();
        store.set_notification_setting("ntfy_topic", "lab").unwrap();
        store.set_notification_setting("smtp_port", "2525").unwrap();

        let manager = NotificationManager::with_env(store, &HashMap::new());
        let settings = manager.settings();
        assert!(settings.ntfy.enabled);
        assert_eq!(settings.ntfy.topic, "lab");
        assert_eq!(settings.smtp.port, 2525);
    }

    #[test]
    fn update_persists_and_applies() {
        let (_tmp, store) = open_store();
        let manager = NotificationManager::with_env(store.clone(), &HashMap::new());

        let mut ntfy = NtfySettings::default();
        ntfy.enabled = true;
        ntfy.topic = "net".to_string();
        manager.update_settings(update(ntfy, SmtpSettings::default())).unwrap();

        assert_eq!(manager.settings().ntfy.topic, "net");
        assert_eq!(
            store.get_notification_setting("ntfy_topic").unwrap(),
            Some("net".to_string())
        );
    }

    #[test]
    fn env_values_shadow_and_lock() {
        let (_tmp, store) = open_store();
        store.set_notification_setting("ntfy_topic", "from-db").unwrap();

        let env: HashMap<String, String> =
            [("NTFY_TOPIC".to_string(), "from-env".to_string())].into();
        let manager = NotificationManager::with_env(store.clone(), &env);

        let settings = manager.settings();
        assert_eq!(settings.ntfy.topic, "from-env");
        assert!(settings.env_locked.ntfy_topic);

        // An arbitrary sequence of UI updates cannot displace the env value.
        for attempt in ["a", "b", "c"] {
            let mut ntfy = NtfySettings::default();
            ntfy.topic = attempt.to_string();
            manager.update_settings(update(ntfy, SmtpSettings::default())).unwrap();
            assert_eq!(manager.settings().ntfy.topic, "from-env");
        }

        // The locked key was never rewritten in the store either.
        assert_eq!(
            store.get_notification_setting("ntfy_topic").unwrap(),
            Some("from-db".to_string())
        );
    }

    #[test]
    fn unlocked_fields_still_update_alongside_locked_ones() {
        let (_tmp, store) = open_store();
        let env: HashMap<String, String> =
            [("SMTP_HOST".to_string(), "mail.env".to_string())].into();
        let manager = NotificationManager::with_env(store, &env);

        let mut smtp = SmtpSettings::default();
        smtp.host = "mail.ui".to_string();
        smtp.from = "lanpulse@lab".to_string();
        manager.update_settings(update(NtfySettings::default(), smtp)).unwrap();

        let settings = manager.settings();
        assert_eq!(settings.smtp.host, "mail.env");
        assert_eq!(settings.smtp.from, "lanpulse@lab");
    }

    #[test]
    fn parse_recipients_splits_and_trims() {
        assert_eq!(
            parse_recipients("a@b.c, d@e.f ,,g@h.i"),
            vec!["a@b.c", "d@e.f", "g@h.i"]
        );
        assert!(parse_recipients("").is_empty());
        assert!(parse_recipients(" , ").is_empty());
    }
}
