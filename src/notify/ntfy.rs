//! Push notifications via an ntfy server.
//!
//! ntfy takes the message as the POST body and metadata as headers, so a
//! notification is a single request to `<server>/<topic>`.

use std::time::Duration;

use reqwest::Client;

use super::{NotifyError, NtfySettings};

pub struct NtfyClient {
    http: Client,
}

impl NtfyClient {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Send a message to `topic`, or the configured default when empty.
    pub async fn send(
        &self,
        settings: &NtfySettings,
        topic: &str,
        title: &str,
        body: &str,
        priority: &str,
    ) -> Result<(), NotifyError> {
        let topic = if topic.is_empty() { &settings.topic } else { topic };
        if topic.is_empty() {
            return Err(NotifyError::NoTopic);
        }

        let url = format!("{}/{}", settings.server.trim_end_matches('/'), topic);
        let mut request = self
            .http
            .post(&url)
            .header("Title", title)
            .header("Priority", priority)
            .body(body.to_string());
        if !settings.token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", settings.token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

impl Default for NtfyClient {
    fn default() -> Self {
        Self::new()
    }
}
