//! Outbound notification collaborator
//!
//! Alerts created by the control loops are forwarded to a [`Notifier`].
//! The production implementation posts a JSON body to a configured webhook;
//! notification failures are logged and never propagate into the loop that
//! raised the alert.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::store::Alert;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_alert(&self, alert: &Alert);
}

/// Notifier that drops everything. Used when no webhook is configured and
/// in tests.
#[derive(Debug, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send_alert(&self, _alert: &Alert) {}
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    title: &'a str,
    message: &'a str,
    severity: &'a str,
    #[serde(rename = "serverId")]
    server_id: i64,
    timestamp: String,
}

/// Posts alerts to a generic webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    #[instrument(skip_all, fields(severity = %alert.severity))]
    async fn send_alert(&self, alert: &Alert) {
        let body = WebhookBody {
            title: &alert.title,
            message: &alert.message,
            severity: &alert.severity,
            server_id: alert.agent_id,
            timestamp: alert.created_at_utc.to_rfc3339(),
        };

        let result = self.client.post(&self.url).json(&body).send().await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!("alert notification delivered");
            }
            Ok(response) => {
                error!(
                    "alert notification rejected with status {}",
                    response.status()
                );
            }
            Err(e) => {
                error!("error while sending alert notification: {e}");
            }
        }
    }
}
