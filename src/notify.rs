//! Optional webhook notifications for operator visibility.
//!
//! Strictly best-effort: delivery failures are logged and never affect the
//! scraping loop. With no webhook configured every call is a no-op.

use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub enum EventKind {
    Error,
    Completion,
    Shutdown,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Completion => "completion",
            Self::Shutdown => "shutdown",
        }
    }
}

pub struct Notifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
    worker_id: u32,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>, worker_id: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            webhook_url,
            worker_id,
        }
    }

    pub async fn send(&self, kind: EventKind, subject: &str, detail: &str) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let payload = json!({
            "worker_id": self.worker_id,
            "kind": kind.as_str(),
            "subject": subject,
            "detail": detail,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        match self.http.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(kind = kind.as_str(), "notification delivered");
            }
            Ok(resp) => warn!(
                kind = kind.as_str(),
                status = %resp.status(),
                "notification rejected"
            ),
            Err(e) => warn!(kind = kind.as_str(), "notification failed: {e}"),
        }
    }
}
