//! Failed-run notification
//!
//! A run that ends FAILED is reported to an operator channel. Delivery
//! problems are logged by the caller and never change the run outcome.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::models::RunReport;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Invalid notification target: {0}")]
    InvalidTarget(String),

    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Receives the report of every FAILED run
#[async_trait]
pub trait FailureNotifier: Send + Sync {
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError>;
}

/// Posts failed-run reports as JSON to a webhook
pub struct WebhookNotifier {
    client: Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        let url = Url::parse(url.trim()).map_err(|e| NotifyError::InvalidTarget(format!("{}: {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NotifyError::InvalidTarget(format!("{} (expected http or https)", url)));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lmsync-import/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifyError::InvalidTarget(e.to_string()))?;

        Ok(Self { client, url })
    }
}

#[async_trait]
impl FailureNotifier for WebhookNotifier {
    async fn notify(&self, report: &RunReport) -> Result<(), NotifyError> {
        let body = json!({
            "subject": "LMS import run failed",
            "run_id": report.run_id,
            "error": report.fatal_error,
            "report": report,
        });

        self.client
            .post(self.url.clone())
            .json(&body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        tracing::info!(run_id = %report.run_id, target = %self.url, "Failure notification sent");
        Ok(())
    }
}
