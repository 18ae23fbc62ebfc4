//! Fire-and-forget student notifications.
//!
//! Delivery runs on a detached task after the ledger write has committed.
//! Failures are logged and counted, never returned to the caller.

use crate::services::metrics::record_notification_failure;
use async_trait::async_trait;
use serde::Serialize;
use service_core::observability::TracedClientExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeCategory {
    FeeStatement,
    Payment,
}

impl NoticeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeCategory::FeeStatement => "fee_statement",
            NoticeCategory::Payment => "payment",
        }
    }
}

/// Message addressed to a student.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub recipient_id: Uuid,
    pub category: NoticeCategory,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl Notice {
    pub fn new(
        recipient_id: Uuid,
        category: NoticeCategory,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient_id,
            category,
            title: title.into(),
            body: body.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("notification service responded with status {0}")]
    Rejected(u16),
}

/// Delivery mechanism for notices.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notice: &Notice) -> Result<(), NotifyError>;
}

/// Writes notices to the log only.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn dispatch(&self, notice: &Notice) -> Result<(), NotifyError> {
        tracing::info!(
            recipient_id = %notice.recipient_id,
            category = notice.category.as_str(),
            title = %notice.title,
            "Notification (log only)"
        );
        Ok(())
    }
}

/// Posts notices to the notification service over HTTP.
pub struct HttpDispatcher {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(base_url: &str) -> Self {
        tracing::info!(base_url = %base_url, "Notification HTTP dispatcher configured");
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/notifications", base_url.trim_end_matches('/')),
            timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for HttpDispatcher {
    async fn dispatch(&self, notice: &Notice) -> Result<(), NotifyError> {
        let response = self
            .client
            .traced_post(&self.endpoint)
            .timeout(self.timeout)
            .json(notice)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Handle used by the engine to emit notices without waiting on delivery.
#[derive(Clone)]
pub struct Notifier {
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl Notifier {
    pub fn new(dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Hand the notice to a background task and return immediately.
    pub fn send(&self, notice: Notice) {
        let dispatcher = self.dispatcher.clone();
        let span = tracing::info_span!(
            "notify",
            recipient_id = %notice.recipient_id,
            category = notice.category.as_str()
        );

        tokio::spawn(
            async move {
                if let Err(e) = dispatcher.dispatch(&notice).await {
                    record_notification_failure(notice.category.as_str());
                    tracing::warn!(error = %e, title = %notice.title, "Notification delivery failed");
                }
            }
            .instrument(span),
        );
    }
}
