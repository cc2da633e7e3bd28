use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};
use tracing::{error, info, warn};

/// key: billing-notifications -> outbound customer notice
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    PaymentConfirmation {
        organization_id: i32,
        recipient: Option<String>,
        customer_name: Option<String>,
        plan_name: String,
        invoice_id: String,
        amount_paid: i64,
        currency: String,
        paid_at: DateTime<Utc>,
        invoice_url: Option<String>,
    },
    PaymentFailed {
        organization_id: i32,
        recipient: Option<String>,
        customer_name: Option<String>,
        plan_name: String,
        invoice_id: String,
        amount_due: i64,
        currency: String,
        payment_method: Option<String>,
        retry_at: DateTime<Utc>,
        suspension_at: DateTime<Utc>,
        invoice_url: Option<String>,
    },
    TrialEnding {
        organization_id: i32,
        recipient: Option<String>,
        customer_name: Option<String>,
        plan_name: String,
        trial_ends_at: DateTime<Utc>,
        days_remaining: i64,
    },
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::PaymentConfirmation { .. } => "payment_confirmation",
            Notice::PaymentFailed { .. } => "payment_failed",
            Notice::TrialEnding { .. } => "trial_ending",
        }
    }

    pub fn organization_id(&self) -> i32 {
        match self {
            Notice::PaymentConfirmation {
                organization_id, ..
            }
            | Notice::PaymentFailed {
                organization_id, ..
            }
            | Notice::TrialEnding {
                organization_id, ..
            } => *organization_id,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notice: &Notice) -> Result<()>;
}

/// Writes notices to the log stream. Used when no relay is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notice: &Notice) -> Result<()> {
        info!(
            kind = notice.kind(),
            organization_id = notice.organization_id(),
            notice = ?notice,
            "billing notice"
        );
        Ok(())
    }
}

/// POSTs each notice as JSON to a delivery relay.
pub struct HttpNotifier {
    url: String,
    client: Client,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(&self, notice: &Notice) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notice)
            .send()
            .await?
            .error_for_status()
            .map_err(|err| anyhow!("notification relay rejected notice: {err}"))?;
        Ok(())
    }
}

/// key: billing-notifications-handle -> fire-and-forget enqueue interface
#[derive(Clone)]
pub struct NotificationHandle {
    sender: Sender<Notice>,
}

impl NotificationHandle {
    /// Queues `notice` without waiting. A full or closed queue drops it with a warning.
    pub fn dispatch(&self, notice: Notice) -> bool {
        match self.sender.try_send(notice) {
            Ok(()) => true,
            Err(TrySendError::Full(notice)) => {
                warn!(
                    kind = notice.kind(),
                    organization_id = notice.organization_id(),
                    "notification queue full, dropping notice"
                );
                false
            }
            Err(TrySendError::Closed(notice)) => {
                warn!(
                    kind = notice.kind(),
                    organization_id = notice.organization_id(),
                    "notification worker stopped, dropping notice"
                );
                false
            }
        }
    }
}

/// Handle plus the receiving end, for callers that drain notices themselves.
pub fn notification_channel(capacity: usize) -> (NotificationHandle, Receiver<Notice>) {
    let (sender, receiver) = channel(capacity);
    (NotificationHandle { sender }, receiver)
}

pub fn start_notification_worker(notifier: Arc<dyn Notifier>) -> NotificationHandle {
    let (handle, mut rx) = notification_channel(256);
    tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            if let Err(err) = notifier.deliver(&notice).await {
                error!(
                    ?err,
                    kind = notice.kind(),
                    organization_id = notice.organization_id(),
                    "failed to deliver billing notice",
                );
            }
        }
    });
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn trial_notice() -> Notice {
        let now = Utc::now();
        Notice::TrialEnding {
            organization_id: 9,
            recipient: Some("owner@example.com".into()),
            customer_name: None,
            plan_name: "Professional".into(),
            trial_ends_at: now + Duration::days(3),
            days_remaining: 3,
        }
    }

    #[tokio::test]
    async fn dispatch_drops_when_queue_is_full() {
        let (handle, mut rx) = notification_channel(1);
        assert!(handle.dispatch(trial_notice()));
        assert!(!handle.dispatch(trial_notice()));
        assert_eq!(rx.recv().await.map(|notice| notice.kind()), Some("trial_ending"));
    }

    #[tokio::test]
    async fn dispatch_after_worker_stops_is_harmless() {
        let (handle, rx) = notification_channel(4);
        drop(rx);
        assert!(!handle.dispatch(trial_notice()));
    }

    #[test]
    fn notices_serialize_with_kind_tag() {
        let value = serde_json::to_value(trial_notice()).unwrap();
        assert_eq!(value["kind"], "trial_ending");
        assert_eq!(value["days_remaining"], 3);
    }
}
