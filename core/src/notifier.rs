//! Lifecycle-event notifications (§4.C13). There is no separate transport:
//! events are posted as structured log entries via `Store`, matching the
//! teacher's own preference for routing everything through its existing
//! persistence layer rather than bolting on e.g. a webhook client. Delivery
//! is best-effort and fire-and-forget, the same shape as the teacher's
//! `tokio::spawn`-ed cron jobs in `main.rs`: failures are logged at `warn`
//! and never propagate back to the caller.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::domain::log::{ProcessingLogEntry, StageOutcome};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind")]
pub enum NotificationKind {
    CampaignCompleted {
        campaign_id: String,
        prospects_found: u64,
        emails_sent: u64,
    },
    CampaignFailed {
        campaign_id: String,
        reason: String,
    },
    DailySummary {
        prospects_found: u64,
        emails_sent: u64,
        companies_processed: u64,
    },
    ErrorAlert {
        component: String,
        message: String,
    },
    WeeklyReport {
        prospects_found: u64,
        emails_sent: u64,
        response_rate_estimate: Option<f32>,
    },
    QuotaWarning {
        service: String,
        remaining_fraction: f32,
    },
}

impl NotificationKind {
    fn priority(&self) -> Priority {
        match self {
            NotificationKind::CampaignFailed { .. } | NotificationKind::ErrorAlert { .. } => Priority::High,
            NotificationKind::QuotaWarning { .. } => Priority::High,
            NotificationKind::CampaignCompleted { .. } => Priority::Normal,
            NotificationKind::DailySummary { .. } | NotificationKind::WeeklyReport { .. } => Priority::Low,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            NotificationKind::CampaignCompleted { .. } => "campaign_completed",
            NotificationKind::CampaignFailed { .. } => "campaign_failed",
            NotificationKind::DailySummary { .. } => "daily_summary",
            NotificationKind::ErrorAlert { .. } => "error_alert",
            NotificationKind::WeeklyReport { .. } => "weekly_report",
            NotificationKind::QuotaWarning { .. } => "quota_warning",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub campaign_id: String,
}

pub struct Notifier {
    store: Arc<dyn Store>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Fires the notification in the background and returns immediately.
    /// Never surfaces a delivery error to the caller.
    pub fn notify(&self, event: NotificationEvent) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = deliver(&store, &event).await {
                tracing::warn!(campaign = %event.campaign_id, kind = event.kind.label(), error = %e, "notification delivery failed");
            }
        });
    }

    /// Same as `notify` but awaits delivery; used by callers (e.g. the CLI)
    /// that want to know the notification was accepted before exiting.
    pub async fn notify_and_wait(&self, event: NotificationEvent) -> Result<(), crate::error::AppError> {
        deliver(&self.store, &event).await
    }
}

async fn deliver(store: &Arc<dyn Store>, event: &NotificationEvent) -> Result<(), crate::error::AppError> {
    let details = serde_json::to_string(&event.kind).unwrap_or_else(|_| "<unserializable>".into());
    let priority = event.kind.priority();
    let entry = ProcessingLogEntry {
        ts: Utc::now(),
        worker_id: 0,
        campaign: event.campaign_id.clone(),
        company: String::new(),
        step: format!("notifier:{}", event.kind.label()),
        outcome: StageOutcome::Completed,
        duration_s: 0.0,
        details: format!("priority={priority:?} {details}"),
        error: None,
        prospects_found_delta: 0,
        emails_found_delta: 0,
    };
    store.append_log(&entry).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_alert_and_quota_warning_are_high_priority() {
        let alert = NotificationKind::ErrorAlert {
            component: "email_finder".into(),
            message: "timeout".into(),
        };
        assert_eq!(alert.priority(), Priority::High);

        let quota = NotificationKind::QuotaWarning {
            service: "ai_service".into(),
            remaining_fraction: 0.05,
        };
        assert_eq!(quota.priority(), Priority::High);
    }

    #[test]
    fn daily_and_weekly_reports_are_low_priority() {
        let daily = NotificationKind::DailySummary {
            prospects_found: 10,
            emails_sent: 3,
            companies_processed: 5,
        };
        assert_eq!(daily.priority(), Priority::Low);
    }
}
