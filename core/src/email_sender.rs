//! Outbound send + delivery-tracking adapter (§4.C10). Batch sends respect
//! the sender's own rate limiter one batch at a time, matching the
//! teacher's `email::client` batching shape generalized from the Gmail API
//! to a generic delivery API.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::http_client::HttpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStatus {
    Sent,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub reply_to: Option<String>,
    pub tags: Vec<String>,
    pub prospect_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendOutcome {
    pub prospect_id: String,
    pub status: SendStatus,
    pub provider_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryEvent {
    pub provider_id: String,
    pub event: String,
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize)]
struct SendRequestBody<'a> {
    to: &'a str,
    subject: &'a str,
    html: &'a Option<String>,
    text: &'a Option<String>,
    reply_to: &'a Option<String>,
    tags: &'a [String],
    prospect_id: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    status: SendStatus,
    provider_id: Option<String>,
    error: Option<String>,
}

pub struct EmailSender {
    http: Arc<HttpClient>,
    base_url: String,
    api_key: String,
}

/// Control characters (excluding `\n`/`\t`) and unpaired UTF-16 surrogate
/// placeholders are stripped from subject/body text before transmission.
/// Idempotent: running it twice on its own output is a no-op.
pub fn sanitize(input: &str) -> (String, bool) {
    let sanitized: String = input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .filter(|c| !matches!(*c as u32, 0xD800..=0xDFFF))
        .collect();
    let changed = sanitized != input;
    (sanitized, changed)
}

impl EmailSender {
    pub fn new(http: Arc<HttpClient>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Sanitizes subject/html/text; a changed field is logged (not silently
    /// dropped) so an operator can tell a prospect's stored content diverged
    /// from what was actually sent.
    fn prepare(mut email: OutboundEmail) -> OutboundEmail {
        let (subject, subject_changed) = sanitize(&email.subject);
        email.subject = subject;
        let mut html_changed = false;
        if let Some(html) = &email.html {
            let (sanitized, changed) = sanitize(html);
            html_changed = changed;
            email.html = Some(sanitized);
        }
        let mut text_changed = false;
        if let Some(text) = &email.text {
            let (sanitized, changed) = sanitize(text);
            text_changed = changed;
            email.text = Some(sanitized);
        }
        if subject_changed || html_changed || text_changed {
            tracing::info!(
                prospect_id = %email.prospect_id,
                subject_changed,
                html_changed,
                text_changed,
                "sanitized control characters before send"
            );
        }
        email
    }

    pub async fn send(&self, email: OutboundEmail, cancel: &CancellationToken) -> Result<SendOutcome, AppError> {
        let email = Self::prepare(email);
        let body = SendRequestBody {
            to: &email.to,
            subject: &email.subject,
            html: &email.html,
            text: &email.text,
            reply_to: &email.reply_to,
            tags: &email.tags,
            prospect_id: &email.prospect_id,
        };

        let resp = self
            .http
            .execute(
                "email_sender",
                Method::POST,
                &format!("{}/send", self.base_url),
                |b| b.bearer_auth(&self.api_key).json(&body),
                cancel,
            )
            .await?;

        let parsed: SendResponse = resp.json().await?;
        Ok(SendOutcome {
            prospect_id: email.prospect_id,
            status: parsed.status,
            provider_id: parsed.provider_id,
            error: parsed.error,
        })
    }

    pub async fn track(&self, provider_id: &str, cancel: &CancellationToken) -> Result<Option<DeliveryEvent>, AppError> {
        let resp = self
            .http
            .execute(
                "email_sender",
                Method::GET,
                &format!("{}/track/{provider_id}", self.base_url),
                |b| b.bearer_auth(&self.api_key),
                cancel,
            )
            .await?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(resp.json().await?))
    }

    pub async fn send_batch(
        &self,
        emails: Vec<OutboundEmail>,
        batch_size: usize,
        inter_batch_delay: Duration,
        cancel: &CancellationToken,
    ) -> Vec<Result<SendOutcome, AppError>> {
        let mut results = Vec::with_capacity(emails.len());
        for (i, chunk) in emails.chunks(batch_size.max(1)).enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(inter_batch_delay) => {}
                    _ = cancel.cancelled() => {
                        results.extend(chunk.iter().map(|_| Err(AppError::Cancelled)));
                        continue;
                    }
                }
            }
            for email in chunk {
                results.push(self.send(email.clone(), cancel).await);
            }
        }
        results
    }
}

impl Clone for OutboundEmail {
    fn clone(&self) -> Self {
        Self {
            to: self.to.clone(),
            subject: self.subject.clone(),
            html: self.html.clone(),
            text: self.text.clone(),
            reply_to: self.reply_to.clone(),
            tags: self.tags.clone(),
            prospect_id: self.prospect_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_characters_and_is_idempotent() {
        let input = "Hello\u{0007}World\u{FDD0}";
        let (first, changed) = sanitize(input);
        assert!(changed);
        let (second, changed_again) = sanitize(&first);
        assert_eq!(first, second);
        assert!(!changed_again);
    }

    #[test]
    fn sanitize_preserves_newlines_and_tabs() {
        let input = "line one\nline two\tindented";
        let (out, changed) = sanitize(input);
        assert_eq!(out, input);
        assert!(!changed);
    }
}
