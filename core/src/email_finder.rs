//! Email discovery adapter (§4.C9). Quota exhaustion surfaces as
//! `QuotaExceeded` so the orchestrator can degrade the current prospect
//! rather than fail the company, per spec.md's explicit division of
//! responsibility between adapter and pipeline.

use reqwest::Method;
use serde::Deserialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::http_client::HttpClient;

#[derive(Debug, Clone)]
pub struct EmailMatch {
    pub email: String,
    pub confidence: f32,
}

#[derive(Deserialize)]
struct FindResponse {
    email: Option<String>,
    confidence: Option<f32>,
    quota_exceeded: Option<bool>,
}

pub struct EmailFinder {
    http: Arc<HttpClient>,
    base_url: String,
    api_key: String,
}

impl EmailFinder {
    pub fn new(http: Arc<HttpClient>, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    pub async fn find(
        &self,
        company_domain: &str,
        full_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<EmailMatch>, AppError> {
        let resp = self
            .http
            .execute(
                "email_finder",
                Method::GET,
                &format!("{}/find", self.base_url),
                |b| {
                    b.bearer_auth(&self.api_key)
                        .query(&[("domain", company_domain), ("name", full_name)])
                },
                cancel,
            )
            .await?;

        let body: FindResponse = resp.json().await?;

        if body.quota_exceeded.unwrap_or(false) {
            return Err(AppError::QuotaExceeded("email_finder quota exceeded".into()));
        }

        Ok(body.email.map(|email| EmailMatch {
            email,
            confidence: body.confidence.unwrap_or(0.0).clamp(0.0, 1.0),
        }))
    }
}
