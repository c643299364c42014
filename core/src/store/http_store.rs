//! HTTP-backed document database adapter. Every call goes through
//! `HttpClient` under the `"store"` service name, exactly like every other
//! external collaborator — the Store gets no special-cased transport.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ProspectFilter, ProspectPatch, Store};
use crate::cache::Cache;
use crate::domain::{
    CampaignProgress, CompanyKey, ControlCommand, Prospect, ProcessingLogEntry, SystemStatus,
};
use crate::error::AppError;
use crate::http_client::HttpClient;

const PROCESSED_COMPANIES_CACHE_KEY: &str = "store:processed_companies";
const PROCESSED_COMPANIES_TTL: Duration = Duration::from_secs(60);

pub struct HttpDocumentStore {
    http: Arc<HttpClient>,
    cache: Arc<Cache>,
    base_url: String,
    api_key: String,
    cancel: CancellationToken,
}

impl HttpDocumentStore {
    pub fn new(
        http: Arc<HttpClient>,
        cache: Arc<Cache>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            http,
            cache,
            base_url: base_url.into(),
            api_key: api_key.into(),
            cancel,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl Store for HttpDocumentStore {
    async fn upsert_prospect(&self, prospect: &Prospect) -> Result<String, AppError> {
        prospect
            .check_invariants()
            .map_err(|e| AppError::Permanent(format!("prospect failed invariant check before storage: {e:?}")))?;

        let resp = self
            .http
            .execute(
                "store",
                Method::PUT,
                &self.url("/prospects"),
                |b| b.bearer_auth(&self.api_key).json(prospect),
                &self.cancel,
            )
            .await?;
        let value: serde_json::Value = resp.json().await?;
        value
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| AppError::Parse("store upsert_prospect response missing id".into()))
    }

    async fn update_prospect_fields(&self, id: &str, patch: &ProspectPatch) -> Result<(), AppError> {
        self.http
            .execute(
                "store",
                Method::PATCH,
                &self.url(&format!("/prospects/{id}")),
                |b| b.bearer_auth(&self.api_key).json(patch_as_json(patch)),
                &self.cancel,
            )
            .await?;
        Ok(())
    }

    async fn get_processed_companies(&self) -> Result<HashSet<CompanyKey>, AppError> {
        if let Some(cached) = self.cache.get::<HashSet<CompanyKey>>(PROCESSED_COMPANIES_CACHE_KEY).await {
            return Ok(cached);
        }

        let resp = self
            .http
            .execute(
                "store",
                Method::GET,
                &self.url("/companies/processed"),
                |b| b.bearer_auth(&self.api_key),
                &self.cancel,
            )
            .await?;
        let names: Vec<String> = resp.json().await?;
        let keys: HashSet<CompanyKey> = names.iter().map(|n| CompanyKey::from_name(n)).collect();
        self.cache.set(PROCESSED_COMPANIES_CACHE_KEY, &keys, PROCESSED_COMPANIES_TTL).await;
        Ok(keys)
    }

    async fn find_prospects(&self, filter: &ProspectFilter) -> Result<Vec<Prospect>, AppError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(status) = filter.email_generation_status {
            query.push(("email_generation_status", status.to_string()));
        }
        if let Some(status) = filter.email_delivery_status {
            query.push(("email_delivery_status", status.to_string()));
        }
        if let Some(since) = filter.since {
            query.push(("since", since.to_rfc3339()));
        }

        let resp = self
            .http
            .execute(
                "store",
                Method::GET,
                &self.url("/prospects"),
                |b| b.bearer_auth(&self.api_key).query(&query),
                &self.cancel,
            )
            .await?;
        Ok(resp.json().await?)
    }

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), AppError> {
        self.http
            .execute(
                "store",
                Method::POST,
                &self.url("/logs"),
                |b| b.bearer_auth(&self.api_key).json(entry),
                &self.cancel,
            )
            .await?;
        Ok(())
    }

    async fn upsert_system_status(&self, status: &SystemStatus) -> Result<(), AppError> {
        self.http
            .execute(
                "store",
                Method::PUT,
                &self.url(&format!("/system_status/{}", status.name)),
                |b| b.bearer_auth(&self.api_key).json(status),
                &self.cancel,
            )
            .await?;
        Ok(())
    }

    async fn upsert_campaign(&self, progress: &CampaignProgress) -> Result<(), AppError> {
        self.http
            .execute(
                "store",
                Method::PUT,
                &self.url(&format!("/campaigns/{}", progress.id)),
                |b| b.bearer_auth(&self.api_key).json(progress),
                &self.cancel,
            )
            .await?;
        Ok(())
    }

    async fn get_campaign(&self, id: &str) -> Result<Option<CampaignProgress>, AppError> {
        let resp = self
            .http
            .execute(
                "store",
                Method::GET,
                &self.url(&format!("/campaigns/{id}")),
                |b| b.bearer_auth(&self.api_key),
                &self.cancel,
            )
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        Ok(Some(resp.json().await?))
    }

    async fn read_control_commands(
        &self,
        campaign_id: &str,
        since_ts: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ControlCommand>, AppError> {
        let resp = self
            .http
            .execute(
                "store",
                Method::GET,
                &self.url(&format!("/campaigns/{campaign_id}/control_commands")),
                |b| b.bearer_auth(&self.api_key).query(&[("since", since_ts.to_rfc3339())]),
                &self.cancel,
            )
            .await?;
        Ok(resp.json().await?)
    }

    async fn post_control_command(
        &self,
        campaign_id: &str,
        command: &ControlCommand,
    ) -> Result<(), AppError> {
        self.http
            .execute(
                "store",
                Method::POST,
                &self.url(&format!("/campaigns/{campaign_id}/control_commands")),
                |b| b.bearer_auth(&self.api_key).json(command),
                &self.cancel,
            )
            .await?;
        Ok(())
    }
}

fn patch_as_json(patch: &ProspectPatch) -> serde_json::Value {
    serde_json::json!({
        "email": patch.email,
        "email_confidence": patch.email_confidence,
        "ai_profile_json": patch.ai_profile_json,
        "ai_product_json": patch.ai_product_json,
        "ai_business_json": patch.ai_business_json,
        "personalization_blob": patch.personalization_blob,
        "email_subject": patch.email_subject,
        "email_body": patch.email_body,
        "email_generation_status": patch.email_generation_status,
        "email_delivery_status": patch.email_delivery_status,
        "generated_at": patch.generated_at,
        "sent_at": patch.sent_at,
    })
}
