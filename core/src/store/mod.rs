//! Document-database abstraction (§4.C11). The Store trait defines logical
//! operations only; the wire representation belongs entirely to whichever
//! adapter implements it (here, an HTTP-backed document database), the same
//! separation the teacher draws between `db_core::queries` and the concrete
//! `sea-orm` entities underneath it.

mod http_store;

pub use http_store::HttpDocumentStore;

use async_trait::async_trait;
use std::collections::HashSet;

use crate::domain::{
    CampaignProgress, CompanyKey, ControlCommand, Prospect, ProcessingLogEntry, SystemStatus,
};
use crate::error::AppError;

#[derive(Debug, Clone, Default)]
pub struct ProspectFilter {
    pub email_generation_status: Option<crate::domain::EmailGenerationStatus>,
    pub email_delivery_status: Option<crate::domain::EmailDeliveryStatus>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ProspectPatch {
    pub email: Option<String>,
    pub email_confidence: Option<f32>,
    pub ai_profile_json: Option<serde_json::Value>,
    pub ai_product_json: Option<serde_json::Value>,
    pub ai_business_json: Option<serde_json::Value>,
    pub personalization_blob: Option<String>,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub email_generation_status: Option<crate::domain::EmailGenerationStatus>,
    pub email_delivery_status: Option<crate::domain::EmailDeliveryStatus>,
    pub generated_at: Option<chrono::DateTime<chrono::Utc>>,
    pub sent_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Safe under concurrent writers; linearizes writes per prospect id.
/// Read-your-writes for the writer, eventual for other readers (spec.md's
/// explicit consistency model for this component).
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent by `(normalized_name, normalized_company)`; returns the
    /// assigned/matched id.
    async fn upsert_prospect(&self, prospect: &Prospect) -> Result<String, AppError>;

    /// Partial update; fields left `None` in `patch` are preserved as-is.
    async fn update_prospect_fields(&self, id: &str, patch: &ProspectPatch) -> Result<(), AppError>;

    async fn get_processed_companies(&self) -> Result<HashSet<CompanyKey>, AppError>;

    async fn find_prospects(&self, filter: &ProspectFilter) -> Result<Vec<Prospect>, AppError>;

    async fn append_log(&self, entry: &ProcessingLogEntry) -> Result<(), AppError>;

    async fn upsert_system_status(&self, status: &SystemStatus) -> Result<(), AppError>;

    async fn upsert_campaign(&self, progress: &CampaignProgress) -> Result<(), AppError>;

    async fn get_campaign(&self, id: &str) -> Result<Option<CampaignProgress>, AppError>;

    /// Monotonically advancing cursor: subsequent calls with the returned
    /// entries' latest timestamp never re-return an already-seen command.
    async fn read_control_commands(
        &self,
        campaign_id: &str,
        since_ts: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<ControlCommand>, AppError>;

    /// Posts an out-of-band instruction an operator (e.g. the CLI) wants the
    /// campaign's control poller to pick up on its next `read_control_commands`
    /// poll.
    async fn post_control_command(
        &self,
        campaign_id: &str,
        command: &ControlCommand,
    ) -> Result<(), AppError>;
}
