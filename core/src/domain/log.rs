use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    Started,
    Completed,
    Failed,
    Skipped,
}

/// Append-only. Log-entry timestamps are monotonically non-decreasing
/// within a single worker; across workers there is no global ordering, so
/// entries carry `worker_id` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLogEntry {
    pub ts: DateTime<Utc>,
    pub worker_id: u32,
    pub campaign: String,
    pub company: String,
    pub step: String,
    pub outcome: StageOutcome,
    pub duration_s: f64,
    pub details: String,
    pub error: Option<String>,
    pub prospects_found_delta: u64,
    pub emails_found_delta: u64,
}
