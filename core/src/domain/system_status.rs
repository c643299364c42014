use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentHealth {
    Healthy,
    Warning,
    Error,
    Offline,
}

/// Overwritten per heartbeat, one row per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub name: String,
    pub status: ComponentHealth,
    pub last_update: DateTime<Utc>,
    pub quota_used: f32,
    pub error_count_24h: u64,
    pub success_rate_24h: f32,
    pub details: String,
}

impl SystemStatus {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ComponentHealth::Healthy,
            last_update: Utc::now(),
            quota_used: 0.0,
            error_count_24h: 0,
            success_rate_24h: 1.0,
            details: String::new(),
        }
    }
}
