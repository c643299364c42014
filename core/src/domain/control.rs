use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlAction {
    Pause,
    Resume,
    Stop,
    InsertPriority { company_ref: String },
}

impl ControlAction {
    fn discriminant_str(&self) -> &'static str {
        match self {
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Stop => "stop",
            ControlAction::InsertPriority { .. } => "insert_priority",
        }
    }

    fn parameters(&self) -> String {
        match self {
            ControlAction::InsertPriority { company_ref } => company_ref.clone(),
            _ => String::new(),
        }
    }
}

/// An out-of-band instruction posted to the Store by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub action: ControlAction,
    pub requested_by: String,
    pub seen_ts: DateTime<Utc>,
}

impl ControlCommand {
    /// Idempotency key: `(campaign_id, action, parameters_hash)`. Two
    /// commands with the same key within the debounce window are the same
    /// logical command and the second is dropped.
    pub fn idempotency_key(&self, campaign_id: &str) -> String {
        let hash = blake3::hash(self.action.parameters().as_bytes());
        format!(
            "{campaign_id}:{}:{}",
            self.action.discriminant_str(),
            hash.to_hex()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_commands_share_idempotency_key() {
        let a = ControlCommand {
            action: ControlAction::InsertPriority {
                company_ref: "acme".into(),
            },
            requested_by: "operator".into(),
            seen_ts: Utc::now(),
        };
        let b = ControlCommand {
            seen_ts: Utc::now() + chrono::Duration::seconds(5),
            ..a.clone()
        };
        assert_eq!(a.idempotency_key("camp-1"), b.idempotency_key("camp-1"));
    }

    #[test]
    fn different_parameters_differ() {
        let a = ControlCommand {
            action: ControlAction::InsertPriority {
                company_ref: "acme".into(),
            },
            requested_by: "operator".into(),
            seen_ts: Utc::now(),
        };
        let b = ControlCommand {
            action: ControlAction::InsertPriority {
                company_ref: "beta".into(),
            },
            ..a.clone()
        };
        assert_ne!(a.idempotency_key("camp-1"), b.idempotency_key("camp-1"));
    }
}
