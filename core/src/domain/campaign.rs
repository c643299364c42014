use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignStatus {
    NotStarted,
    Running,
    Paused,
    Completed,
    Failed,
}

impl CampaignStatus {
    /// The state machine DAG from spec §4.C12.
    pub fn can_transition_to(self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (NotStarted, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Failed)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
    pub target_count: u64,
    pub processed_count: u64,
    pub prospects_found: u64,
    pub emails_generated: u64,
    pub emails_sent: u64,
    pub success_rate: f32,
    pub current_step: String,
    pub current_company: Option<String>,
    pub error_count: u64,
    /// companies whose pipeline stored at least one prospect
    pub successful_companies: u64,
}

impl CampaignProgress {
    pub fn new(id: String, name: String, target_count: u64) -> Self {
        Self {
            id,
            name,
            status: CampaignStatus::NotStarted,
            start_ts: Utc::now(),
            end_ts: None,
            target_count,
            processed_count: 0,
            prospects_found: 0,
            emails_generated: 0,
            emails_sent: 0,
            success_rate: 0.0,
            current_step: "Idle".into(),
            current_company: None,
            error_count: 0,
            successful_companies: 0,
        }
    }

    pub fn recompute_success_rate(&mut self) {
        self.success_rate =
            self.successful_companies as f32 / (self.processed_count.max(1) as f32);
    }

    /// Attempts the transition, refusing (and returning false) if it would
    /// violate the state machine DAG.
    pub fn transition(&mut self, next: CampaignStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.end_ts = Some(Utc::now());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_rejects_illegal_jumps() {
        assert!(!CampaignStatus::NotStarted.can_transition_to(CampaignStatus::Paused));
        assert!(!CampaignStatus::Completed.can_transition_to(CampaignStatus::Running));
        assert!(!CampaignStatus::Failed.can_transition_to(CampaignStatus::Running));
    }

    #[test]
    fn state_machine_allows_pause_resume_stop() {
        let mut p = CampaignProgress::new("c1".into(), "test".into(), 10);
        assert!(p.transition(CampaignStatus::Running));
        assert!(p.transition(CampaignStatus::Paused));
        assert!(p.transition(CampaignStatus::Running));
        assert!(p.transition(CampaignStatus::Failed));
        assert!(p.end_ts.is_some());
        assert!(!p.transition(CampaignStatus::Running));
    }

    #[test]
    fn success_rate_uses_processed_count_floor_of_one() {
        let mut p = CampaignProgress::new("c1".into(), "test".into(), 10);
        p.recompute_success_rate();
        assert_eq!(p.success_rate, 0.0);
        p.processed_count = 4;
        p.successful_companies = 3;
        p.recompute_success_rate();
        assert_eq!(p.success_rate, 0.75);
    }
}
