use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum EmailGenerationStatus {
    NotGenerated,
    Generated,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum EmailDeliveryStatus {
    NotSent,
    Sent,
    Delivered,
    Bounced,
    Complained,
    Failed,
}

/// A resolved person at a company, optionally enriched with email, profile,
/// AI-structured data, and generated outreach content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prospect {
    pub id: Option<String>,
    pub name: String,
    pub role: String,
    pub company: String,
    pub profile_url: Option<String>,
    pub email: Option<String>,
    pub email_confidence: Option<f32>,
    pub ai_profile_json: Option<serde_json::Value>,
    pub ai_product_json: Option<serde_json::Value>,
    pub ai_business_json: Option<serde_json::Value>,
    pub personalization_blob: Option<String>,
    pub email_subject: Option<String>,
    pub email_body: Option<String>,
    pub email_generation_status: EmailGenerationStatus,
    pub email_delivery_status: EmailDeliveryStatus,
    pub generated_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub source: String,
}

#[derive(Debug)]
pub enum ProspectInvariantViolation {
    SentWithoutGeneration,
    SentAtBeforeGeneratedAt,
    ConfidenceOutOfRange(f32),
}

impl Prospect {
    pub fn new(name: String, role: String, company: String, source: String) -> Self {
        Self {
            id: None,
            name,
            role,
            company,
            profile_url: None,
            email: None,
            email_confidence: None,
            ai_profile_json: None,
            ai_product_json: None,
            ai_business_json: None,
            personalization_blob: None,
            email_subject: None,
            email_body: None,
            email_generation_status: EmailGenerationStatus::NotGenerated,
            email_delivery_status: EmailDeliveryStatus::NotSent,
            generated_at: None,
            sent_at: None,
            source,
        }
    }

    /// Checks the invariants from spec §3: a prospect's delivery status may
    /// only be non-`NotSent` once generation succeeded, a send can only
    /// follow a generation, and confidence is a probability.
    pub fn check_invariants(&self) -> Result<(), ProspectInvariantViolation> {
        if self.email_delivery_status != EmailDeliveryStatus::NotSent
            && !matches!(
                self.email_generation_status,
                EmailGenerationStatus::Generated | EmailGenerationStatus::Sent
            )
        {
            return Err(ProspectInvariantViolation::SentWithoutGeneration);
        }
        if let (Some(sent), Some(generated)) = (self.sent_at, self.generated_at) {
            if sent <= generated {
                return Err(ProspectInvariantViolation::SentAtBeforeGeneratedAt);
            }
        }
        if let Some(c) = self.email_confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(ProspectInvariantViolation::ConfidenceOutOfRange(c));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Prospect {
        Prospect::new("Jane".into(), "CTO".into(), "Acme".into(), "feed".into())
    }

    #[test]
    fn rejects_sent_without_generation() {
        let mut p = base();
        p.email_delivery_status = EmailDeliveryStatus::Sent;
        assert!(matches!(
            p.check_invariants(),
            Err(ProspectInvariantViolation::SentWithoutGeneration)
        ));
    }

    #[test]
    fn rejects_confidence_out_of_range() {
        let mut p = base();
        p.email_confidence = Some(1.5);
        assert!(matches!(
            p.check_invariants(),
            Err(ProspectInvariantViolation::ConfidenceOutOfRange(_))
        ));
    }

    #[test]
    fn accepts_well_formed_sent_prospect() {
        let mut p = base();
        p.email_generation_status = EmailGenerationStatus::Sent;
        p.email_delivery_status = EmailDeliveryStatus::Sent;
        p.generated_at = Some(Utc::now() - chrono::Duration::seconds(10));
        p.sent_at = Some(Utc::now());
        p.email_confidence = Some(0.8);
        assert!(p.check_invariants().is_ok());
    }
}
