use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized identity used for dedup and lookup (spec glossary: "Company key").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompanyKey(String);

impl CompanyKey {
    /// Identity = normalized-name OR normalized-domain. Domain wins when present
    /// since it's less ambiguous than a display name.
    pub fn from_company(company: &Company) -> Self {
        if let Some(domain) = &company.domain {
            Self::from_domain(domain)
        } else {
            Self::from_name(&company.name)
        }
    }

    pub fn from_name(name: &str) -> Self {
        Self(normalize(name))
    }

    pub fn from_domain(domain: &str) -> Self {
        Self(normalize(domain))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CompanyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn normalize(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("www.")
        .trim_end_matches('/')
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '.' || *c == '-')
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    pub domain: Option<String>,
    pub product_url: Option<String>,
    pub description: Option<String>,
    pub launch_timestamp: Option<DateTime<Utc>>,
}

impl Company {
    pub fn key(&self) -> CompanyKey {
        CompanyKey::from_company(self)
    }

    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefers_domain_over_name() {
        let a = Company {
            name: "Acme Inc".into(),
            domain: Some("https://Acme.io/".into()),
            product_url: None,
            description: None,
            launch_timestamp: None,
        };
        let b = Company {
            name: "Totally Different Name".into(),
            domain: Some("acme.io".into()),
            product_url: None,
            description: None,
            launch_timestamp: None,
        };
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_falls_back_to_name() {
        let a = Company {
            name: "  Beta  Co ".into(),
            domain: None,
            product_url: None,
            description: None,
            launch_timestamp: None,
        };
        assert_eq!(a.key().as_str(), "betaco");
    }
}
