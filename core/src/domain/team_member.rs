use serde::{Deserialize, Serialize};

/// Lives only for the duration of a company pipeline; on successful
/// resolution it becomes a `Prospect` committed to the Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMember {
    pub name: String,
    pub role: String,
    pub company_name: String,
    pub profile_url: Option<String>,
}

impl TeamMember {
    /// A member with no plausible name is dropped by team-extraction.
    pub fn has_plausible_name(&self) -> bool {
        let trimmed = self.name.trim();
        !trimmed.is_empty() && trimmed.chars().any(|c| c.is_alphabetic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_and_numeric_only_names() {
        let blank = TeamMember {
            name: "   ".into(),
            role: "Eng".into(),
            company_name: "Acme".into(),
            profile_url: None,
        };
        let numeric = TeamMember {
            name: "12345".into(),
            ..blank.clone()
        };
        let real = TeamMember {
            name: "Jane Doe".into(),
            ..blank.clone()
        };
        assert!(!blank.has_plausible_name());
        assert!(!numeric.has_plausible_name());
        assert!(real.has_plausible_name());
    }
}
