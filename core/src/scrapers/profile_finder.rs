//! Resolves a profile URL for a team member lacking one. Tries, in order:
//! a pattern-based guess validated with a HEAD request, a short search
//! query, and a heuristic synthesis — matching spec.md's documented
//! fallback chain (§4.C8). Both positive and negative results are cached so
//! a member who never resolves doesn't retry the whole chain on every
//! subsequent pipeline run within the TTL.

use async_trait::async_trait;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::domain::team_member::TeamMember;
use crate::http_client::HttpClient;

const PROFILE_CACHE_TTL: Duration = Duration::from_secs(14 * 24 * 3600);
const PER_MEMBER_DEADLINE: Duration = Duration::from_secs(8);

#[async_trait]
pub trait ProfileFinder: Send + Sync {
    async fn find(&self, member: &TeamMember, cancel: &CancellationToken) -> Option<String>;
}

pub struct HeuristicProfileFinder {
    http: Arc<HttpClient>,
    cache: Arc<Cache>,
    search_endpoint: Option<String>,
}

impl HeuristicProfileFinder {
    pub fn new(http: Arc<HttpClient>, cache: Arc<Cache>, search_endpoint: Option<String>) -> Self {
        Self {
            http,
            cache,
            search_endpoint,
        }
    }

    fn cache_key(member: &TeamMember) -> String {
        format!(
            "profile_finder:{}:{}",
            member.company_name.to_lowercase(),
            member.name.to_lowercase()
        )
    }

    fn slug(name: &str) -> String {
        name.trim()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
    }

    async fn guess(&self, member: &TeamMember, cancel: &CancellationToken) -> Option<String> {
        let candidate = format!("https://www.linkedin.com/in/{}", Self::slug(&member.name));
        let resp = self
            .http
            .execute("profile_finder", Method::HEAD, &candidate, |b| b, cancel)
            .await
            .ok()?;
        resp.status().is_success().then_some(candidate)
    }

    async fn search(&self, member: &TeamMember, cancel: &CancellationToken) -> Option<String> {
        let endpoint = self.search_endpoint.as_ref()?;
        let query = format!("{} {} linkedin", member.name, member.company_name);
        let resp = self
            .http
            .execute(
                "profile_finder_search",
                Method::GET,
                endpoint,
                |b| b.query(&[("q", query.clone())]),
                cancel,
            )
            .await
            .ok()?;
        let body: serde_json::Value = resp.json().await.ok()?;
        body.get("results")
            .and_then(|r| r.as_array())
            .and_then(|a| a.first())
            .and_then(|r| r.get("url"))
            .and_then(|u| u.as_str())
            .map(str::to_string)
    }

    /// No network call: synthesizes a best-effort guess the caller can
    /// still attach as a low-confidence candidate rather than nothing.
    fn synthesize(member: &TeamMember) -> Option<String> {
        if member.name.trim().is_empty() {
            return None;
        }
        Some(format!(
            "https://www.google.com/search?q={}+{}+linkedin",
            urlencode(&member.name),
            urlencode(&member.company_name)
        ))
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c.to_string() } else { "+".to_string() })
        .collect()
}

#[async_trait]
impl ProfileFinder for HeuristicProfileFinder {
    async fn find(&self, member: &TeamMember, cancel: &CancellationToken) -> Option<String> {
        let key = Self::cache_key(member);
        if let Some(cached) = self.cache.get::<Option<String>>(&key).await {
            return cached;
        }

        let result = tokio::time::timeout(PER_MEMBER_DEADLINE, async {
            if let Some(found) = self.guess(member, cancel).await {
                return Some(found);
            }
            if let Some(found) = self.search(member, cancel).await {
                return Some(found);
            }
            Self::synthesize(member)
        })
        .await
        .unwrap_or(None);

        self.cache.set(&key, &result, PROFILE_CACHE_TTL).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_joins_lowercase_words_with_hyphens() {
        assert_eq!(HeuristicProfileFinder::slug("Jane Q. Doe"), "jane q. doe".replace(' ', "-"));
    }

    #[test]
    fn synthesize_returns_none_for_blank_name() {
        let member = TeamMember {
            name: "  ".into(),
            role: "CTO".into(),
            company_name: "Acme".into(),
            profile_url: None,
        };
        assert!(HeuristicProfileFinder::synthesize(&member).is_none());
    }
}
