//! Team member extraction from a company/product page. Never raises for
//! "no team found" — an empty vec is a normal outcome the pipeline handles
//! by marking the company `NoTeam` (spec.md §4.C8, §5 step 2).

use async_trait::async_trait;
use reqwest::Method;
use scraper::{Html, Selector};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::browser_pool::{BrowserPool, LoadHints};
use crate::domain::company::Company;
use crate::domain::team_member::TeamMember;
use crate::http_client::HttpClient;

#[async_trait]
pub trait TeamExtractor: Send + Sync {
    async fn extract(&self, company: &Company, cancel: &CancellationToken) -> Vec<TeamMember>;
}

pub struct HttpTeamExtractor {
    http: Arc<HttpClient>,
    browser_pool: Arc<BrowserPool>,
    member_selector: String,
    name_selector: String,
    role_selector: String,
    profile_link_selector: String,
}

impl HttpTeamExtractor {
    pub fn new(
        http: Arc<HttpClient>,
        browser_pool: Arc<BrowserPool>,
        member_selector: impl Into<String>,
        name_selector: impl Into<String>,
        role_selector: impl Into<String>,
        profile_link_selector: impl Into<String>,
    ) -> Self {
        Self {
            http,
            browser_pool,
            member_selector: member_selector.into(),
            name_selector: name_selector.into(),
            role_selector: role_selector.into(),
            profile_link_selector: profile_link_selector.into(),
        }
    }

    fn parse(&self, html: &str, company_name: &str) -> Vec<TeamMember> {
        let document = Html::parse_document(html);
        let Ok(member_sel) = Selector::parse(&self.member_selector) else {
            return Vec::new();
        };
        let name_sel = Selector::parse(&self.name_selector).ok();
        let role_sel = Selector::parse(&self.role_selector).ok();
        let link_sel = Selector::parse(&self.profile_link_selector).ok();

        document
            .select(&member_sel)
            .filter_map(|el| {
                let name = name_sel
                    .as_ref()
                    .and_then(|s| el.select(s).next())
                    .map(|n| n.text().collect::<String>().trim().to_string())?;
                let role = role_sel
                    .as_ref()
                    .and_then(|s| el.select(s).next())
                    .map(|n| n.text().collect::<String>().trim().to_string())
                    .unwrap_or_default();
                let profile_url = link_sel
                    .as_ref()
                    .and_then(|s| el.select(s).next())
                    .and_then(|n| n.value().attr("href"))
                    .map(str::to_string);

                let member = TeamMember {
                    name,
                    role,
                    company_name: company_name.to_string(),
                    profile_url,
                };
                member.has_plausible_name().then_some(member)
            })
            .collect()
    }
}

#[async_trait]
impl TeamExtractor for HttpTeamExtractor {
    async fn extract(&self, company: &Company, cancel: &CancellationToken) -> Vec<TeamMember> {
        let Some(url) = &company.product_url else {
            return Vec::new();
        };

        let html = match self
            .http
            .execute("team_extractor", Method::GET, url, |b| b, cancel)
            .await
        {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(_) => return Vec::new(),
            },
            Err(_) => {
                let Ok(session) = self
                    .browser_pool
                    .acquire("team_extractor", std::time::Duration::from_secs(20))
                    .await
                else {
                    return Vec::new();
                };
                let Ok(tab) = session.load(url, &LoadHints::default(), std::time::Duration::from_secs(20)) else {
                    self.browser_pool.release(session, false);
                    return Vec::new();
                };
                let html_result = session.html(&tab);
                self.browser_pool.release(session, html_result.is_ok());
                html_result.unwrap_or_default()
            }
        };

        self.parse(&html, &company.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> HttpTeamExtractor {
        HttpTeamExtractor::new(
            Arc::new(HttpClient::new(
                Arc::new(crate::rate_limiter::RateLimiter::new(&std::collections::HashMap::new())),
                std::time::Duration::from_secs(5),
                0,
            )),
            Arc::new(BrowserPool::new(1, std::time::Duration::from_secs(60))),
            "div.team-member",
            "h4.name",
            "span.role",
            "a.profile-link",
        )
    }

    #[test]
    fn parses_members_and_drops_implausible_names() {
        let html = r#"
            <html><body>
                <div class="team-member"><h4 class="name">Jane Doe</h4><span class="role">CTO</span><a class="profile-link" href="https://linkedin.com/in/jane">x</a></div>
                <div class="team-member"><h4 class="name">   </h4><span class="role">Intern</span></div>
            </body></html>
        "#;
        let members = extractor().parse(html, "Acme");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "Jane Doe");
        assert_eq!(members[0].profile_url.as_deref(), Some("https://linkedin.com/in/jane"));
    }
}
