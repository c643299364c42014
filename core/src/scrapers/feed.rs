//! Product-launch listing discovery. Paginates an HTTP(S) listing page
//! until `limit` candidates are gathered or the source runs dry;
//! deduplication is left to the orchestrator + store, matching spec.md's
//! explicit division of responsibility.

use async_trait::async_trait;
use reqwest::Method;
use scraper::{Html, Selector};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::browser_pool::{BrowserPool, LoadHints};
use crate::domain::company::Company;
use crate::error::AppError;
use crate::http_client::HttpClient;

#[async_trait]
pub trait ProductFeed: Send + Sync {
    async fn list(&self, limit: usize, cancel: &CancellationToken) -> Result<Vec<Company>, AppError>;
}

pub struct HttpProductFeed {
    http: Arc<HttpClient>,
    browser_pool: Arc<BrowserPool>,
    listing_url: String,
    page_size: usize,
    item_selector: String,
    name_selector: String,
    link_selector: String,
}

impl HttpProductFeed {
    pub fn new(
        http: Arc<HttpClient>,
        browser_pool: Arc<BrowserPool>,
        listing_url: impl Into<String>,
        page_size: usize,
        item_selector: impl Into<String>,
        name_selector: impl Into<String>,
        link_selector: impl Into<String>,
    ) -> Self {
        Self {
            http,
            browser_pool,
            listing_url: listing_url.into(),
            page_size,
            item_selector: item_selector.into(),
            name_selector: name_selector.into(),
            link_selector: link_selector.into(),
        }
    }

    fn parse_page(&self, html: &str) -> Vec<Company> {
        let document = Html::parse_document(html);
        let Ok(item_sel) = Selector::parse(&self.item_selector) else {
            return Vec::new();
        };
        let name_sel = Selector::parse(&self.name_selector).ok();
        let link_sel = Selector::parse(&self.link_selector).ok();

        document
            .select(&item_sel)
            .filter_map(|item| {
                let name = name_sel
                    .as_ref()
                    .and_then(|s| item.select(s).next())
                    .map(|el| el.text().collect::<String>().trim().to_string())?;
                if name.is_empty() {
                    return None;
                }
                let product_url = link_sel
                    .as_ref()
                    .and_then(|s| item.select(s).next())
                    .and_then(|el| el.value().attr("href"))
                    .map(str::to_string);

                Some(Company {
                    name,
                    domain: None,
                    product_url,
                    description: None,
                    launch_timestamp: None,
                })
            })
            .collect()
    }

    async fn fetch_page(&self, page: usize, cancel: &CancellationToken) -> Result<String, AppError> {
        let url = format!("{}?page={page}", self.listing_url);
        let resp = self
            .http
            .execute("product_feed", Method::GET, &url, |b| b, cancel)
            .await;

        match resp {
            Ok(resp) => resp.text().await.map_err(AppError::from),
            Err(_) => {
                // listing requires JS rendering; fall back to the browser pool
                let session = self
                    .browser_pool
                    .acquire("product_feed", std::time::Duration::from_secs(20))
                    .await?;
                let html_result = match session.load(&url, &LoadHints::default(), std::time::Duration::from_secs(20)) {
                    Ok(tab) => session.html(&tab),
                    Err(e) => Err(e),
                };
                self.browser_pool.release(session, html_result.is_ok());
                html_result
            }
        }
    }
}

#[async_trait]
impl ProductFeed for HttpProductFeed {
    async fn list(&self, limit: usize, cancel: &CancellationToken) -> Result<Vec<Company>, AppError> {
        let mut out = Vec::new();
        let mut page = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if out.len() >= limit {
                break;
            }

            let html = self.fetch_page(page, cancel).await?;
            let items = self.parse_page(&html);
            if items.is_empty() {
                break;
            }

            out.extend(items.into_iter().filter(Company::is_valid));
            page += 1;
            if page * self.page_size.max(1) > limit * 4 {
                // safety valve against a listing that never runs dry
                break;
            }
        }

        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed() -> HttpProductFeed {
        HttpProductFeed::new(
            Arc::new(HttpClient::new(
                Arc::new(crate::rate_limiter::RateLimiter::new(&std::collections::HashMap::new())),
                std::time::Duration::from_secs(5),
                0,
            )),
            Arc::new(BrowserPool::new(1, std::time::Duration::from_secs(60))),
            "https://example.com/launches",
            20,
            "div.launch-item",
            "h3.name",
            "a.product-link",
        )
    }

    #[test]
    fn parses_well_formed_listing_page() {
        let html = r#"
            <html><body>
                <div class="launch-item"><h3 class="name">Acme</h3><a class="product-link" href="https://acme.io">x</a></div>
                <div class="launch-item"><h3 class="name">  </h3><a class="product-link" href="https://blank.io">x</a></div>
            </body></html>
        "#;
        let companies = feed().parse_page(html);
        assert_eq!(companies.len(), 1);
        assert_eq!(companies[0].name, "Acme");
        assert_eq!(companies[0].product_url.as_deref(), Some("https://acme.io"));
    }
}
