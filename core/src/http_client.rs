//! Shared pooled HTTP client (spec §4.C4). Every outward request passes
//! through the rate limiter for its logical service name before being
//! issued; retries use exponential backoff with jitter via the `backoff`
//! crate, bounded by a retry budget.

use backoff::{backoff::Backoff, ExponentialBackoff};
use reqwest::{Method, RequestBuilder};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::rate_limiter::RateLimiter;

pub struct HttpClient {
    client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
    max_request_timeout: Duration,
    retry_budget: u32,
}

impl HttpClient {
    pub fn new(rate_limiter: Arc<RateLimiter>, max_request_timeout: Duration, retry_budget: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(max_request_timeout)
            .build()
            .expect("reqwest client builder should not fail with default TLS backend");
        Self {
            client,
            rate_limiter,
            max_request_timeout,
            retry_budget,
        }
    }

    pub fn raw(&self) -> &reqwest::Client {
        &self.client
    }

    /// Issues a request against `service`'s rate limiter, retrying
    /// transient failures and 408/429/5xx responses with exponential
    /// backoff + jitter, honoring `Retry-After` on 429.
    pub async fn execute(
        &self,
        service: &str,
        method: Method,
        url: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, AppError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
            max_elapsed_time: Some(self.max_request_timeout * (self.retry_budget.max(1) + 1)),
            ..Default::default()
        };

        let mut attempt = 0u32;
        loop {
            self.rate_limiter
                .acquire(service, 1, self.max_request_timeout, cancel)
                .await?;

            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let request = build(self.client.request(method.clone(), url));
            let outcome = request.send().await;

            match outcome {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);

                    let classified = classify_status(status.as_u16());
                    if attempt >= self.retry_budget || !classified.is_retryable() {
                        return Err(classified);
                    }
                    let wait = retry_after.or_else(|| backoff.next_backoff()).unwrap_or(Duration::from_secs(1));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    }
                }
                Err(e) => {
                    let classified: AppError = e.into();
                    if attempt >= self.retry_budget || !classified.is_retryable() {
                        return Err(classified);
                    }
                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(1));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    }
                }
            }
            attempt += 1;
        }
    }
}

fn classify_status(status: u16) -> AppError {
    match status {
        408 => AppError::Transient("request timeout".into()),
        429 => AppError::RateLimited { retry_after: None },
        401 | 403 => AppError::Auth(format!("status {status}")),
        s if (500..600).contains(&s) => AppError::Transient(format!("status {s}")),
        s => AppError::Permanent(format!("status {s}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes_per_taxonomy() {
        assert!(classify_status(503).is_retryable());
        assert!(classify_status(429).is_retryable());
        assert!(!classify_status(404).is_retryable());
        assert!(!classify_status(401).is_retryable());
    }
}
