//! Per-service token buckets (spec §4.C3). Grounded directly on the
//! teacher's `rate_limiters.rs`, generalized from one hardcoded `prompt`
//! limiter to a named registry, and from a single window to
//! minute/hour/day windows plus burst.

use leaky_bucket::RateLimiter as Bucket;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::ServiceRateLimit;
use crate::error::AppError;

struct Windows {
    minute: Arc<Bucket>,
    hour: Arc<Bucket>,
    day: Arc<Bucket>,
    configured: ServiceRateLimit,
    backoff: Arc<AtomicBool>,
}

fn bucket_for(capacity: u32, per: Duration) -> Arc<Bucket> {
    let capacity = capacity.max(1) as usize;
    Arc::new(
        Bucket::builder()
            .initial(capacity)
            .max(capacity)
            .refill(capacity)
            .interval(per)
            .build(),
    )
}

impl Windows {
    fn new(limit: ServiceRateLimit) -> Self {
        Self {
            minute: bucket_for(limit.per_minute, Duration::from_secs(60)),
            hour: bucket_for(limit.per_hour.max(limit.per_minute), Duration::from_secs(3600)),
            day: bucket_for(limit.per_day.max(limit.per_hour), Duration::from_secs(86_400)),
            configured: limit,
            backoff: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Shared, internally synchronized; FIFO among blocked acquirers is
/// inherited from `leaky_bucket`'s own wait queue per window.
pub struct RateLimiter {
    services: RwLock<HashMap<String, Windows>>,
}

impl RateLimiter {
    pub fn new(configured: &HashMap<String, ServiceRateLimit>) -> Self {
        let mut services = HashMap::new();
        for (name, limit) in configured {
            services.insert(name.clone(), Windows::new(*limit));
        }
        Self {
            services: RwLock::new(services),
        }
    }

    async fn ensure_service(&self, name: &str) {
        let exists = self.services.read().await.contains_key(name);
        if !exists {
            let mut guard = self.services.write().await;
            guard
                .entry(name.to_string())
                .or_insert_with(|| Windows::new(ServiceRateLimit {
                    per_minute: 60,
                    per_hour: 3600,
                    per_day: 86_400,
                    burst: 1,
                }));
        }
    }

    /// Blocks until tokens are available across all windows for `cost`, the
    /// deadline elapses (`RateLimitTimeout`), or `cancel` fires
    /// (`Cancelled`).
    ///
    /// Unlike a plain `day.acquire().await; hour.acquire().await; ...`
    /// chain, this never commits partway through: it polls each window's
    /// `balance()` until all three can satisfy `cost` (a wait that's freely
    /// cancellable, since nothing has been drawn down yet), then draws all
    /// three down with non-blocking `try_acquire` calls back to back. A
    /// timeout or cancel can only land during the poll, never between two
    /// of the three draws, so a cancelled/timed-out acquire never leaves
    /// tokens consumed from one window but not the others.
    pub async fn acquire(
        &self,
        service: &str,
        cost: u32,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        self.ensure_service(service).await;

        let (day, hour, minute, backoff) = {
            let guard = self.services.read().await;
            let w = guard.get(service).expect("ensured above");
            (
                Arc::clone(&w.day),
                Arc::clone(&w.hour),
                Arc::clone(&w.minute),
                Arc::clone(&w.backoff),
            )
        };

        if backoff.load(Relaxed) {
            return Err(AppError::RateLimited { retry_after: None });
        }

        let cost = cost.max(1) as usize;
        const POLL_INTERVAL: Duration = Duration::from_millis(25);

        let wait_until_available = async {
            loop {
                if day.balance() >= cost && hour.balance() >= cost && minute.balance() >= cost {
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        };

        tokio::select! {
            _ = wait_until_available => {
                day.try_acquire(cost);
                hour.try_acquire(cost);
                minute.try_acquire(cost);
                Ok(())
            }
            _ = tokio::time::sleep(deadline) => Err(AppError::RateLimitTimeout),
            _ = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }

    pub async fn current_limit(&self, service: &str) -> Option<ServiceRateLimit> {
        self.services.read().await.get(service).map(|w| w.configured)
    }

    pub async fn update_limit(&self, service: &str, new_limit: ServiceRateLimit) {
        let mut guard = self.services.write().await;
        guard.insert(service.to_string(), Windows::new(new_limit));
    }

    /// Adaptive tuning driven by the caller's observed success rate:
    /// above 95% raise the per-minute target by 10%, below 80% lower by
    /// 10%, both bounded by the hard configured limits passed in as
    /// `hard_cap`.
    pub async fn adapt(&self, service: &str, success_rate: f32, hard_cap: u32) {
        let Some(current) = self.current_limit(service).await else {
            return;
        };
        let new_per_minute = if success_rate > 0.95 {
            ((current.per_minute as f32 * 1.1) as u32).min(hard_cap)
        } else if success_rate < 0.80 {
            ((current.per_minute as f32 * 0.9) as u32).max(1)
        } else {
            current.per_minute
        };
        if new_per_minute != current.per_minute {
            self.update_limit(
                service,
                ServiceRateLimit {
                    per_minute: new_per_minute,
                    ..current
                },
            )
            .await;
        }
    }

    /// Trips backoff for a service (e.g. on an upstream 429 with no
    /// `Retry-After`), mirroring the teacher's `trigger_backoff`.
    pub async fn trip_backoff(&self, service: &str, duration: Duration) {
        self.ensure_service(service).await;
        let backoff = {
            let guard = self.services.read().await;
            Arc::clone(&guard.get(service).expect("ensured above").backoff)
        };
        backoff.store(true, Relaxed);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            backoff.store(false, Relaxed);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_minute: u32) -> HashMap<String, ServiceRateLimit> {
        let mut m = HashMap::new();
        m.insert(
            "email_finder".to_string(),
            ServiceRateLimit {
                per_minute,
                per_hour: per_minute * 60,
                per_day: per_minute * 60 * 24,
                burst: per_minute,
            },
        );
        m
    }

    #[tokio::test]
    async fn acquire_succeeds_within_capacity() {
        let rl = RateLimiter::new(&limits(10));
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            rl.acquire("email_finder", 1, Duration::from_secs(1), &cancel)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn acquire_times_out_when_deadline_is_zero_and_bucket_empty() {
        let rl = RateLimiter::new(&limits(1));
        let cancel = CancellationToken::new();
        rl.acquire("email_finder", 1, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        let result = rl
            .acquire("email_finder", 1, Duration::from_millis(0), &cancel)
            .await;
        assert!(matches!(result, Err(AppError::RateLimitTimeout)));
    }

    #[tokio::test]
    async fn cancellation_is_honored_during_wait() {
        let rl = RateLimiter::new(&limits(1));
        let cancel = CancellationToken::new();
        rl.acquire("email_finder", 1, Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        cancel.cancel();
        let result = rl
            .acquire("email_finder", 1, Duration::from_secs(5), &cancel)
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
    }
}
