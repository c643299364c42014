//! Bounded pool of headless browser sessions for JS-rendered pages (spec
//! §4.C5). Used only when `Scrapers` decides HTTP-only retrieval is
//! insufficient.

use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::error::AppError;

struct PooledBrowser {
    browser: Browser,
    owner: Mutex<Option<(String, Instant)>>,
    /// Set once by `reap_idle` (past the watchdog threshold) or by a failed
    /// `release`; a poisoned browser is never requeued and its permit is
    /// forgotten rather than returned, since a replacement permit was
    /// already granted at the point of poisoning.
    poisoned: AtomicBool,
}

pub struct BrowserPool {
    permits: Arc<Semaphore>,
    size: usize,
    /// Every browser ever launched, for the lifetime of the pool — checked
    /// out or idle. `reap_idle` needs to see checked-out sessions too, so
    /// this must not shrink when a session is acquired.
    all: Mutex<Vec<Arc<PooledBrowser>>>,
    /// Free list `acquire` pops from and `release` pushes back onto.
    idle: Mutex<Vec<Arc<PooledBrowser>>>,
    idle_watchdog_threshold: Duration,
    outstanding: AtomicUsize,
}

pub struct Session {
    browser: Arc<PooledBrowser>,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

pub struct LoadHints {
    pub disable_images: bool,
    pub disable_javascript: bool,
}

impl Default for LoadHints {
    fn default() -> Self {
        Self {
            disable_images: false,
            disable_javascript: false,
        }
    }
}

impl BrowserPool {
    pub fn new(size: usize, idle_watchdog_threshold: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            all: Mutex::new(Vec::new()),
            idle: Mutex::new(Vec::new()),
            idle_watchdog_threshold,
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Outstanding sessions + idle sessions never exceed pool size: the
    /// semaphore enforces that directly.
    pub async fn acquire(&self, owner: &str, deadline: Duration) -> Result<Session, AppError> {
        let permit = tokio::time::timeout(deadline, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| AppError::Transient("browser pool acquire timed out".into()))?
            .map_err(|_| AppError::Permanent("browser pool closed".into()))?;

        let browser = {
            let mut idle = self.idle.lock().unwrap();
            if let Some(b) = idle.pop() {
                b
            } else {
                let browser = Browser::new(
                    LaunchOptionsBuilder::default()
                        .headless(true)
                        .build()
                        .map_err(|e| AppError::Permanent(format!("browser launch options: {e}")))?,
                )
                .map_err(|e| AppError::Transient(format!("browser launch failed: {e}")))?;
                let browser = Arc::new(PooledBrowser {
                    browser,
                    owner: Mutex::new(None),
                    poisoned: AtomicBool::new(false),
                });
                self.all.lock().unwrap().push(Arc::clone(&browser));
                browser
            }
        };
        *browser.owner.lock().unwrap() = Some((owner.to_string(), Instant::now()));
        self.outstanding.fetch_add(1, Relaxed);

        Ok(Session {
            browser,
            permit: Some(permit),
        })
    }

    /// Forcibly reclaims every checked-out session held past the idle
    /// watchdog threshold: the browser is poisoned (never requeued once its
    /// owning task eventually calls `release`) and a replacement permit is
    /// granted immediately so a new session can be acquired without waiting
    /// on the stuck owner.
    pub fn reap_idle(&self) {
        let guard = self.all.lock().unwrap();
        for b in guard.iter() {
            let mut owner_guard = b.owner.lock().unwrap();
            if let Some((owner, since)) = owner_guard.clone() {
                if since.elapsed() > self.idle_watchdog_threshold && !b.poisoned.swap(true, Relaxed) {
                    tracing::warn!(owner, "browser session past watchdog threshold, force-reclaiming");
                    *owner_guard = None;
                    self.outstanding.fetch_sub(1, Relaxed);
                    self.permits.add_permits(1);
                }
            }
        }
    }

    /// Returns a session to the pool. `healthy` should be false whenever the
    /// caller's use of the session hit an error (crashed tab, failed
    /// navigate/read) — such a session is destroyed rather than requeued, the
    /// same as one poisoned by `reap_idle` past the watchdog threshold.
    pub fn release(&self, mut session: Session, healthy: bool) {
        let poisoned = session.browser.poisoned.load(Relaxed);
        if !poisoned {
            *session.browser.owner.lock().unwrap() = None;
            self.outstanding.fetch_sub(1, Relaxed);
        }

        if healthy && !poisoned {
            self.idle.lock().unwrap().push(Arc::clone(&session.browser));
            session.permit.take();
            return;
        }

        self.all.lock().unwrap().retain(|b| !Arc::ptr_eq(b, &session.browser));
        if poisoned {
            // reap_idle already granted a replacement permit for this
            // session; forget this one instead of returning it so total
            // capacity doesn't grow past `size`.
            if let Some(permit) = session.permit.take() {
                permit.forget();
            }
        } else {
            session.permit.take();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Relaxed)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Session {
    pub fn load(&self, url: &str, hints: &LoadHints, timeout: Duration) -> Result<Arc<Tab>, AppError> {
        let tab = self
            .browser
            .browser
            .new_tab()
            .map_err(|e| AppError::Transient(format!("new tab failed: {e}")))?;
        // disable_images / disable_javascript are best-effort hints handled
        // by the caller's page-load wait strategy; unsupported sites simply
        // render slower rather than failing outright.
        let _ = (hints.disable_images, hints.disable_javascript);
        tab.set_default_timeout(timeout);
        tab.navigate_to(url)
            .map_err(|e| AppError::Transient(format!("navigate failed: {e}")))?;
        tab.wait_until_navigated()
            .map_err(|e| AppError::Transient(format!("navigation wait failed: {e}")))?;
        Ok(tab)
    }

    pub fn html(&self, tab: &Arc<Tab>) -> Result<String, AppError> {
        tab.get_content()
            .map_err(|e| AppError::Transient(format!("could not read rendered html: {e}")))
    }
}
