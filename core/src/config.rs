//! Typed configuration (spec §4.C1). Loaded once from a `config.toml` plus
//! environment-variable overrides, validated into an immutable `Config`.
//! There is no "reload" API — callers re-construct a new `Config` instead.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawConfig {
    pub credentials: Credentials,
    pub llm: LlmConfig,
    pub rate_limits: HashMap<String, ServiceRateLimit>,
    pub cache: CacheConfig,
    pub worker_pool: WorkerPoolConfig,
    pub email_policy: EmailPolicyConfig,
    pub features: FeatureToggles,
    pub scraper: ScraperConfig,
    pub scraping_delay_s: Option<f64>,
    pub control_check_interval_s: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Credentials {
    pub email_finder_api_key: Option<String>,
    pub email_finder_base_url: Option<String>,
    pub email_sender_api_key: Option<String>,
    pub email_sender_base_url: Option<String>,
    pub store_api_key: Option<String>,
    pub store_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    /// Operators who don't want an API key sitting in plaintext in
    /// `config.toml` may instead commit the output of `lib-utils`' `encrypt`
    /// here; `Config::from_raw` decrypts it into `store_api_key` at load
    /// time using `SERVICE_ENCRYPT_KEY`. Unset by default — nothing touches
    /// the encryption key unless this field is present.
    pub store_api_key_encrypted: Option<String>,
    pub llm_api_key_encrypted: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    OpenAi,
    Anthropic,
    Ollama,
    LmStudio,
}

impl Default for LlmBackend {
    fn default() -> Self {
        LlmBackend::OpenAi
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub model: String,
    /// Overrides the backend's default API base URL; required for
    /// `Ollama`/`LmStudio` local deployments, optional for hosted backends.
    pub base_url: Option<String>,
    pub max_output_words: usize,
    pub personalization_floor: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::OpenAi,
            model: "gpt-4o-mini".into(),
            base_url: None,
            max_output_words: 250,
            personalization_floor: 0.35,
        }
    }
}

impl LlmConfig {
    /// Each backend's hosted default; `Ollama`/`LmStudio` assume a local
    /// daemon on the conventional port.
    pub fn resolved_base_url(&self) -> String {
        self.base_url.clone().unwrap_or_else(|| {
            match self.backend {
                LlmBackend::OpenAi => "https://api.openai.com",
                LlmBackend::Anthropic => "https://api.anthropic.com",
                LlmBackend::Ollama => "http://localhost:11434",
                LlmBackend::LmStudio => "http://localhost:1234",
            }
            .to_string()
        })
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ServiceRateLimit {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
    pub burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub memory_max_entries: usize,
    pub memory_max_mb: usize,
    pub persistent_dir: String,
    pub default_ttl_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_max_entries: 1000,
            memory_max_mb: 100,
            persistent_dir: ".cache".into(),
            default_ttl_s: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub max_workers: usize,
    pub batch_size: usize,
    pub delay_between_batches_s: u64,
    pub per_stage_timeout_s: u64,
    pub retry_budget: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            batch_size: 5,
            delay_between_batches_s: 30,
            per_stage_timeout_s: 30,
            retry_budget: 3,
        }
    }
}

/// HTML-parsing heuristics for a concrete source are deliberately
/// configuration, not code (spec.md's explicit non-goal) — selectors are
/// supplied per deployment rather than hardcoded per site.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    pub product_feed_url: String,
    pub feed_page_size: usize,
    pub feed_item_selector: String,
    pub feed_name_selector: String,
    pub feed_link_selector: String,
    pub team_member_selector: String,
    pub team_name_selector: String,
    pub team_role_selector: String,
    pub team_profile_link_selector: String,
    pub profile_search_endpoint: Option<String>,
    pub browser_pool_size: usize,
    pub browser_idle_watchdog_s: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            product_feed_url: String::new(),
            feed_page_size: 20,
            feed_item_selector: "div.launch-item".into(),
            feed_name_selector: "h3.name".into(),
            feed_link_selector: "a.product-link".into(),
            team_member_selector: "div.team-member".into(),
            team_name_selector: "h4.name".into(),
            team_role_selector: "span.role".into(),
            team_profile_link_selector: "a.profile-link".into(),
            profile_search_endpoint: None,
            browser_pool_size: 3,
            browser_idle_watchdog_s: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EmailPolicyConfig {
    pub auto_send_emails: bool,
    pub email_review_required: bool,
    pub sender_identity: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FeatureToggles {
    pub ai_parsing: bool,
    pub product_analysis: bool,
    pub enhanced_personalization: bool,
    pub interactive_controls: bool,
    pub notifications: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            ai_parsing: true,
            product_analysis: true,
            enhanced_personalization: false,
            interactive_controls: true,
            notifications: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The validated, immutable configuration. Construct via `Config::load` or
/// `Config::from_raw`; there is no in-place mutation.
#[derive(Debug, Clone)]
pub struct Config {
    raw: RawConfig,
}

impl Config {
    /// Loads from `config.toml` in the current directory (if present),
    /// layered under environment variables (`LAUNCHSCOUT__*`, double
    /// underscore separated), matching the teacher's `config` crate usage.
    pub fn load() -> Result<Self, Vec<ConfigError>> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("LAUNCHSCOUT")
                    .separator("__")
                    .try_parsing(true),
            );

        let built = builder
            .build()
            .map_err(|e| vec![ConfigError(e.to_string())])?;

        let raw: RawConfig = built
            .try_deserialize()
            .map_err(|e| vec![ConfigError(format!("invalid configuration: {e}"))])?;

        Self::from_raw(raw)
    }

    pub fn from_raw(mut raw: RawConfig) -> Result<Self, Vec<ConfigError>> {
        let mut errors = validate(&raw);

        if let Some(encrypted) = raw.credentials.store_api_key_encrypted.take() {
            match lib_utils::crypt::decrypt(&encrypted) {
                Ok(plain) => raw.credentials.store_api_key = Some(plain),
                Err(e) => errors.push(ConfigError(format!(
                    "failed to decrypt credentials.store_api_key_encrypted: {e}"
                ))),
            }
        }
        if let Some(encrypted) = raw.credentials.llm_api_key_encrypted.take() {
            match lib_utils::crypt::decrypt(&encrypted) {
                Ok(plain) => raw.credentials.llm_api_key = Some(plain),
                Err(e) => errors.push(ConfigError(format!(
                    "failed to decrypt credentials.llm_api_key_encrypted: {e}"
                ))),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self { raw })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.raw.credentials
    }

    pub fn llm(&self) -> &LlmConfig {
        &self.raw.llm
    }

    pub fn rate_limits(&self) -> &HashMap<String, ServiceRateLimit> {
        &self.raw.rate_limits
    }

    pub fn cache(&self) -> &CacheConfig {
        &self.raw.cache
    }

    pub fn worker_pool(&self) -> &WorkerPoolConfig {
        &self.raw.worker_pool
    }

    pub fn email_policy(&self) -> &EmailPolicyConfig {
        &self.raw.email_policy
    }

    pub fn features(&self) -> &FeatureToggles {
        &self.raw.features
    }

    pub fn scraper(&self) -> &ScraperConfig {
        &self.raw.scraper
    }

    pub fn scraping_delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.raw.scraping_delay_s.unwrap_or(0.3))
    }

    pub fn control_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.raw.control_check_interval_s.unwrap_or(30))
    }

    pub fn email_finder_enabled(&self) -> bool {
        self.raw.credentials.email_finder_api_key.is_some()
    }

    pub fn email_sender_enabled(&self) -> bool {
        self.raw.credentials.email_sender_api_key.is_some()
    }
}

/// Pure; no side effects. Returns every error found, not just the first.
fn validate(raw: &RawConfig) -> Vec<ConfigError> {
    let mut errors = Vec::new();

    if raw.worker_pool.max_workers == 0 {
        errors.push(ConfigError(
            "worker_pool.max_workers must be at least 1".into(),
        ));
    }
    if raw.cache.enabled && raw.cache.memory_max_entries == 0 {
        errors.push(ConfigError(
            "cache.memory_max_entries must be at least 1 when cache is enabled".into(),
        ));
    }
    if raw.llm.personalization_floor < 0.0 || raw.llm.personalization_floor > 1.0 {
        errors.push(ConfigError(
            "llm.personalization_floor must be within [0, 1]".into(),
        ));
    }
    if raw.credentials.store_base_url.is_none() {
        errors.push(ConfigError(
            "credentials.store_base_url is required — the document database adapter has no default".into(),
        ));
    }
    if raw.scraper.product_feed_url.is_empty() {
        errors.push(ConfigError(
            "scraper.product_feed_url is required — there is no default product-launch listing".into(),
        ));
    }
    if raw.scraper.browser_pool_size == 0 {
        errors.push(ConfigError(
            "scraper.browser_pool_size must be at least 1".into(),
        ));
    }
    if raw.email_policy.auto_send_emails && raw.credentials.email_sender_api_key.is_none() {
        errors.push(ConfigError(
            "email_policy.auto_send_emails requires credentials.email_sender_api_key".into(),
        ));
    }
    for (service, limit) in &raw.rate_limits {
        if limit.per_minute == 0 {
            errors.push(ConfigError(format!(
                "rate_limits.{service}.per_minute must be at least 1"
            )));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_reports_every_error_not_just_first() {
        let mut raw = RawConfig::default();
        raw.worker_pool.max_workers = 0;
        raw.llm.personalization_floor = 2.0;
        raw.credentials.store_base_url = None;

        let errors = validate(&raw);
        assert!(errors.len() >= 3, "expected multiple errors, got {errors:?}");
    }

    #[test]
    fn validate_passes_with_sane_defaults_and_store_url() {
        let mut raw = RawConfig::default();
        raw.credentials.store_base_url = Some("https://store.example.com".into());
        raw.scraper.product_feed_url = "https://launches.example.com".into();
        assert!(validate(&raw).is_empty());
    }

    #[test]
    fn resolved_base_url_falls_back_to_backend_default() {
        let cfg = LlmConfig {
            backend: LlmBackend::Ollama,
            ..LlmConfig::default()
        };
        assert_eq!(cfg.resolved_base_url(), "http://localhost:11434");
    }

    #[test]
    fn from_raw_leaves_api_keys_untouched_when_no_encrypted_value_present() {
        let mut raw = RawConfig::default();
        raw.credentials.store_base_url = Some("https://store.example.com".into());
        raw.credentials.store_api_key = Some("plaintext-key".into());
        raw.scraper.product_feed_url = "https://launches.example.com".into();

        let cfg = Config::from_raw(raw).expect("valid config");
        assert_eq!(cfg.credentials().store_api_key.as_deref(), Some("plaintext-key"));
        assert!(cfg.credentials().llm_api_key.is_none());
    }
}
