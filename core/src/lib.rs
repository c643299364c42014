//! Company-launch prospecting pipeline: discovery, enrichment, outreach
//! generation, and send, behind a single [`Runtime`] handle.
//!
//! There are no global mutable singletons beyond the LLM [`llm::Registry`]
//! (spec §9's explicit design note) — every subsystem is constructed once by
//! [`Runtime::new`] from a [`Config`] and shared by `Arc` reference from
//! there on.

pub mod ai_service;
pub mod browser_pool;
pub mod cache;
pub mod config;
pub mod domain;
pub mod email_finder;
pub mod email_sender;
pub mod error;
pub mod http_client;
pub mod llm;
pub mod notifier;
pub mod orchestrator;
pub mod rate_limiter;
pub mod scrapers;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ai_service::AiService;
use browser_pool::BrowserPool;
use cache::Cache;
use config::{Config, LlmBackend};
use email_finder::EmailFinder;
use email_sender::EmailSender;
use error::AppError;
use http_client::HttpClient;
use llm::providers::{AnthropicProvider, OpenAiCompatibleProvider};
use llm::{backend_name, Registry};
use notifier::Notifier;
use orchestrator::Orchestrator;
use rate_limiter::RateLimiter;
use scrapers::{HeuristicProfileFinder, HttpProductFeed, HttpTeamExtractor};
use store::{HttpDocumentStore, Store};

/// Every constructed subsystem, referenced by handle rather than duplicated.
/// Build once per process (or once per test) from a validated [`Config`].
pub struct Runtime {
    pub config: Arc<Config>,
    pub cache: Arc<Cache>,
    pub http: Arc<HttpClient>,
    pub browser_pool: Arc<BrowserPool>,
    pub llm_registry: Arc<Registry>,
    pub ai: Arc<AiService>,
    pub store: Arc<dyn Store>,
    pub notifier: Arc<Notifier>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Runtime {
    /// Wires every subsystem from `config`. The LLM registry registers a
    /// factory per supported backend but instantiates none of them until
    /// first use (spec §4.C6) — an unreachable LLM endpoint only surfaces as
    /// an error on the first request that needs it, not at startup.
    pub fn new(config: Config) -> Result<Self, AppError> {
        let config = Arc::new(config);

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits()));
        let http = Arc::new(HttpClient::new(
            Arc::clone(&rate_limiter),
            Duration::from_secs(config.worker_pool().per_stage_timeout_s),
            config.worker_pool().retry_budget,
        ));
        let browser_pool = Arc::new(BrowserPool::new(
            config.scraper().browser_pool_size,
            Duration::from_secs(config.scraper().browser_idle_watchdog_s),
        ));
        spawn_browser_pool_watchdog(Arc::clone(&browser_pool));
        let cache = Arc::new(Cache::new(
            config.cache().enabled,
            config.cache().memory_max_entries,
            config.cache().memory_max_mb,
            config.cache().persistent_dir.clone(),
            Duration::from_secs(config.cache().default_ttl_s),
        ));

        let llm_registry = Arc::new(build_llm_registry(&config, &http));
        let ai = Arc::new(AiService::new(
            Arc::clone(&llm_registry),
            Arc::clone(&cache),
            config.llm().max_output_words,
            config.llm().personalization_floor,
        ));

        let store_base_url = config
            .credentials()
            .store_base_url
            .clone()
            .ok_or_else(|| AppError::Config("credentials.store_base_url is required".into()))?;
        let store: Arc<dyn Store> = Arc::new(HttpDocumentStore::new(
            Arc::clone(&http),
            Arc::clone(&cache),
            store_base_url,
            config.credentials().store_api_key.clone().unwrap_or_default(),
            CancellationToken::new(),
        ));

        let feed = Arc::new(HttpProductFeed::new(
            Arc::clone(&http),
            Arc::clone(&browser_pool),
            config.scraper().product_feed_url.clone(),
            config.scraper().feed_page_size,
            config.scraper().feed_item_selector.clone(),
            config.scraper().feed_name_selector.clone(),
            config.scraper().feed_link_selector.clone(),
        ));
        let team_extractor = Arc::new(HttpTeamExtractor::new(
            Arc::clone(&http),
            Arc::clone(&browser_pool),
            config.scraper().team_member_selector.clone(),
            config.scraper().team_name_selector.clone(),
            config.scraper().team_role_selector.clone(),
            config.scraper().team_profile_link_selector.clone(),
        ));
        let profile_finder = Arc::new(HeuristicProfileFinder::new(
            Arc::clone(&http),
            Arc::clone(&cache),
            config.scraper().profile_search_endpoint.clone(),
        ));

        let email_finder = config.email_finder_enabled().then(|| {
            Arc::new(EmailFinder::new(
                Arc::clone(&http),
                config.credentials().email_finder_base_url.clone().unwrap_or_default(),
                config
                    .credentials()
                    .email_finder_api_key
                    .clone()
                    .unwrap_or_default(),
            ))
        });
        let email_sender = config.email_sender_enabled().then(|| {
            Arc::new(EmailSender::new(
                Arc::clone(&http),
                config.credentials().email_sender_base_url.clone().unwrap_or_default(),
                config
                    .credentials()
                    .email_sender_api_key
                    .clone()
                    .unwrap_or_default(),
            ))
        });

        let notifier = Arc::new(Notifier::new(Arc::clone(&store)));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&config),
            Arc::clone(&http),
            Arc::clone(&browser_pool),
            Arc::clone(&ai),
            feed,
            team_extractor,
            profile_finder,
            email_finder,
            email_sender,
            Arc::clone(&store),
            Arc::clone(&notifier),
        ));

        Ok(Self {
            config,
            cache,
            http,
            browser_pool,
            llm_registry,
            ai,
            store,
            notifier,
            orchestrator,
        })
    }
}

fn build_llm_registry(config: &Config, http: &Arc<HttpClient>) -> Registry {
    let mut registry = Registry::new(backend_name(config.llm().backend));

    let api_key = config.credentials().llm_api_key.clone();
    let model = config.llm().model.clone();

    {
        let base_url = config.llm().resolved_base_url();
        let api_key = api_key.clone();
        let model = model.clone();
        let http_for_anthropic = Arc::clone(http);
        registry.register("anthropic", move || {
            Ok(Arc::new(AnthropicProvider::new(
                Arc::clone(&http_for_anthropic),
                base_url.clone(),
                api_key.clone(),
                model.clone(),
            )) as Arc<dyn llm::LlmProvider>)
        });
    }

    for backend in [LlmBackend::OpenAi, LlmBackend::Ollama, LlmBackend::LmStudio] {
        let name = backend_name(backend);
        let base_url = if backend == config.llm().backend {
            config.llm().resolved_base_url()
        } else {
            default_base_url_for(backend)
        };
        let api_key = api_key.clone();
        let model = model.clone();
        let http_for_backend = Arc::clone(http);
        registry.register(name, move || {
            Ok(Arc::new(OpenAiCompatibleProvider::new(
                name,
                Arc::clone(&http_for_backend),
                base_url.clone(),
                api_key.clone(),
                model.clone(),
            )) as Arc<dyn llm::LlmProvider>)
        });
    }

    registry
}

/// Runs `BrowserPool::reap_idle` on a fixed tick for the lifetime of the
/// process — the idle-owner watchdog the spec calls for (§4.C5) only warns
/// if something drives it periodically.
fn spawn_browser_pool_watchdog(pool: Arc<BrowserPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        loop {
            ticker.tick().await;
            pool.reap_idle();
        }
    });
}

fn default_base_url_for(backend: LlmBackend) -> String {
    match backend {
        LlmBackend::OpenAi => "https://api.openai.com",
        LlmBackend::Anthropic => "https://api.anthropic.com",
        LlmBackend::Ollama => "http://localhost:11434",
        LlmBackend::LmStudio => "http://localhost:1234",
    }
    .to_string()
}
