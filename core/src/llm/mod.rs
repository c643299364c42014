//! A single interface over multiple chat-completion backends (spec §4.C6).
//! Request/response envelope and provider registry are modeled closely on
//! `darval-multi-llm`'s `LlmProvider` trait and `UnifiedLLMRequest`, since
//! the teacher repo has only a single hardcoded Mistral call site and no
//! multi-backend abstraction of its own.

pub mod providers;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::LlmBackend;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseFormatHint {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub response_format_hint: ResponseFormatHint,
}

impl CompletionRequest {
    pub fn json(messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            max_tokens: None,
            response_format_hint: ResponseFormatHint::Json,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub success: bool,
    pub content: Option<String>,
    pub model: String,
    pub usage: Usage,
    pub finish_reason: String,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelInfo {
    pub models: Vec<String>,
    pub capabilities: Vec<String>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ConnectionTestResult {
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigValidation {
    pub ok: bool,
    pub errors: Vec<String>,
}

/// Every backend implements this single interface (spec §4.C6).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn validate_config(&self) -> ConfigValidation;
    /// Secrets redacted.
    fn safe_config(&self) -> HashMap<String, String>;
    fn model_info(&self) -> ModelInfo;
    async fn test_connection(&self) -> ConnectionTestResult;
    /// `cancel` is the campaign's root cancellation token; implementations
    /// must thread it through to the underlying HTTP call so a Stop/cancel
    /// mid-request is honored rather than running to completion regardless.
    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, AppError>;
}

enum ProviderSlot {
    Ready(Arc<dyn LlmProvider>),
    /// Instantiation failed; recorded so `validate_all_providers` can
    /// surface it without retrying every call.
    Unavailable(String),
}

/// Process-wide registry of configured providers, constructed once by the
/// `Runtime` and shared by reference (spec's "no global mutable singletons
/// beyond the registry" design note, §9). Providers are instantiated lazily
/// on first use.
pub struct Registry {
    factories: HashMap<String, Box<dyn Fn() -> Result<Arc<dyn LlmProvider>, String> + Send + Sync>>,
    slots: RwLock<HashMap<String, ProviderSlot>>,
    active: RwLock<String>,
}

impl Registry {
    pub fn new(default_active: impl Into<String>) -> Self {
        Self {
            factories: HashMap::new(),
            slots: RwLock::new(HashMap::new()),
            active: RwLock::new(default_active.into()),
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl Fn() -> Result<Arc<dyn LlmProvider>, String> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Atomically updates the active provider for subsequent requests;
    /// in-flight requests continue against whichever provider handle they
    /// already hold.
    pub async fn switch_active(&self, name: &str) {
        *self.active.write().await = name.to_string();
    }

    pub async fn active_name(&self) -> String {
        self.active.read().await.clone()
    }

    async fn resolve(&self, name: &str) -> Result<Arc<dyn LlmProvider>, AppError> {
        {
            let slots = self.slots.read().await;
            match slots.get(name) {
                Some(ProviderSlot::Ready(p)) => return Ok(Arc::clone(p)),
                Some(ProviderSlot::Unavailable(reason)) => {
                    return Err(AppError::Config(reason.clone()))
                }
                None => {}
            }
        }

        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| AppError::Config(format!("no provider registered for {name}")))?;

        let mut slots = self.slots.write().await;
        // re-check after acquiring the write lock in case another caller won the race
        if let Some(slot) = slots.get(name) {
            return match slot {
                ProviderSlot::Ready(p) => Ok(Arc::clone(p)),
                ProviderSlot::Unavailable(reason) => Err(AppError::Config(reason.clone())),
            };
        }

        match factory() {
            Ok(provider) => {
                slots.insert(name.to_string(), ProviderSlot::Ready(Arc::clone(&provider)));
                Ok(provider)
            }
            Err(reason) => {
                slots.insert(name.to_string(), ProviderSlot::Unavailable(reason.clone()));
                Err(AppError::Config(reason))
            }
        }
    }

    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, AppError> {
        let active = self.active_name().await;
        let provider = self.resolve(&active).await?;
        provider.complete(request, cancel).await
    }

    /// Attempts to instantiate every registered provider and validates its
    /// config, surfacing instantiation failures without panicking.
    pub async fn validate_all_providers(&self) -> HashMap<String, ConfigValidation> {
        let mut out = HashMap::new();
        let names: Vec<String> = self.factories.keys().cloned().collect();
        for name in names {
            match self.resolve(&name).await {
                Ok(provider) => {
                    out.insert(name, provider.validate_config());
                }
                Err(e) => {
                    out.insert(
                        name.clone(),
                        ConfigValidation {
                            ok: false,
                            errors: vec![e.to_string()],
                        },
                    );
                }
            }
        }
        out
    }
}

pub fn backend_name(backend: LlmBackend) -> &'static str {
    match backend {
        LlmBackend::OpenAi => "openai",
        LlmBackend::Anthropic => "anthropic",
        LlmBackend::Ollama => "ollama",
        LlmBackend::LmStudio => "lmstudio",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProvider {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LlmProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }
        fn validate_config(&self) -> ConfigValidation {
            ConfigValidation {
                ok: true,
                errors: vec![],
            }
        }
        fn safe_config(&self) -> HashMap<String, String> {
            HashMap::new()
        }
        fn model_info(&self) -> ModelInfo {
            ModelInfo::default()
        }
        async fn test_connection(&self) -> ConnectionTestResult {
            ConnectionTestResult {
                ok: true,
                detail: "ok".into(),
            }
        }
        async fn complete(
            &self,
            _: CompletionRequest,
            _: &CancellationToken,
        ) -> Result<CompletionResponse, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CompletionResponse {
                success: true,
                content: Some("{}".into()),
                model: "test".into(),
                usage: Usage::default(),
                finish_reason: "stop".into(),
                error_kind: None,
                error_message: None,
            })
        }
    }

    #[tokio::test]
    async fn instantiates_lazily_and_only_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let instantiations = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new("counting");
        let calls_for_factory = Arc::clone(&calls);
        let instantiations_clone = Arc::clone(&instantiations);
        registry.register("counting", move || {
            instantiations_clone.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingProvider {
                calls: Arc::clone(&calls_for_factory),
            }) as Arc<dyn LlmProvider>)
        });

        assert_eq!(instantiations.load(Ordering::SeqCst), 0);
        let cancel = CancellationToken::new();
        registry
            .complete(CompletionRequest::json(vec![]), &cancel)
            .await
            .unwrap();
        registry
            .complete(CompletionRequest::json(vec![]), &cancel)
            .await
            .unwrap();
        assert_eq!(instantiations.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn switching_active_provider_affects_subsequent_requests_only() {
        let mut registry = Registry::new("a");
        registry.register("a", || {
            Ok(Arc::new(CountingProvider {
                calls: Arc::new(AtomicU32::new(0)),
            }) as Arc<dyn LlmProvider>)
        });
        registry.register("b", || {
            Err::<Arc<dyn LlmProvider>, _>("b is unavailable".to_string())
        });

        let cancel = CancellationToken::new();
        assert!(registry
            .complete(CompletionRequest::json(vec![]), &cancel)
            .await
            .is_ok());
        registry.switch_active("b").await;
        assert!(registry
            .complete(CompletionRequest::json(vec![]), &cancel)
            .await
            .is_err());
    }
}
