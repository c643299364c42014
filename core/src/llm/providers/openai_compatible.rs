//! OpenAI-compatible chat-completions adapter. Ollama and LM Studio both
//! speak this same wire format (`darval-multi-llm`'s `ollama.rs` leans on
//! the same fact — "Ollama uses OpenAI-compatible API"), so one adapter
//! serves all three backends, parameterized by base URL and model.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::http_client::HttpClient;
use crate::llm::{
    CompletionRequest, CompletionResponse, ConfigValidation, ConnectionTestResult, LlmProvider,
    ModelInfo, ResponseFormatHint, Role, Usage,
};

const SERVICE_NAME: &str = "llm";

pub struct OpenAiCompatibleProvider {
    name: &'static str,
    http: Arc<HttpClient>,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        name: &'static str,
        http: Arc<HttpClient>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            name,
            http,
            base_url: base_url.into(),
            api_key,
            default_model: default_model.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut errors = Vec::new();
        if self.base_url.is_empty() {
            errors.push(format!("{}: base_url is required", self.name));
        }
        ConfigValidation {
            ok: errors.is_empty(),
            errors,
        }
    }

    fn safe_config(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("base_url".into(), self.base_url.clone());
        map.insert("model".into(), self.default_model.clone());
        map.insert(
            "api_key".into(),
            self.api_key.as_ref().map(|_| "***redacted***".into()).unwrap_or_default(),
        );
        map
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            models: vec![self.default_model.clone()],
            capabilities: vec!["chat".into(), "json_mode".into()],
            max_tokens: 128_000,
        }
    }

    async fn test_connection(&self) -> ConnectionTestResult {
        match self
            .complete(
                CompletionRequest {
                    messages: vec![crate::llm::Message {
                        role: Role::User,
                        content: "ping".into(),
                    }],
                    model: None,
                    temperature: Some(0.0),
                    max_tokens: Some(1),
                    response_format_hint: ResponseFormatHint::Text,
                },
                &CancellationToken::new(),
            )
            .await
        {
            Ok(_) => ConnectionTestResult {
                ok: true,
                detail: "connected".into(),
            },
            Err(e) => ConnectionTestResult {
                ok: false,
                detail: e.to_string(),
            },
        }
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, AppError> {
        let body = ChatRequest {
            model: request.model.clone().unwrap_or_else(|| self.default_model.clone()),
            messages: request
                .messages
                .into_iter()
                .map(|m| ChatMessage {
                    role: role_str(m.role),
                    content: m.content,
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: matches!(request.response_format_hint, ResponseFormatHint::Json)
                .then(|| json!({"type": "json_object"})),
        };

        let api_key = self.api_key.clone();
        let resp = self
            .http
            .execute(
                SERVICE_NAME,
                Method::POST,
                &format!("{}/v1/chat/completions", self.base_url),
                |b| {
                    let b = b.json(&body);
                    match &api_key {
                        Some(key) => b.bearer_auth(key),
                        None => b,
                    }
                },
                cancel,
            )
            .await?;
        let resp: ChatResponse = resp.json().await?;

        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Parse("empty choices array".into()))?;

        Ok(CompletionResponse {
            success: true,
            content: choice.message.content,
            model: self.default_model.clone(),
            usage: Usage {
                prompt_tokens: resp.usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
                completion_tokens: resp.usage.and_then(|u| u.completion_tokens).unwrap_or(0),
            },
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".into()),
            error_kind: None,
            error_message: None,
        })
    }
}
