//! Anthropic Messages API adapter: system prompt is a top-level field
//! rather than a message with `role: "system"`, and usage field names
//! differ from the OpenAI-compatible shape — hence a separate adapter
//! instead of folding it into `openai_compatible`.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::http_client::HttpClient;
use crate::llm::{
    CompletionRequest, CompletionResponse, ConfigValidation, ConnectionTestResult, LlmProvider,
    ModelInfo, Role, Usage,
};

const SERVICE_NAME: &str = "llm";

pub struct AnthropicProvider {
    http: Arc<HttpClient>,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
}

impl AnthropicProvider {
    pub fn new(
        http: Arc<HttpClient>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
            default_model: default_model.into(),
        }
    }
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ContentBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn validate_config(&self) -> ConfigValidation {
        let mut errors = Vec::new();
        if self.api_key.is_none() {
            errors.push("anthropic: api key is required".into());
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
            capabilities: vec!["chat".into()],
            max_tokens: 200_000,
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
                    response_format_hint: crate::llm::ResponseFormatHint::Text,
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
        let system = request
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());

        let messages: Vec<AnthropicMessage> = request
            .messages
            .into_iter()
            .filter(|m| m.role != Role::System)
            .map(|m| AnthropicMessage {
                role: if m.role == Role::Assistant { "assistant" } else { "user" },
                content: m.content,
            })
            .collect();

        let body = AnthropicRequest {
            model: request.model.unwrap_or_else(|| self.default_model.clone()),
            system,
            messages,
            max_tokens: request.max_tokens.unwrap_or(1024),
            temperature: request.temperature,
        };

        let key = self
            .api_key
            .as_ref()
            .ok_or_else(|| AppError::Auth("anthropic api key not configured".into()))?
            .clone();

        let resp = self
            .http
            .execute(
                SERVICE_NAME,
                Method::POST,
                &format!("{}/v1/messages", self.base_url),
                |b| {
                    b.header("x-api-key", &key)
                        .header("anthropic-version", "2023-06-01")
                        .json(&body)
                },
                cancel,
            )
            .await?;
        let resp: AnthropicResponse = resp.json().await?;

        let content = resp.content.into_iter().find_map(|b| b.text);

        Ok(CompletionResponse {
            success: true,
            content,
            model: self.default_model.clone(),
            usage: Usage {
                prompt_tokens: resp.usage.input_tokens,
                completion_tokens: resp.usage.output_tokens,
            },
            finish_reason: resp.stop_reason.unwrap_or_else(|| "end_turn".into()),
            error_kind: None,
            error_message: None,
        })
    }
}
