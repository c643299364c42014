//! High-level AI operations composed from the LLM registry and cache
//! (§4.C7). Every operation returns the same envelope shape so callers in
//! the orchestrator pipeline can handle success/failure uniformly, the way
//! the teacher's `prompt::mistral` call sites return a single `Result` type
//! reused across every prompt — generalized here into an explicit struct
//! since there are three distinct operations instead of one.

use blake3::hash;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::Cache;
use crate::domain::prospect::Prospect;
use crate::llm::{CompletionRequest, Message, Registry, ResponseFormatHint, Role};

const AI_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub data: Option<T>,
    pub confidence_score: f32,
    pub cached: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl<T> Envelope<T> {
    fn ok(data: T, confidence_score: f32, cached: bool) -> Self {
        Self {
            success: true,
            data: Some(data),
            confidence_score,
            cached,
            error_kind: None,
            error_message: None,
        }
    }

    fn fail(kind: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            confidence_score: 0.0,
            cached: false,
            error_kind: Some(kind.to_string()),
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedProfile {
    pub name: String,
    pub current_role: String,
    pub experience: Vec<String>,
    pub skills: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileFallback {
    pub name: Option<String>,
    pub current_role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Pricing {
    pub model: String,
    pub tiers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MarketAnalysis {
    pub target_market: String,
    pub competitors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusinessMetrics {
    pub funding_stage: Option<String>,
    pub team_size: Option<String>,
    pub founded_year: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductAnalysis {
    pub name: String,
    pub category: String,
    pub description: String,
    pub features: Vec<String>,
    pub pricing: Pricing,
    pub market_analysis: MarketAnalysis,
    pub business_metrics: BusinessMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    ColdOutreach,
    Referral,
    ProductInterest,
    Networking,
    FollowUp,
}

impl EmailTemplate {
    fn instruction(self) -> &'static str {
        match self {
            EmailTemplate::ColdOutreach => "a concise cold outreach email",
            EmailTemplate::Referral => "an email referencing a mutual connection or referral",
            EmailTemplate::ProductInterest => "an email expressing specific interest in their product",
            EmailTemplate::Networking => "a networking-oriented, low-pressure email",
            EmailTemplate::FollowUp => "a brief follow-up email to a prior outreach",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedEmail {
    pub subject: String,
    pub body: String,
    pub personalization_score: f32,
}

pub struct AiService {
    registry: Arc<Registry>,
    cache: Arc<Cache>,
    max_output_words: usize,
    personalization_floor: f32,
}

impl AiService {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<Cache>,
        max_output_words: usize,
        personalization_floor: f32,
    ) -> Self {
        Self {
            registry,
            cache,
            max_output_words,
            personalization_floor,
        }
    }

    fn cache_key(op: &str, input: &str) -> String {
        format!("ai:{op}:{}", hash(input.as_bytes()).to_hex())
    }

    /// Every operation is served through `Cache::get_or_compute` keyed by
    /// operation + input hash (spec §4.C7), so concurrent duplicate calls
    /// coalesce onto a single LLM round trip rather than each paying for
    /// their own completion.
    pub async fn parse_profile(
        &self,
        raw_html: &str,
        fallback: Option<ProfileFallback>,
        cancel: &CancellationToken,
    ) -> Envelope<ParsedProfile> {
        let key = Self::cache_key("parse_profile", raw_html);
        let registry = Arc::clone(&self.registry);
        let html = raw_html.to_string();
        let cancel = cancel.clone();

        let result = self
            .cache
            .get_or_compute(&key, AI_CACHE_TTL, move || async move {
                parse_profile_via_llm(&registry, &html, fallback, &cancel).await
            })
            .await;

        match result {
            Ok((profile, cached)) => Envelope::ok(profile, if cached { 0.8 } else { 0.75 }, cached),
            Err(e) => Envelope::fail("parse", e),
        }
    }

    pub async fn analyze_product(&self, text: &str, cancel: &CancellationToken) -> Envelope<ProductAnalysis> {
        let key = Self::cache_key("analyze_product", text);
        let registry = Arc::clone(&self.registry);
        let text = text.to_string();
        let cancel = cancel.clone();

        let result = self
            .cache
            .get_or_compute(&key, AI_CACHE_TTL, move || async move {
                analyze_product_via_llm(&registry, &text, &cancel).await
            })
            .await;

        match result {
            Ok((analysis, cached)) => Envelope::ok(analysis, if cached { 0.8 } else { 0.75 }, cached),
            Err(e) => Envelope::fail("parse", e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn generate_email(
        &self,
        prospect: &Prospect,
        template: EmailTemplate,
        linkedin_profile: Option<&ParsedProfile>,
        product_analysis: Option<&ProductAnalysis>,
        sender_profile: Option<&str>,
        extra_context: Option<&str>,
        cancel: &CancellationToken,
    ) -> Envelope<GeneratedEmail> {
        let cache_input = format!(
            "{:?}|{}|{}|{}|{:?}|{:?}|{:?}|{:?}",
            template,
            prospect.name,
            prospect.role,
            prospect.company,
            linkedin_profile.map(|p| &p.summary),
            product_analysis.map(|p| &p.description),
            sender_profile,
            extra_context,
        );
        let key = Self::cache_key("generate_email", &cache_input);
        let registry = Arc::clone(&self.registry);
        let prompt = build_email_prompt(
            template,
            prospect,
            linkedin_profile,
            product_analysis,
            sender_profile,
            extra_context,
        );
        let cancel = cancel.clone();

        let raw = self
            .cache
            .get_or_compute(&key, AI_CACHE_TTL, move || async move {
                generate_email_via_llm(&registry, prompt, &cancel).await
            })
            .await;

        let (raw, _cached) = match raw {
            Ok(v) => v,
            Err(e) => return Envelope::fail("parse", e),
        };

        let word_count = raw.body.split_whitespace().count();
        if word_count > self.max_output_words {
            return Envelope::fail(
                "parse",
                format!("generated body has {word_count} words, exceeds configured max {}", self.max_output_words),
            );
        }

        let personalization_score = score_personalization(&raw.body, prospect);

        if personalization_score < self.personalization_floor {
            let mut envelope = Envelope::fail(
                "low_personalization",
                format!("personalization score {personalization_score} below floor {}", self.personalization_floor),
            );
            envelope.data = Some(GeneratedEmail {
                subject: raw.subject,
                body: raw.body,
                personalization_score,
            });
            return envelope;
        }

        Envelope::ok(
            GeneratedEmail {
                subject: raw.subject,
                body: raw.body,
                personalization_score,
            },
            personalization_score,
            false,
        )
    }
}

/// Sends the request; if the response content doesn't parse as JSON,
/// retries exactly once with `response_format_hint = Json`.
async fn complete_json(
    registry: &Registry,
    messages: Vec<Message>,
    cancel: &CancellationToken,
) -> Result<Value, String> {
    let request = CompletionRequest::json(messages.clone());
    let first = registry.complete(request, cancel).await.map_err(|e| e.to_string())?;

    if let Some(content) = &first.content {
        if let Ok(value) = serde_json::from_str::<Value>(content) {
            return Ok(value);
        }
    }

    let mut retry_messages = messages;
    retry_messages.push(Message {
        role: Role::User,
        content: "Your previous response was not valid JSON. Respond with valid JSON only.".into(),
    });
    let retry = registry
        .complete(
            CompletionRequest {
                response_format_hint: ResponseFormatHint::Json,
                ..CompletionRequest::json(retry_messages)
            },
            cancel,
        )
        .await
        .map_err(|e| e.to_string())?;

    let content = retry.content.ok_or_else(|| "empty completion content".to_string())?;
    serde_json::from_str::<Value>(&content).map_err(|e| e.to_string())
}

async fn parse_profile_via_llm(
    registry: &Registry,
    raw_html: &str,
    fallback: Option<ProfileFallback>,
    cancel: &CancellationToken,
) -> Result<ParsedProfile, String> {
    let messages = vec![
        Message {
            role: Role::System,
            content: "Extract a professional profile as JSON with fields: name, current_role, experience (array of strings), skills (array of strings), summary.".into(),
        },
        Message {
            role: Role::User,
            content: raw_html.to_string(),
        },
    ];

    let value = complete_json(registry, messages, cancel).await?;

    let mut name = value.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
    let mut current_role = value
        .get("current_role")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let experience = value
        .get("experience")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let skills = value
        .get("skills")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let summary = value.get("summary").and_then(Value::as_str).unwrap_or_default().to_string();

    if name.is_empty() {
        name = fallback.as_ref().and_then(|f| f.name.clone()).unwrap_or_else(|| "Unknown Profile".into());
    }
    if current_role.is_empty() {
        current_role = fallback
            .as_ref()
            .and_then(|f| f.current_role.clone())
            .unwrap_or_else(|| "Unknown Role".into());
    }

    Ok(ParsedProfile {
        name,
        current_role,
        experience,
        skills,
        summary,
    })
}

async fn analyze_product_via_llm(
    registry: &Registry,
    text: &str,
    cancel: &CancellationToken,
) -> Result<ProductAnalysis, String> {
    let messages = vec![
        Message {
            role: Role::System,
            content: "Analyze this product/company description and respond as JSON with: name, category, description, features (array, max 5), pricing {model, tiers[]}, market_analysis {target_market, competitors[]}, business_metrics {funding_stage?, team_size?, founded_year?}.".into(),
        },
        Message {
            role: Role::User,
            content: text.to_string(),
        },
    ];

    let value = complete_json(registry, messages, cancel).await?;
    let mut analysis: ProductAnalysis = serde_json::from_value(value).map_err(|e| e.to_string())?;
    analysis.features.truncate(5);
    Ok(analysis)
}

fn build_email_prompt(
    template: EmailTemplate,
    prospect: &Prospect,
    linkedin_profile: Option<&ParsedProfile>,
    product_analysis: Option<&ProductAnalysis>,
    sender_profile: Option<&str>,
    extra_context: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Write {} to {} at {} about their role as {}.",
        template.instruction(),
        prospect.name,
        prospect.company,
        prospect.role,
    );
    if let Some(profile) = linkedin_profile {
        prompt.push_str(&format!(" Their background: {}", profile.summary));
    }
    if let Some(analysis) = product_analysis {
        prompt.push_str(&format!(" Their company's product: {}", analysis.description));
    }
    if let Some(sender) = sender_profile {
        prompt.push_str(&format!(" Sender context: {sender}"));
    }
    if let Some(extra) = extra_context {
        prompt.push_str(&format!(" Additional context: {extra}"));
    }
    prompt.push_str(" Respond as JSON with: subject, body.");
    prompt
}

/// The raw LLM-decoded subject/body before word-count and personalization
/// validation are applied — those checks run against the live `Prospect`
/// after the (possibly cached) decode, so they're never themselves cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawGeneratedEmail {
    subject: String,
    body: String,
}

async fn generate_email_via_llm(
    registry: &Registry,
    prompt: String,
    cancel: &CancellationToken,
) -> Result<RawGeneratedEmail, String> {
    let messages = vec![
        Message {
            role: Role::System,
            content: "You write concise, personalized outreach emails. Never exceed the requested word count.".into(),
        },
        Message {
            role: Role::User,
            content: prompt,
        },
    ];

    let value = complete_json(registry, messages, cancel).await?;
    let subject = value.get("subject").and_then(Value::as_str).unwrap_or_default().to_string();
    let body = value.get("body").and_then(Value::as_str).unwrap_or_default().to_string();

    if subject.is_empty() {
        return Err("generated email has an empty subject".into());
    }

    Ok(RawGeneratedEmail { subject, body })
}

/// At least one token from the prospect's company or role must appear in
/// the body; a full point is awarded when both do.
fn score_personalization(body: &str, prospect: &Prospect) -> f32 {
    let lower = body.to_lowercase();
    let mentions_company = tokens_of(&prospect.company)
        .any(|t| lower.contains(&t));
    let mentions_role = tokens_of(&prospect.role).any(|t| lower.contains(&t));

    match (mentions_company, mentions_role) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.6,
        (false, false) => 0.1,
    }
}

fn tokens_of(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split_whitespace()
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::prospect::Prospect;
    use crate::llm::{
        ConfigValidation, ConnectionTestResult, LlmProvider, ModelInfo, Usage,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration as StdDuration;

    fn test_prospect() -> Prospect {
        Prospect::new(
            "Jane Doe".into(),
            "VP Engineering".into(),
            "Acme Robotics".into(),
            "feed".into(),
        )
    }

    struct CountingProvider {
        calls: Arc<AtomicU32>,
        content: String,
    }

    #[async_trait::async_trait]
    impl LlmProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }
        fn validate_config(&self) -> ConfigValidation {
            ConfigValidation { ok: true, errors: vec![] }
        }
        fn safe_config(&self) -> std::collections::HashMap<String, String> {
            std::collections::HashMap::new()
        }
        fn model_info(&self) -> ModelInfo {
            ModelInfo::default()
        }
        async fn test_connection(&self) -> ConnectionTestResult {
            ConnectionTestResult { ok: true, detail: "ok".into() }
        }
        async fn complete(
            &self,
            _: CompletionRequest,
            _: &CancellationToken,
        ) -> Result<crate::llm::CompletionResponse, crate::error::AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            Ok(crate::llm::CompletionResponse {
                success: true,
                content: Some(self.content.clone()),
                model: "test".into(),
                usage: Usage::default(),
                finish_reason: "stop".into(),
                error_kind: None,
                error_message: None,
            })
        }
    }

    fn service_with_fixed_response(content: &str) -> (Arc<AiService>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new("counting");
        let calls_for_factory = Arc::clone(&calls);
        let content = content.to_string();
        registry.register("counting", move || {
            Ok(Arc::new(CountingProvider {
                calls: Arc::clone(&calls_for_factory),
                content: content.clone(),
            }) as Arc<dyn LlmProvider>)
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::new(true, 100, 10, dir.into_path(), Duration::from_secs(3600)));
        let service = Arc::new(AiService::new(Arc::new(registry), cache, 250, 0.0));
        (service, calls)
    }

    #[tokio::test]
    async fn parse_profile_coalesces_concurrent_identical_calls() {
        let (service, calls) = service_with_fixed_response(
            r#"{"name":"Jane","current_role":"VP","experience":[],"skills":[],"summary":"s"}"#,
        );

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for _ in 0..6 {
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                service.parse_profile("<html>same page</html>", None, &cancel).await
            }));
        }
        for h in handles {
            let envelope = h.await.unwrap();
            assert!(envelope.success);
            assert_eq!(envelope.data.unwrap().name, "Jane");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "identical requests should coalesce onto one LLM call");
    }

    #[tokio::test]
    async fn parse_profile_second_call_is_served_from_cache() {
        let (service, calls) = service_with_fixed_response(
            r#"{"name":"Jane","current_role":"VP","experience":[],"skills":[],"summary":"s"}"#,
        );

        let cancel = CancellationToken::new();
        let first = service.parse_profile("<html>page</html>", None, &cancel).await;
        assert!(!first.cached);
        let second = service.parse_profile("<html>page</html>", None, &cancel).await;
        assert!(second.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct FlakyJsonProvider {
        calls: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for FlakyJsonProvider {
        fn name(&self) -> &str {
            "flaky"
        }
        fn validate_config(&self) -> ConfigValidation {
            ConfigValidation { ok: true, errors: vec![] }
        }
        fn safe_config(&self) -> std::collections::HashMap<String, String> {
            std::collections::HashMap::new()
        }
        fn model_info(&self) -> ModelInfo {
            ModelInfo::default()
        }
        async fn test_connection(&self) -> ConnectionTestResult {
            ConnectionTestResult { ok: true, detail: "ok".into() }
        }
        async fn complete(
            &self,
            _: CompletionRequest,
            _: &CancellationToken,
        ) -> Result<crate::llm::CompletionResponse, crate::error::AppError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let content = if n == 0 {
                "not json at all".to_string()
            } else {
                r#"{"name":"Jane","current_role":"VP","experience":[],"skills":[],"summary":"s"}"#.to_string()
            };
            Ok(crate::llm::CompletionResponse {
                success: true,
                content: Some(content),
                model: "test".into(),
                usage: Usage::default(),
                finish_reason: "stop".into(),
                error_kind: None,
                error_message: None,
            })
        }
    }

    /// Spec §8's "LLM repair" scenario: a malformed first completion is
    /// recovered by `complete_json`'s single repair round trip, and the
    /// repaired result is then served from cache on the identical retry.
    #[tokio::test]
    async fn parse_profile_repairs_malformed_json_then_serves_from_cache() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = Registry::new("flaky");
        let calls_for_factory = Arc::clone(&calls);
        registry.register("flaky", move || {
            Ok(Arc::new(FlakyJsonProvider {
                calls: Arc::clone(&calls_for_factory),
            }) as Arc<dyn LlmProvider>)
        });
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(Cache::new(true, 100, 10, dir.into_path(), Duration::from_secs(3600)));
        let service = AiService::new(Arc::new(registry), cache, 250, 0.0);

        let cancel = CancellationToken::new();
        let first = service.parse_profile("<html>flaky page</html>", None, &cancel).await;
        assert!(first.success, "malformed first attempt should be recovered by the repair retry");
        assert!(!first.cached);
        assert_eq!(first.data.unwrap().name, "Jane");
        assert_eq!(calls.load(Ordering::SeqCst), 2, "one malformed attempt plus one repair retry");

        let second = service.parse_profile("<html>flaky page</html>", None, &cancel).await;
        assert!(second.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "cached result must not re-invoke the LLM");
    }

    #[test]
    fn score_personalization_rewards_company_and_role_mentions() {
        let prospect = test_prospect();
        let body = "As VP Engineering at Acme Robotics, you're probably thinking about scale.";
        assert_eq!(score_personalization(body, &prospect), 1.0);
    }

    #[test]
    fn score_personalization_penalizes_generic_body() {
        let prospect = test_prospect();
        let body = "Hope you're having a great week, wanted to reach out.";
        assert_eq!(score_personalization(body, &prospect), 0.1);
    }
}
