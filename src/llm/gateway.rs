//! Structured-output LLM gateway.
//!
//! Every structured LLM call in the system flows through [`LlmGateway::call`]:
//! it renders a template, enforces the per-call timeout, validates the JSON
//! output against the declared schema (with up to two repair retries that
//! feed the validation error back to the model), records cost against the
//! ledger and budget, and emits a `cost_tick` event per request. Once the
//! budget is breached the gateway refuses further calls with the
//! `BudgetExhausted` sentinel.

use crate::budget::{BudgetController, StopReason};
use crate::error::{Error, Result};
use crate::journal::{EventType, ExecutionLogger};
use crate::llm::schema::ResponseSchema;
use crate::llm::types::{
    CompletionRequest, CompletionResponse, CostLedger, ModelSpec, StructuredResponse, TokenUsage,
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Maximum attempts per structured call: one initial plus two repairs.
const MAX_SCHEMA_ATTEMPTS: u32 = 3;

/// A named prompt template with `{placeholder}` substitution.
///
/// Templates that opt in via `wants_date` get `current_date` and
/// `current_year` injected at render time, so temporal questions are
/// answered against the actual run date.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub name: &'static str,
    pub system: &'static str,
    pub user: &'static str,
    pub wants_date: bool,
}

impl PromptTemplate {
    /// Render system and user prompts, substituting `{key}` for each var.
    pub fn render(&self, vars: &[(&str, String)]) -> (String, String) {
        let mut system = self.system.to_string();
        let mut user = self.user.to_string();
        let mut substitute = |key: &str, value: &str| {
            let pattern = format!("{{{key}}}");
            system = system.replace(&pattern, value);
            user = user.replace(&pattern, value);
        };
        for (key, value) in vars {
            substitute(key, value);
        }
        if self.wants_date {
            let now = Utc::now();
            substitute("current_date", &now.format("%Y-%m-%d").to_string());
            substitute("current_year", &now.format("%Y").to_string());
        }
        (system, user)
    }
}

/// Raw completion transport. Implementations own HTTP details; the gateway
/// owns everything else.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Provider name for error messages.
    fn provider(&self) -> &str;
}

/// Configuration for HTTP transports.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: String,
    /// Request timeout in seconds (transport-level; the gateway applies its
    /// own wall-clock timeout on top)
    pub timeout_secs: u64,
}

impl TransportConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: ModelSpec::claude_sonnet().id,
            timeout_secs: 180,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }
}

/// Anthropic Claude transport.
pub struct AnthropicTransport {
    config: TransportConfig,
    http: Client,
}

impl AnthropicTransport {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(config: TransportConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LlmTransport for AnthropicTransport {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = request
            .model
            .unwrap_or_else(|| self.config.default_model.clone());

        let api_request = AnthropicRequest {
            model: model.clone(),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: request.user,
            }],
            max_tokens: request.max_tokens.unwrap_or(4096),
            system: request.system,
            temperature: request.temperature,
        };

        let url = format!("{}/v1/messages", self.base_url());
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::llm_api("anthropic", format!("HTTP request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::llm_api("anthropic", format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<AnthropicError>(&body) {
                return Err(Error::llm_api(
                    "anthropic",
                    format!("{}: {}", error.error.error_type, error.error.message),
                ));
            }
            return Err(Error::llm_api("anthropic", format!("{status}: {body}")));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::llm_api("anthropic", format!("Failed to parse response: {e}")))?;

        let content = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let usage = TokenUsage::new(
            api_response.usage.input_tokens,
            api_response.usage.output_tokens,
        );
        let spec = ModelSpec::for_model_id(&model);
        let cost = spec.calculate_cost(usage.input_tokens, usage.output_tokens);

        Ok(CompletionResponse {
            model: api_response.model,
            content,
            usage,
            cost: Some(cost),
            timestamp: Utc::now(),
        })
    }

    fn provider(&self) -> &str {
        "anthropic"
    }
}

/// The schema-validated gateway shared by the whole run.
pub struct LlmGateway {
    transport: Arc<dyn LlmTransport>,
    model: ModelSpec,
    call_timeout: Duration,
    budget: Arc<BudgetController>,
    ledger: Arc<Mutex<CostLedger>>,
    logger: Arc<ExecutionLogger>,
}

impl LlmGateway {
    pub fn new(
        transport: Arc<dyn LlmTransport>,
        model: ModelSpec,
        call_timeout: Duration,
        budget: Arc<BudgetController>,
        ledger: Arc<Mutex<CostLedger>>,
        logger: Arc<ExecutionLogger>,
    ) -> Self {
        Self {
            transport,
            model,
            call_timeout,
            budget,
            ledger,
            logger,
        }
    }

    /// The model this gateway calls.
    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    /// Make a structured call: render the template, call the transport under
    /// the wall-clock timeout, validate against `schema`, repair up to twice.
    ///
    /// Cost is recorded for every attempt, including failed ones, and a
    /// `cost_tick` event is emitted per request.
    pub async fn call(
        &self,
        template: &PromptTemplate,
        vars: &[(&str, String)],
        schema: &ResponseSchema,
        goal_id: Option<&str>,
    ) -> Result<StructuredResponse> {
        let (system, base_user) = template.render(vars);
        let base_user = format!("{base_user}\n\n{}", schema.to_prompt_block());

        let mut total_cost = 0.0_f64;
        let mut tokens_in = 0_u64;
        let mut tokens_out = 0_u64;
        let mut repair_note: Option<String> = None;

        for attempt in 1..=MAX_SCHEMA_ATTEMPTS {
            self.gate()?;

            let user = match &repair_note {
                None => base_user.clone(),
                Some(note) => format!(
                    "{base_user}\n\nYour previous response was invalid:\n{note}\n\
                     Return ONLY a corrected JSON object matching the schema."
                ),
            };

            // Models whose output budget includes reasoning must not be
            // given a token cap.
            let max_tokens = if self.model.budget_includes_reasoning {
                None
            } else {
                Some(self.model.max_output)
            };

            let request = CompletionRequest {
                model: Some(self.model.id.clone()),
                system: Some(system.clone()),
                user,
                max_tokens,
                temperature: None,
            };

            let response = match tokio::time::timeout(
                self.call_timeout,
                self.transport.complete(request),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => return Err(Error::timeout(self.call_timeout.as_millis() as u64)),
            };

            let cost = response.cost.unwrap_or_else(|| {
                self.model
                    .calculate_cost(response.usage.input_tokens, response.usage.output_tokens)
            });
            self.record_cost(template.name, &response, cost, goal_id);
            total_cost += cost;
            tokens_in += response.usage.input_tokens;
            tokens_out += response.usage.output_tokens;

            match parse_and_validate(&response.content, schema) {
                Ok(data) => {
                    return Ok(StructuredResponse {
                        data,
                        cost_usd: total_cost,
                        tokens_in,
                        tokens_out,
                        model: response.model,
                    });
                }
                Err(note) => {
                    tracing::debug!(
                        template = template.name,
                        attempt,
                        error = %note,
                        "schema validation failed"
                    );
                    repair_note = Some(note);
                }
            }
        }

        Err(Error::schema_validation(
            MAX_SCHEMA_ATTEMPTS,
            repair_note.unwrap_or_default(),
        ))
    }

    /// Refuse new calls once the run must stop. The goal-count cap is not
    /// checked here: already-admitted goals still get to finish their own
    /// LLM work.
    fn gate(&self) -> Result<()> {
        match self.budget.should_stop() {
            Some(StopReason::Cost) => Err(Error::budget_exhausted("cost")),
            Some(StopReason::Time) => Err(Error::cancelled("time")),
            Some(StopReason::Cancelled) => Err(Error::cancelled("cancelled")),
            Some(StopReason::Goals) | None => Ok(()),
        }
    }

    fn record_cost(
        &self,
        purpose: &str,
        response: &CompletionResponse,
        cost: f64,
        goal_id: Option<&str>,
    ) {
        self.ledger
            .lock()
            .expect("ledger lock poisoned")
            .add(purpose, response.usage, cost);

        let _ = self.logger.emit(
            EventType::CostTick,
            goal_id,
            serde_json::json!({
                "purpose": purpose,
                "model": &response.model,
                "cost_usd": cost,
                "tokens_in": response.usage.input_tokens,
                "tokens_out": response.usage.output_tokens,
            }),
        );

        if self.budget.record_cost(cost) {
            let _ = self.logger.emit(
                EventType::BudgetBreach,
                goal_id,
                serde_json::json!({
                    "spent_cost_usd": self.budget.spent_cost_usd(),
                    "reason": "cost",
                }),
            );
            self.budget.cancel(StopReason::Cost);
        }
    }
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("model", &self.model.id)
            .field("provider", &self.transport.provider())
            .finish()
    }
}

/// Extract a JSON object from model output and validate it.
///
/// Accepts bare JSON, fenced blocks, or an object embedded in prose.
fn parse_and_validate(content: &str, schema: &ResponseSchema) -> std::result::Result<Value, String> {
    let value = extract_json(content).ok_or_else(|| {
        format!(
            "Could not parse a JSON object from the response (starts with: {})",
            content.chars().take(80).collect::<String>()
        )
    })?;

    match schema.validate(&value) {
        Ok(()) => Ok(schema.apply_defaults(&value)),
        Err(errors) => Err(errors
            .iter()
            .map(|e| e.to_user_message())
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    // Fenced block
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..end].trim()) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
    }

    // First '{' to last '}'
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(|v| v.is_object())
}
