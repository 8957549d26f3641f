//! LLM types for requests, responses, model pricing, and cost accounting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Model definition with pricing and token-budget semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier (e.g., "claude-3-5-sonnet-20241022")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Maximum context window (tokens)
    pub context_window: u32,
    /// Maximum output tokens
    pub max_output: u32,
    /// Input cost per million tokens (USD)
    pub input_cost_per_m: f64,
    /// Output cost per million tokens (USD)
    pub output_cost_per_m: f64,
    /// Whether the output-token budget includes reasoning tokens.
    /// When true the gateway must not pass an output cap.
    pub budget_includes_reasoning: bool,
}

impl ModelSpec {
    /// Calculate cost for given token usage.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_m;
        input_cost + output_cost
    }

    pub fn claude_sonnet() -> Self {
        Self {
            id: "claude-3-5-sonnet-20241022".to_string(),
            name: "Claude 3.5 Sonnet".to_string(),
            context_window: 200_000,
            max_output: 8192,
            input_cost_per_m: 3.0,
            output_cost_per_m: 15.0,
            budget_includes_reasoning: false,
        }
    }

    pub fn claude_haiku() -> Self {
        Self {
            id: "claude-3-5-haiku-20241022".to_string(),
            name: "Claude 3.5 Haiku".to_string(),
            context_window: 200_000,
            max_output: 8192,
            input_cost_per_m: 0.8,
            output_cost_per_m: 4.0,
            budget_includes_reasoning: false,
        }
    }

    /// Look up a well-known model by id, falling back to Sonnet pricing.
    pub fn for_model_id(id: &str) -> Self {
        let known = [Self::claude_sonnet(), Self::claude_haiku()];
        known
            .iter()
            .find(|m| m.id == id || id.starts_with(&m.id))
            .cloned()
            .unwrap_or_else(|| {
                let mut spec = Self::claude_sonnet();
                spec.id = id.to_string();
                spec.name = id.to_string();
                spec
            })
    }
}

/// Token usage statistics for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Completion request handed to a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model to use (None lets the transport pick its default)
    pub model: Option<String>,
    /// System prompt
    pub system: Option<String>,
    /// User prompt
    pub user: String,
    /// Maximum tokens to generate; must stay None for models whose
    /// token budget includes reasoning
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 1.0)
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            model: None,
            system: None,
            user: user.into(),
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }
}

/// Completion response from a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Model used
    pub model: String,
    /// Generated text
    pub content: String,
    /// Token usage
    pub usage: TokenUsage,
    /// Cost in USD (if the transport can price it)
    pub cost: Option<f64>,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

/// Result of a structured, schema-validated LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredResponse {
    /// Validated JSON object matching the requested schema
    pub data: Value,
    /// Cost of the call in USD (summed over repair retries)
    pub cost_usd: f64,
    /// Input tokens (summed over repair retries)
    pub tokens_in: u64,
    /// Output tokens (summed over repair retries)
    pub tokens_out: u64,
    /// Model that produced the accepted output
    pub model: String,
}

/// Cost accounting for a run, broken down by call purpose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostLedger {
    /// Total input tokens
    pub total_input_tokens: u64,
    /// Total output tokens
    pub total_output_tokens: u64,
    /// Total cost in USD
    pub total_cost_usd: f64,
    /// Number of LLM requests
    pub request_count: u64,
    /// Per-purpose breakdown (e.g. "assess_action", "filter_results")
    pub by_purpose: HashMap<String, PurposeCosts>,
}

/// Costs attributed to one call purpose.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurposeCosts {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub request_count: u64,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call against a purpose.
    pub fn add(&mut self, purpose: &str, usage: TokenUsage, cost_usd: f64) {
        self.total_input_tokens += usage.input_tokens;
        self.total_output_tokens += usage.output_tokens;
        self.total_cost_usd += cost_usd;
        self.request_count += 1;

        let entry = self.by_purpose.entry(purpose.to_string()).or_default();
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.cost_usd += cost_usd;
        entry.request_count += 1;
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }
}
