//! Source adapter contract.
//!
//! Every external data source (government APIs, social platforms, web
//! search, document repositories, local archives) is exposed to the agent
//! through the [`SourceAdapter`] capability set. Expected failures are
//! values: `execute_search` never returns `Err` for an unreachable or
//! unhappy source, it returns a [`QueryResult`] with `success = false`.

pub mod classify;
pub mod registry;

use crate::error::Result;
use crate::llm::gateway::{LlmGateway, PromptTemplate};
use crate::llm::schema::{FieldSpec, FieldType, ResponseSchema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broad category of a source, used in selector prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Government,
    Financial,
    SocialMedia,
    WebSearch,
    News,
    Documents,
    LocalArchive,
}

impl std::fmt::Display for SourceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Government => "government",
            Self::Financial => "financial",
            Self::SocialMedia => "social_media",
            Self::WebSearch => "web_search",
            Self::News => "news",
            Self::Documents => "documents",
            Self::LocalArchive => "local_archive",
        };
        f.write_str(s)
    }
}

/// Static description of a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Canonical lowercase id (e.g. "sam", "websearch")
    pub id: String,
    /// Human-readable name (e.g. "SAM.gov Contract Opportunities")
    pub display_name: String,
    pub category: SourceCategory,
    pub requires_api_key: bool,
    pub api_key_env_var: Option<String>,
    pub supports_date_filter: bool,
    /// Prose description of what this source covers, fed to relevance and
    /// query-generation prompts
    pub characteristics: String,
    /// Hints on how to query this source effectively
    pub query_strategies: Vec<String>,
    /// HTTP codes that no query rewrite can fix for this source
    pub unfixable_http_codes: Vec<u16>,
}

/// Parameters for one source search.
///
/// Sources interpret `extra` with their own schema; the common fields cover
/// the query text and optional date window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryParams {
    pub query: String,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl QueryParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Validate and scrub the params.
    ///
    /// LLM-produced values occasionally arrive as the literal strings
    /// "null" or "none"; those are stripped from date fields and rejected
    /// as query text. Returns `None` when no usable query remains.
    pub fn sanitized(mut self) -> Option<Self> {
        fn is_null_literal(s: &str) -> bool {
            let t = s.trim();
            t.is_empty() || t.eq_ignore_ascii_case("null") || t.eq_ignore_ascii_case("none")
        }

        if is_null_literal(&self.query) {
            return None;
        }
        if self.date_from.as_deref().map(is_null_literal).unwrap_or(false) {
            self.date_from = None;
        }
        if self.date_to.as_deref().map(is_null_literal).unwrap_or(false) {
            self.date_to = None;
        }
        Some(self)
    }
}

/// One raw result from a source, preserved verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawResult {
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub snippet: Option<String>,
    pub date: Option<String>,
    /// Opaque source payload, stored untouched under `raw_responses/`
    pub raw_api_response: Value,
    /// Full text or PDF-extracted text, when requested
    pub raw_content: Option<String>,
}

impl RawResult {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            fetched_at: Utc::now(),
            url: None,
            title: None,
            snippet: None,
            date: None,
            raw_api_response: Value::Null,
            raw_content: None,
        }
    }

    /// Short text used in filtering prompts.
    pub fn digest(&self) -> String {
        let title = self.title.as_deref().unwrap_or("(untitled)");
        let snippet = self.snippet.as_deref().unwrap_or("");
        let url = self.url.as_deref().unwrap_or("");
        format!("{title} | {url} | {snippet}")
    }
}

/// Outcome of one `execute_search` call. Expected failures are encoded
/// here, never thrown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    pub source_id: String,
    /// Total results the source reports, which may exceed `results.len()`
    pub total: usize,
    pub results: Vec<RawResult>,
    pub error: Option<String>,
    pub http_code: Option<u16>,
    /// Retry-After, in seconds, when the source provided one
    pub retry_after_s: Option<u64>,
}

impl QueryResult {
    pub fn ok(source_id: impl Into<String>, total: usize, results: Vec<RawResult>) -> Self {
        Self {
            success: true,
            source_id: source_id.into(),
            total,
            results,
            error: None,
            http_code: None,
            retry_after_s: None,
        }
    }

    pub fn failed(
        source_id: impl Into<String>,
        error: impl Into<String>,
        http_code: Option<u16>,
    ) -> Self {
        Self {
            success: false,
            source_id: source_id.into(),
            total: 0,
            results: Vec::new(),
            error: Some(error.into()),
            http_code,
            retry_after_s: None,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_s = Some(secs);
        self
    }
}

/// Hints the assessor may pass down to query generation.
pub type ParamHints = Map<String, Value>;

const RELEVANCE_TEMPLATE: PromptTemplate = PromptTemplate {
    name: "source_relevance",
    system: "You decide whether a data source could hold evidence for a research question. \
             Answer strictly from the source description.",
    user: "Research question: {question}\n\nSource: {display_name}\nCovers: {characteristics}\n\n\
           Could this source plausibly hold relevant evidence?",
    wants_date: false,
};

const GENERATE_QUERY_TEMPLATE: PromptTemplate = PromptTemplate {
    name: "generate_query",
    system: "You write search queries for a specific data source. Follow the source's query \
             strategies. If the source cannot help with the question, set relevant to false. \
             Never output the literal string \"null\" for any field; omit unknown fields.",
    user: "Research question: {question}\n\nSource: {display_name}\nCovers: {characteristics}\n\
           Query strategies:\n{strategies}\nDate filter supported: {supports_dates}\n\
           Hints from the planner (may be empty): {hints}",
    wants_date: true,
};

fn relevance_schema() -> ResponseSchema {
    ResponseSchema::new(
        "source_relevance",
        vec![
            FieldSpec::new("relevant", FieldType::Boolean),
            FieldSpec::new("reason", FieldType::String).optional(),
        ],
    )
}

fn generate_query_schema() -> ResponseSchema {
    ResponseSchema::new(
        "generate_query",
        vec![
            FieldSpec::new("relevant", FieldType::Boolean),
            FieldSpec::new("query", FieldType::String).optional(),
            FieldSpec::new("date_from", FieldType::String).optional(),
            FieldSpec::new("date_to", FieldType::String).optional(),
        ],
    )
}

/// Capability set every source exposes.
///
/// `is_relevant` and `generate_query` have provided implementations driven
/// by the source metadata; adapters with bespoke query schemas override
/// them.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Static metadata. `id` must already be in canonical form.
    fn metadata(&self) -> &SourceMetadata;

    /// LLM relevance check for pruning fan-out. Defaults to relevant when
    /// the LLM call fails, so a flaky model never silently drops a source.
    async fn is_relevant(&self, question: &str, llm: &LlmGateway) -> bool {
        let meta = self.metadata();
        let vars = [
            ("question", question.to_string()),
            ("display_name", meta.display_name.clone()),
            ("characteristics", meta.characteristics.clone()),
        ];
        match llm
            .call(&RELEVANCE_TEMPLATE, &vars, &relevance_schema(), None)
            .await
        {
            Ok(resp) => resp.data["relevant"].as_bool().unwrap_or(true),
            Err(err) => {
                tracing::warn!(source = %meta.id, error = %err, "relevance check failed, defaulting to relevant");
                true
            }
        }
    }

    /// Produce source-specific query params, or `None` when the LLM judges
    /// the source irrelevant to this question.
    async fn generate_query(
        &self,
        question: &str,
        hints: Option<&ParamHints>,
        llm: &LlmGateway,
    ) -> Result<Option<QueryParams>> {
        let meta = self.metadata();
        let hints_text = hints
            .map(|h| serde_json::to_string(h).unwrap_or_default())
            .unwrap_or_else(|| "{}".to_string());
        let vars = [
            ("question", question.to_string()),
            ("display_name", meta.display_name.clone()),
            ("characteristics", meta.characteristics.clone()),
            ("strategies", meta.query_strategies.join("\n")),
            ("supports_dates", meta.supports_date_filter.to_string()),
            ("hints", hints_text),
        ];
        let resp = llm
            .call(&GENERATE_QUERY_TEMPLATE, &vars, &generate_query_schema(), None)
            .await?;

        if !resp.data["relevant"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        let params = QueryParams {
            query: resp.data["query"].as_str().unwrap_or_default().to_string(),
            date_from: resp.data["date_from"].as_str().map(str::to_string),
            date_to: resp.data["date_to"].as_str().map(str::to_string),
            extra: Map::new(),
        };
        Ok(params.sanitized())
    }

    /// Run the search. Transport problems and HTTP failures come back as
    /// `QueryResult { success: false, .. }`.
    async fn execute_search(
        &self,
        params: &QueryParams,
        limit: usize,
        extract_full_content: bool,
    ) -> QueryResult;
}
