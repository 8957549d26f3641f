//! # dossier-core
//!
//! A recursive, LLM-driven multi-source research agent for investigative
//! journalism. Given a natural-language question and a resource budget, the
//! agent decomposes the question into a tree of sub-goals, fans out across
//! heterogeneous external sources, filters and extracts evidence under
//! strict budget constraints, and writes a structured report plus a full
//! JSONL execution log to a per-run directory.
//!
//! ## Core Components
//!
//! - **Agent**: the recursive goal state machine (assess -> EXECUTE /
//!   DECOMPOSE / ANALYZE -> check-achievement -> follow-ups)
//! - **Sources**: the [`source::SourceAdapter`] capability set and registry
//! - **LLM**: the schema-validated structured-output gateway
//! - **Budget**: cost / time / goal-count / concurrency enforcement
//! - **Journal**: the append-only execution log
//!
//! ## Example
//!
//! ```rust,ignore
//! use dossier_core::{Constraints, Researcher};
//!
//! let bundle = Researcher::builder()
//!     .transport(transport)
//!     .registry(registry)
//!     .out_dir("./runs")
//!     .build()?
//!     .run("Who audits agency X's contracts?", Constraints::default())
//!     .await?;
//!
//! println!("report at {}", bundle.report_path.display());
//! std::process::exit(bundle.exit_code());
//! ```

pub mod agent;
pub mod budget;
pub mod config;
pub mod context;
pub mod error;
pub mod evidence;
pub mod goal;
pub mod journal;
pub mod llm;
pub mod report;
pub mod run;
pub mod source;

// Re-exports for convenience
pub use agent::{Assessment, ResearchAgent, SiblingNote};
pub use budget::{BudgetController, BudgetSnapshot, Permit, StopReason};
pub use config::{Config, Constraints, FilterSettings, LlmSettings, SourceSettings};
pub use context::{Admission, EvidenceDraft, Limitation, RunContext, SourceOutcome, SourceStats};
pub use error::{Error, Result};
pub use evidence::{Entity, EvidenceId, IndexEntry, ProcessedEvidence, RunIndex};
pub use goal::{Action, GoalResult, GoalStatus, ResearchGoal};
pub use journal::{Event, EventType, ExecutionLogger, LOG_SCHEMA_VERSION};
pub use llm::{
    AnthropicTransport, CompletionRequest, CompletionResponse, CostLedger, FieldSpec, FieldType,
    LlmGateway, LlmTransport, ModelSpec, PromptTemplate, ResponseSchema, StructuredResponse,
    TokenUsage, TransportConfig,
};
pub use report::{RunMetadata, RunTotals, SourcesSummary};
pub use run::{run_research, ResearcherBuilder, Researcher, RunBundle};
pub use source::classify::{classify, ApiError, ErrorCategory};
pub use source::registry::{normalize_source_name, SourceCtor, SourceRegistry};
pub use source::{
    ParamHints, QueryParams, QueryResult, RawResult, SourceAdapter, SourceCategory, SourceMetadata,
};
