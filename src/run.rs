//! Programmatic entry point: build a [`Researcher`], call
//! [`Researcher::run`], get a [`RunBundle`] plus a fully-populated run
//! directory (`execution_log.jsonl`, `metadata.json`, `raw_responses/`,
//! `evidence.json`, `result.json`, `report.md`).

use crate::agent::ResearchAgent;
use crate::budget::{BudgetController, StopReason};
use crate::config::{Config, Constraints};
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::goal::{GoalResult, GoalStatus, ResearchGoal};
use crate::journal::{EventType, ExecutionLogger};
use crate::llm::gateway::{LlmGateway, LlmTransport};
use crate::llm::types::{CostLedger, ModelSpec};
use crate::report::{render_report, RunMetadata, RunTotals, SourcesSummary};
use crate::source::registry::SourceRegistry;
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Everything a caller needs after a run.
#[derive(Debug)]
pub struct RunBundle {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub root: GoalResult,
    pub metadata: RunMetadata,
    pub report_path: PathBuf,
}

impl RunBundle {
    /// Process exit code contract: 0 completed, 2 failed, 3 cancelled
    /// (time/cost). Configuration errors exit 1 before a bundle exists.
    pub fn exit_code(&self) -> i32 {
        match self.root.status {
            GoalStatus::Completed => 0,
            GoalStatus::Failed | GoalStatus::Skipped => 2,
            GoalStatus::Cancelled => 3,
        }
    }
}

/// Builder for [`Researcher`].
pub struct ResearcherBuilder {
    transport: Option<Arc<dyn LlmTransport>>,
    config: Config,
    registry: SourceRegistry,
    out_dir: Option<PathBuf>,
}

impl ResearcherBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            config: Config::default(),
            registry: SourceRegistry::new(),
            out_dir: None,
        }
    }

    /// Set the LLM transport (required).
    pub fn transport(mut self, transport: Arc<dyn LlmTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the layered configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the source registry.
    pub fn registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Set the directory under which run directories are created (required).
    pub fn out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = Some(out_dir.into());
        self
    }

    pub fn build(mut self) -> Result<Researcher> {
        let transport = self
            .transport
            .ok_or_else(|| Error::Config("an LLM transport is required".to_string()))?;
        let out_dir = self
            .out_dir
            .ok_or_else(|| Error::Config("an output directory is required".to_string()))?;
        self.registry.apply_settings(&self.config.sources);
        Ok(Researcher {
            transport,
            config: self.config,
            registry: Arc::new(self.registry),
            out_dir,
        })
    }
}

impl Default for ResearcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured research runner. One `Researcher` can drive many runs;
/// each run gets its own budget, index, logger, and run directory.
pub struct Researcher {
    transport: Arc<dyn LlmTransport>,
    config: Config,
    registry: Arc<SourceRegistry>,
    out_dir: PathBuf,
}

impl Researcher {
    pub fn builder() -> ResearcherBuilder {
        ResearcherBuilder::new()
    }

    /// Run one research question under the given constraints.
    pub async fn run(&self, question: &str, constraints: Constraints) -> Result<RunBundle> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let run_dir = self.out_dir.join(format!(
            "{}_{}",
            started_at.format("%Y-%m-%d_%H-%M-%S"),
            slugify(question)
        ));
        std::fs::create_dir_all(&run_dir)?;

        let logger = Arc::new(ExecutionLogger::open(
            &run_dir.join("execution_log.jsonl"),
            run_id.clone(),
        )?);
        for (source_id, message) in self.registry.registration_failures() {
            logger.emit(
                EventType::SourceRegistrationFailed,
                None,
                json!({"source_id": source_id, "error": message}),
            )?;
        }
        logger.emit(
            EventType::RunStarted,
            None,
            json!({"question": question, "constraints": &constraints}),
        )?;

        let budget = Arc::new(BudgetController::new(&constraints));
        let ledger = Arc::new(Mutex::new(CostLedger::new()));
        let gateway = Arc::new(LlmGateway::new(
            self.transport.clone(),
            ModelSpec::for_model_id(&self.config.llm.model),
            Duration::from_secs(self.config.llm.timeout_s),
            budget.clone(),
            ledger.clone(),
            logger.clone(),
        ));
        let ctx = Arc::new(RunContext::new(
            run_id.clone(),
            run_dir.clone(),
            constraints.clone(),
            budget.clone(),
            logger.clone(),
            gateway,
            self.registry.clone(),
            ledger.clone(),
        ));

        let agent = ResearchAgent::new(ctx.clone());
        let root_goal = ResearchGoal::root(question);
        let root = match tokio::spawn(agent.pursue(root_goal, Vec::new())).await {
            Ok(result) => result,
            Err(join_err) => {
                // Panics are programmer error; record the crash and bail.
                logger.emit(
                    EventType::RunCompleted,
                    None,
                    json!({"status": "crashed", "error": join_err.to_string()}),
                )?;
                return Err(Error::Internal(format!(
                    "research task panicked: {join_err}"
                )));
            }
        };

        match budget.cancel_state() {
            Some(StopReason::Cost) => {
                ctx.add_limitation(
                    "budget",
                    "the cost cap was reached; remaining work was cancelled",
                );
            }
            Some(StopReason::Time) => {
                ctx.add_limitation(
                    "budget",
                    "the time cap was reached; remaining work was cancelled",
                );
            }
            _ => {}
        }

        let reason = match root.status {
            GoalStatus::Cancelled => root.error.clone(),
            _ => None,
        };
        let metadata = RunMetadata {
            run_id: run_id.clone(),
            constraints,
            started_at,
            ended_at: Utc::now(),
            status: root.status.as_str().to_string(),
            reason,
            totals: RunTotals {
                goals: budget.started_goals(),
                evidence: ctx.evidence_count(),
                cost_usd: ledger.lock().expect("ledger lock poisoned").total_cost_usd,
            },
            sources: SourcesSummary::from_stats(
                &ctx.source_stats_snapshot(),
                ctx.rate_limited_sources(),
            ),
            limitations: ctx.limitations(),
        };

        self.write_artifacts(&ctx, &root, &metadata, question, &run_dir)?;

        logger.emit(
            EventType::RunCompleted,
            None,
            json!({
                "status": &metadata.status,
                "reason": &metadata.reason,
                "totals": &metadata.totals,
            }),
        )?;

        Ok(RunBundle {
            run_id,
            run_dir: run_dir.clone(),
            root,
            metadata,
            report_path: run_dir.join("report.md"),
        })
    }

    fn write_artifacts(
        &self,
        ctx: &RunContext,
        root: &GoalResult,
        metadata: &RunMetadata,
        question: &str,
        run_dir: &std::path::Path,
    ) -> Result<()> {
        // evidence.json holds every record, never truncated.
        let evidence = ctx.evidence_snapshot();
        std::fs::write(
            run_dir.join("evidence.json"),
            serde_json::to_string_pretty(&evidence)?,
        )?;

        let by_goal = ctx.by_goal_snapshot();
        let mut flat = root.flatten_evidence_ids();
        for ids in by_goal.values() {
            for id in ids {
                if !flat.contains(id) {
                    flat.push(*id);
                }
            }
        }
        std::fs::write(
            run_dir.join("result.json"),
            serde_json::to_string_pretty(&json!({
                "root_goal_result": root,
                "by_goal": by_goal,
                "flat_evidence_ids": flat,
            }))?,
        )?;

        std::fs::write(
            run_dir.join("metadata.json"),
            serde_json::to_string_pretty(metadata)?,
        )?;

        let report = render_report(question, root, &evidence, metadata);
        let report_path = run_dir.join("report.md");
        std::fs::write(&report_path, report)?;
        ctx.log(
            EventType::ReportWritten,
            None,
            json!({"path": report_path.display().to_string()}),
        );
        Ok(())
    }
}

impl std::fmt::Debug for Researcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Researcher")
            .field("out_dir", &self.out_dir)
            .finish()
    }
}

/// One-shot convenience wrapper around [`Researcher`].
pub async fn run_research(
    question: &str,
    constraints: Constraints,
    transport: Arc<dyn LlmTransport>,
    registry: SourceRegistry,
    out_dir: impl Into<PathBuf>,
) -> Result<RunBundle> {
    Researcher::builder()
        .transport(transport)
        .registry(registry)
        .out_dir(out_dir)
        .build()?
        .run(question, constraints)
        .await
}

/// Filesystem-safe slug from the research question.
fn slugify(question: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for c in question.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "research".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CrateResult;
    use crate::journal::read_events;
    use crate::llm::types::{CompletionRequest, CompletionResponse, TokenUsage};
    use crate::source::registry::SourceCtor;
    use crate::source::{
        ParamHints, QueryParams, QueryResult, RawResult, SourceAdapter, SourceCategory,
        SourceMetadata,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::VecDeque;
    use tempfile::tempdir;

    // ---- mock LLM -------------------------------------------------------

    type RouteFn = Box<dyn Fn(&str) -> String + Send + Sync>;

    struct RouteLlm {
        route: RouteFn,
        cost_per_call: f64,
    }

    #[async_trait]
    impl LlmTransport for RouteLlm {
        async fn complete(&self, request: CompletionRequest) -> CrateResult<CompletionResponse> {
            let content = (self.route)(&request.user);
            Ok(CompletionResponse {
                model: "mock".to_string(),
                content,
                usage: TokenUsage::new(100, 50),
                cost: Some(self.cost_per_call),
                timestamp: Utc::now(),
            })
        }

        fn provider(&self) -> &str {
            "mock"
        }
    }

    fn llm(route: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<RouteLlm> {
        Arc::new(RouteLlm {
            route: Box::new(route),
            cost_per_call: 0.001,
        })
    }

    fn llm_with_cost(
        cost: f64,
        route: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Arc<RouteLlm> {
        Arc::new(RouteLlm {
            route: Box::new(route),
            cost_per_call: cost,
        })
    }

    /// Verdicts accepting every index with score 9.
    fn accept_all() -> String {
        let verdicts: Vec<Value> = (0..8)
            .map(|i| json!({"index": i, "score": 9, "rationale": "names the entity"}))
            .collect();
        json!({ "verdicts": verdicts }).to_string()
    }

    fn extraction() -> String {
        json!({
            "summary": "Jane Doe has led agency X since 2023.",
            "facts": ["Jane Doe is the director"],
            "entities": [{"name": "Jane Doe", "type": "person"}],
            "dates": ["2023-01-15"],
        })
        .to_string()
    }

    fn achieved(confidence: f64) -> String {
        json!({
            "achieved": true,
            "confidence": confidence,
            "reasoning": "the evidence answers the question",
            "gaps": [],
        })
        .to_string()
    }

    fn select(sources: &[&str]) -> String {
        json!({"sources": sources, "primary": sources.first(), "rationale": "fits"}).to_string()
    }

    // ---- mock sources ---------------------------------------------------

    struct StaticSource {
        metadata: SourceMetadata,
        script: Mutex<VecDeque<QueryResult>>,
        fallback: QueryResult,
    }

    #[async_trait]
    impl SourceAdapter for StaticSource {
        fn metadata(&self) -> &SourceMetadata {
            &self.metadata
        }

        async fn is_relevant(&self, _question: &str, _llm: &LlmGateway) -> bool {
            true
        }

        async fn generate_query(
            &self,
            question: &str,
            _hints: Option<&ParamHints>,
            _llm: &LlmGateway,
        ) -> CrateResult<Option<QueryParams>> {
            Ok(Some(QueryParams::new(question)))
        }

        async fn execute_search(
            &self,
            _params: &QueryParams,
            _limit: usize,
            _extract_full_content: bool,
        ) -> QueryResult {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn meta(id: &str) -> SourceMetadata {
        SourceMetadata {
            id: id.to_string(),
            display_name: format!("{id} source"),
            category: SourceCategory::WebSearch,
            requires_api_key: false,
            api_key_env_var: None,
            supports_date_filter: false,
            characteristics: "test source".to_string(),
            query_strategies: vec!["plain keywords".to_string()],
            unfixable_http_codes: vec![],
        }
    }

    fn raw(source_id: &str, url: &str, title: &str) -> RawResult {
        let mut raw = RawResult::new(source_id);
        raw.url = Some(url.to_string());
        raw.title = Some(title.to_string());
        raw.snippet = Some(format!("{title} snippet"));
        raw.raw_api_response = json!({"title": title});
        raw
    }

    fn source(id: &str, script: Vec<QueryResult>, fallback: QueryResult) -> (SourceMetadata, SourceCtor) {
        let metadata = meta(id);
        let shared = Arc::new(StaticSource {
            metadata: metadata.clone(),
            script: Mutex::new(script.into()),
            fallback,
        });
        let ctor: SourceCtor = Box::new(move || Ok(shared.clone() as Arc<dyn SourceAdapter>));
        (metadata, ctor)
    }

    fn registry_with(sources: Vec<(SourceMetadata, SourceCtor)>) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for (metadata, ctor) in sources {
            registry.register(metadata, ctor).unwrap();
        }
        registry
    }

    async fn run(
        transport: Arc<RouteLlm>,
        registry: SourceRegistry,
        constraints: Constraints,
        question: &str,
    ) -> (RunBundle, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let bundle = Researcher::builder()
            .transport(transport)
            .registry(registry)
            .out_dir(dir.path())
            .build()
            .unwrap()
            .run(question, constraints)
            .await
            .unwrap();
        (bundle, dir)
    }

    fn events_of(bundle: &RunBundle) -> Vec<crate::journal::Event> {
        read_events(&bundle.run_dir.join("execution_log.jsonl")).unwrap()
    }

    fn count(events: &[crate::journal::Event], event_type: EventType) -> usize {
        events.iter().filter(|e| e.event_type == event_type).count()
    }

    // ---- scenarios ------------------------------------------------------

    #[tokio::test]
    async fn test_simple_factual_run_completes() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                json!({
                    "action": "EXECUTE",
                    "rationale": "direct factual question",
                    "suggested_sources": ["websearch"],
                })
                .to_string()
            } else if user.contains("- sources (") {
                select(&["websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- achieved (") {
                achieved(0.9)
            } else {
                json!({}).to_string()
            }
        });
        let registry = registry_with(vec![source(
            "websearch",
            vec![],
            QueryResult::ok(
                "websearch",
                1,
                vec![raw("websearch", "https://example.gov/leadership", "Leadership page")],
            ),
        )]);

        let (bundle, _dir) = run(
            transport,
            registry,
            Constraints {
                max_depth: 2,
                max_goals: 10,
                max_cost_usd: 0.5,
                ..Constraints::default()
            },
            "Who is the current director of agency X?",
        )
        .await;

        assert_eq!(bundle.root.status, GoalStatus::Completed);
        assert!(bundle.root.confidence >= 0.7);
        assert_eq!(bundle.exit_code(), 0);

        // Accepted evidence landed in evidence.json with a non-empty summary.
        let evidence: Vec<crate::evidence::ProcessedEvidence> = serde_json::from_str(
            &std::fs::read_to_string(bundle.run_dir.join("evidence.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(evidence.len(), 1);
        assert!(!evidence[0].llm_summary.is_empty());

        // Raw payload persisted per accepted evidence.
        let raw_path = bundle
            .run_dir
            .join("raw_responses")
            .join("websearch")
            .join("1.json");
        assert!(raw_path.exists());

        let events = events_of(&bundle);
        assert_eq!(count(&events, EventType::EvidenceAccepted), 1);
        assert_eq!(count(&events, EventType::RunCompleted), 1);

        // Cost property: cost_tick events sum to the metadata total.
        let ticked: f64 = events
            .iter()
            .filter(|e| e.event_type == EventType::CostTick)
            .map(|e| e.data["cost_usd"].as_f64().unwrap())
            .sum();
        assert!((ticked - bundle.metadata.totals.cost_usd).abs() < 1e-9);

        // flat_evidence_ids holds each id exactly once.
        let result: Value = serde_json::from_str(
            &std::fs::read_to_string(bundle.run_dir.join("result.json")).unwrap(),
        )
        .unwrap();
        let flat = result["flat_evidence_ids"].as_array().unwrap();
        assert_eq!(flat.len(), 1);

        // The report cites the evidence.
        let report = std::fs::read_to_string(&bundle.report_path).unwrap();
        assert!(report.contains("[E1]"));
    }

    #[tokio::test]
    async fn test_comparative_decomposition_orders_dependencies() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                if user.contains("Goal 0 (depth 0") {
                    json!({
                        "action": "DECOMPOSE",
                        "rationale": "comparative question",
                        "comparative": true,
                        "suggested_sources": ["websearch"],
                    })
                    .to_string()
                } else if user.contains("Compare the collected") {
                    json!({"action": "ANALYZE", "rationale": "synthesis step", "comparative": true})
                        .to_string()
                } else {
                    json!({
                        "action": "EXECUTE",
                        "rationale": "collect data",
                        "suggested_sources": ["websearch"],
                    })
                    .to_string()
                }
            } else if user.contains("- subgoals (list[object])") {
                json!({"subgoals": [
                    {"description": "Collect contract history of company A in 2024", "dependencies": []},
                    {"description": "Collect contract history of company B in 2024", "dependencies": []},
                    {"description": "Compare the collected contract histories", "dependencies": [0, 1], "synthesis": true},
                ]})
                .to_string()
            } else if user.contains("- sources (") {
                select(&["websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- evidence_ids (") {
                json!({"evidence_ids": [1, 2], "rationale": "both histories"}).to_string()
            } else if user.contains("- answer (") {
                json!({
                    "answer": "Company A won more awards than B [E1][E2].",
                    "confidence": 0.8,
                    "limitations": [],
                })
                .to_string()
            } else if user.contains("- achieved (") {
                achieved(0.8)
            } else {
                json!({}).to_string()
            }
        });

        // Distinct URLs per call so both collectors admit fresh evidence.
        let registry = registry_with(vec![source(
            "websearch",
            vec![
                QueryResult::ok(
                    "websearch",
                    1,
                    vec![raw("websearch", "https://example.gov/a", "Company A contracts")],
                ),
                QueryResult::ok(
                    "websearch",
                    1,
                    vec![raw("websearch", "https://example.gov/b", "Company B contracts")],
                ),
            ],
            QueryResult::ok("websearch", 0, vec![]),
        )]);

        let (bundle, _dir) = run(
            transport,
            registry,
            Constraints::default(),
            "Compare the contract histories of company A and company B in 2024",
        )
        .await;

        assert_eq!(bundle.root.status, GoalStatus::Completed);
        assert_eq!(bundle.root.sub_results.len(), 3);
        assert!(bundle.root.subtree_has_synthesis());

        let events = events_of(&bundle);
        // Dependency ordering: the synthesis goal starts strictly after both
        // collectors complete.
        let position = |ty: EventType, goal: &str| {
            events
                .iter()
                .position(|e| e.event_type == ty && e.goal_id.as_deref() == Some(goal))
                .unwrap()
        };
        let synth_started = position(EventType::GoalStarted, "0.2");
        assert!(position(EventType::GoalCompleted, "0.0") < synth_started);
        assert!(position(EventType::GoalCompleted, "0.1") < synth_started);
        assert!(count(&events, EventType::DependencyGroup) >= 2);
        assert_eq!(count(&events, EventType::GlobalEvidenceSelection), 1);

        // Cross-branch reuse: the synthesis goal references both ids.
        let result: Value = serde_json::from_str(
            &std::fs::read_to_string(bundle.run_dir.join("result.json")).unwrap(),
        )
        .unwrap();
        let synth_ids = result["by_goal"]["0.2"].as_array().unwrap();
        assert_eq!(synth_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_implicit_synthesis_appended_for_comparative() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                if user.contains("Goal 0 (depth 0") {
                    json!({"action": "DECOMPOSE", "rationale": "comparative", "comparative": true})
                        .to_string()
                } else if user.contains("Synthesize and compare") {
                    json!({"action": "ANALYZE", "rationale": "synthesis", "comparative": true})
                        .to_string()
                } else {
                    json!({
                        "action": "EXECUTE",
                        "rationale": "collect",
                        "suggested_sources": ["websearch"],
                    })
                    .to_string()
                }
            } else if user.contains("- subgoals (list[object])") {
                // The model forgot the synthesis sub-goal.
                json!({"subgoals": [
                    {"description": "Collect data on A", "dependencies": []},
                    {"description": "Collect data on B", "dependencies": []},
                ]})
                .to_string()
            } else if user.contains("- sources (") {
                select(&["websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- evidence_ids (") {
                json!({"evidence_ids": [1], "rationale": "relevant"}).to_string()
            } else if user.contains("- answer (") {
                json!({"answer": "A leads [E1].", "confidence": 0.7, "limitations": []}).to_string()
            } else if user.contains("- achieved (") {
                achieved(0.75)
            } else {
                json!({}).to_string()
            }
        });
        let registry = registry_with(vec![source(
            "websearch",
            vec![
                QueryResult::ok(
                    "websearch",
                    1,
                    vec![raw("websearch", "https://example.gov/a", "A data")],
                ),
            ],
            QueryResult::ok("websearch", 0, vec![]),
        )]);

        let (bundle, _dir) = run(
            transport,
            registry,
            Constraints::default(),
            "Compare A and B revenues",
        )
        .await;

        let events = events_of(&bundle);
        let decomposition = events
            .iter()
            .find(|e| e.event_type == EventType::Decomposition)
            .unwrap();
        assert_eq!(decomposition.data["implicit_synthesis"], json!(true));
        // The appended synthesis child exists and depends on both collectors.
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::GoalStarted && e.goal_id.as_deref() == Some("0.2")));
        assert_eq!(bundle.root.sub_results.len(), 3);
        assert_eq!(bundle.root.sub_results[2].goal.dependencies, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_synthesis_confidence_caps_goal_confidence() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                if user.contains("Goal 0 (depth 0") {
                    json!({"action": "DECOMPOSE", "rationale": "comparative", "comparative": true})
                        .to_string()
                } else if user.contains("Compare the collected") {
                    json!({"action": "ANALYZE", "rationale": "synthesis", "comparative": true})
                        .to_string()
                } else {
                    json!({
                        "action": "EXECUTE",
                        "rationale": "collect",
                        "suggested_sources": ["websearch"],
                    })
                    .to_string()
                }
            } else if user.contains("- subgoals (list[object])") {
                json!({"subgoals": [
                    {"description": "Collect data on A", "dependencies": []},
                    {"description": "Compare the collected data", "dependencies": [0], "synthesis": true},
                ]})
                .to_string()
            } else if user.contains("- sources (") {
                select(&["websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- evidence_ids (") {
                json!({"evidence_ids": [1], "rationale": "only item"}).to_string()
            } else if user.contains("- answer (") {
                // The synthesis discounts itself: thin evidence, one side
                // of the comparison missing.
                json!({
                    "answer": "Only A is covered [E1]; B could not be collected.",
                    "confidence": 0.3,
                    "limitations": ["no evidence for B was available"],
                })
                .to_string()
            } else if user.contains("- achieved (") {
                // The achievement judge is more optimistic than the
                // synthesis; the synthesis cap must win.
                achieved(0.9)
            } else {
                json!({}).to_string()
            }
        });
        let registry = registry_with(vec![source(
            "websearch",
            vec![QueryResult::ok(
                "websearch",
                1,
                vec![raw("websearch", "https://example.gov/a", "A data")],
            )],
            QueryResult::ok("websearch", 0, vec![]),
        )]);

        let (bundle, _dir) = run(
            transport,
            registry,
            Constraints {
                min_results_to_continue: 0,
                ..Constraints::default()
            },
            "Compare A and B filings",
        )
        .await;

        let synth = &bundle.root.sub_results[1];
        assert!(synth.synthesized);
        assert!((synth.confidence - 0.3).abs() < 1e-9);

        // The synthesis call's own limitations reach metadata and report.
        assert!(bundle
            .metadata
            .limitations
            .iter()
            .any(|l| l.kind == "synthesis" && l.detail.contains("no evidence for B")));
        let report = std::fs::read_to_string(&bundle.report_path).unwrap();
        assert!(report.contains("### synthesis"));
    }

    #[tokio::test]
    async fn test_rate_limited_source_is_benched_not_reformulated() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                json!({
                    "action": "EXECUTE",
                    "rationale": "factual",
                    "suggested_sources": ["limited", "websearch"],
                })
                .to_string()
            } else if user.contains("- sources (") {
                select(&["limited", "websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- achieved (") {
                achieved(0.85)
            } else {
                json!({}).to_string()
            }
        });

        let registry = registry_with(vec![
            source(
                "limited",
                vec![QueryResult::failed("limited", "too many requests", Some(429))
                    .with_retry_after(30)],
                QueryResult::ok(
                    "limited",
                    1,
                    vec![raw("limited", "https://example.org/l", "late result")],
                ),
            ),
            source(
                "websearch",
                vec![],
                QueryResult::ok(
                    "websearch",
                    1,
                    vec![raw("websearch", "https://example.gov/ok", "good result")],
                ),
            ),
        ]);

        let (bundle, _dir) = run(
            transport,
            registry,
            Constraints::default(),
            "What happened at agency Y?",
        )
        .await;

        assert_eq!(bundle.root.status, GoalStatus::Completed);
        let events = events_of(&bundle);
        assert_eq!(count(&events, EventType::RateLimitHit), 1);
        assert_eq!(count(&events, EventType::Reformulation), 0);
        assert_eq!(count(&events, EventType::EvidenceAccepted), 1);
        assert_eq!(bundle.metadata.sources.rate_limited, vec!["limited".to_string()]);
        assert!(bundle
            .metadata
            .limitations
            .iter()
            .any(|l| l.kind == "rate_limit"));

        // Rate-limit skips surface as limitations in the report.
        let report = std::fs::read_to_string(&bundle.report_path).unwrap();
        assert!(report.contains("### rate_limit"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_cancels_run_with_partial_artifacts() {
        // Every call costs 0.02 against a 0.01 cap: the first call is
        // admitted and breaches; everything after is refused.
        let transport = llm_with_cost(0.02, |user| {
            if user.contains("- action (") {
                json!({"action": "DECOMPOSE", "rationale": "broad question", "comparative": false})
                    .to_string()
            } else if user.contains("- subgoals (list[object])") {
                json!({"subgoals": [
                    {"description": "part one", "dependencies": []},
                    {"description": "part two", "dependencies": []},
                ]})
                .to_string()
            } else {
                json!({}).to_string()
            }
        });
        let registry = registry_with(vec![source(
            "websearch",
            vec![],
            QueryResult::ok("websearch", 0, vec![]),
        )]);

        let (bundle, _dir) = run(
            transport,
            registry,
            Constraints {
                max_cost_usd: 0.01,
                ..Constraints::default()
            },
            "Everything about agency Z",
        )
        .await;

        assert_eq!(bundle.root.status, GoalStatus::Cancelled);
        assert_eq!(bundle.root.error.as_deref(), Some("budget"));
        assert_eq!(bundle.metadata.status, "cancelled");
        assert_eq!(bundle.exit_code(), 3);

        let events = events_of(&bundle);
        assert_eq!(count(&events, EventType::BudgetBreach), 1);
        // Exactly one paid call went through.
        assert_eq!(count(&events, EventType::CostTick), 1);

        // Artifacts still exist, evidence.json included.
        assert!(bundle.run_dir.join("evidence.json").exists());
        let report = std::fs::read_to_string(&bundle.report_path).unwrap();
        assert!(report.contains("## Research Limitations"));
        assert!(report.contains("### budget"));
    }

    #[tokio::test]
    async fn test_invalid_decomposition_falls_back_to_execute() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                json!({
                    "action": "DECOMPOSE",
                    "rationale": "try to split",
                    "suggested_sources": ["websearch"],
                })
                .to_string()
            } else if user.contains("- subgoals (list[object])") {
                // Dependency index 5 is out of range for two sub-goals.
                json!({"subgoals": [
                    {"description": "a", "dependencies": []},
                    {"description": "b", "dependencies": [5]},
                ]})
                .to_string()
            } else if user.contains("- sources (") {
                select(&["websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- achieved (") {
                achieved(0.8)
            } else {
                json!({}).to_string()
            }
        });
        let registry = registry_with(vec![source(
            "websearch",
            vec![],
            QueryResult::ok(
                "websearch",
                1,
                vec![raw("websearch", "https://example.gov/x", "Result")],
            ),
        )]);

        let (bundle, _dir) = run(transport, registry, Constraints::default(), "question").await;

        assert_eq!(bundle.root.status, GoalStatus::Completed);
        assert!(bundle.root.sub_results.is_empty());

        let events = events_of(&bundle);
        assert_eq!(count(&events, EventType::DecompositionInvalid), 1);
        assert_eq!(count(&events, EventType::Decomposition), 0);
        // No child goal ever started.
        assert!(!events
            .iter()
            .any(|e| e.event_type == EventType::GoalStarted
                && e.goal_id.as_deref().map(|g| g.contains('.')).unwrap_or(false)));
        // The fallback EXECUTE produced evidence on the same goal.
        assert_eq!(count(&events, EventType::EvidenceAccepted), 1);
    }

    #[tokio::test]
    async fn test_shared_url_across_siblings_dedups_to_one_record() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                if user.contains("Goal 0 (depth 0") {
                    json!({"action": "DECOMPOSE", "rationale": "two angles", "comparative": false})
                        .to_string()
                } else {
                    json!({
                        "action": "EXECUTE",
                        "rationale": "collect",
                        "suggested_sources": ["websearch"],
                    })
                    .to_string()
                }
            } else if user.contains("- subgoals (list[object])") {
                json!({"subgoals": [
                    {"description": "angle one", "dependencies": []},
                    {"description": "angle two", "dependencies": [0]},
                ]})
                .to_string()
            } else if user.contains("- sources (") {
                select(&["websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- achieved (") {
                achieved(0.8)
            } else {
                json!({}).to_string()
            }
        });

        // Both siblings get the same top URL.
        let registry = registry_with(vec![source(
            "websearch",
            vec![],
            QueryResult::ok(
                "websearch",
                1,
                vec![raw("websearch", "https://example.gov/shared", "Shared doc")],
            ),
        )]);

        let (bundle, _dir) = run(transport, registry, Constraints::default(), "question").await;

        let events = events_of(&bundle);
        assert_eq!(count(&events, EventType::EvidenceAccepted), 1);
        assert!(count(&events, EventType::UrlDuplicate) >= 1);

        let result: Value = serde_json::from_str(
            &std::fs::read_to_string(bundle.run_dir.join("result.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(result["by_goal"]["0.0"], json!([1]));
        assert_eq!(result["by_goal"]["0.1"], json!([1]));
        // flat_evidence_ids lists the shared id exactly once.
        assert_eq!(result["flat_evidence_ids"], json!([1]));
    }

    #[tokio::test]
    async fn test_depth_cap_forbids_decomposition() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                // The model keeps asking to decompose; depth 0 == max_depth
                // must coerce to EXECUTE.
                json!({"action": "DECOMPOSE", "rationale": "split it", "suggested_sources": ["websearch"]})
                    .to_string()
            } else if user.contains("- sources (") {
                select(&["websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- achieved (") {
                achieved(0.8)
            } else {
                json!({}).to_string()
            }
        });
        let registry = registry_with(vec![source(
            "websearch",
            vec![],
            QueryResult::ok(
                "websearch",
                1,
                vec![raw("websearch", "https://example.gov/x", "Result")],
            ),
        )]);

        let (bundle, _dir) = run(
            transport,
            registry,
            Constraints {
                max_depth: 0,
                ..Constraints::default()
            },
            "question",
        )
        .await;

        assert_eq!(bundle.root.status, GoalStatus::Completed);
        let events = events_of(&bundle);
        assert_eq!(count(&events, EventType::Decomposition), 0);
        assert_eq!(count(&events, EventType::DecompositionInvalid), 0);
        assert_eq!(count(&events, EventType::EvidenceAccepted), 1);
    }

    #[tokio::test]
    async fn test_validation_errors_reformulate_up_to_cap() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                json!({
                    "action": "EXECUTE",
                    "rationale": "factual",
                    "suggested_sources": ["picky"],
                })
                .to_string()
            } else if user.contains("- sources (") {
                select(&["picky"])
            } else if user.contains("Rejected params") {
                json!({"query": "rewritten query"}).to_string()
            } else if user.contains("- achieved (") {
                json!({
                    "achieved": false,
                    "confidence": 0.2,
                    "reasoning": "the only source kept rejecting queries",
                    "gaps": [],
                })
                .to_string()
            } else {
                json!({}).to_string()
            }
        });

        // Always 422: every attempt is a validation failure.
        let registry = registry_with(vec![source(
            "picky",
            vec![],
            QueryResult::failed("picky", "bad query syntax", Some(422)),
        )]);

        let (bundle, _dir) = run(
            transport,
            registry,
            Constraints {
                max_retries_per_goal: 2,
                min_results_to_continue: 0,
                ..Constraints::default()
            },
            "question",
        )
        .await;

        assert_eq!(bundle.root.status, GoalStatus::Completed);
        let events = events_of(&bundle);
        // At most max_retries_per_goal reformulations for the (goal, source)
        // pair, and 422 is never retried without a rewrite.
        assert_eq!(count(&events, EventType::Reformulation), 2);
        assert_eq!(count(&events, EventType::EvidenceAccepted), 0);
        assert!(bundle
            .metadata
            .limitations
            .iter()
            .any(|l| l.kind == "critical_source_failure"));
    }

    #[tokio::test]
    async fn test_auth_failure_never_reformulates() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                json!({
                    "action": "EXECUTE",
                    "rationale": "factual",
                    "suggested_sources": ["locked", "websearch"],
                })
                .to_string()
            } else if user.contains("- sources (") {
                select(&["locked", "websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- achieved (") {
                achieved(0.8)
            } else {
                json!({}).to_string()
            }
        });
        let registry = registry_with(vec![
            source(
                "locked",
                vec![],
                QueryResult::failed("locked", "forbidden", Some(403)),
            ),
            source(
                "websearch",
                vec![],
                QueryResult::ok(
                    "websearch",
                    1,
                    vec![raw("websearch", "https://example.gov/ok", "Result")],
                ),
            ),
        ]);

        let (bundle, _dir) = run(transport, registry, Constraints::default(), "question").await;

        assert_eq!(bundle.root.status, GoalStatus::Completed);
        let events = events_of(&bundle);
        assert_eq!(count(&events, EventType::Reformulation), 0);
        let classified = events
            .iter()
            .find(|e| e.event_type == EventType::ErrorClassified)
            .unwrap();
        assert_eq!(classified.data["category"], json!("auth"));
    }

    #[tokio::test]
    async fn test_run_metadata_and_goal_count() {
        let transport = llm(|user| {
            if user.contains("- action (") {
                json!({
                    "action": "EXECUTE",
                    "rationale": "factual",
                    "suggested_sources": ["websearch"],
                })
                .to_string()
            } else if user.contains("- sources (") {
                select(&["websearch"])
            } else if user.contains("- verdicts (") {
                accept_all()
            } else if user.contains("- summary (") {
                extraction()
            } else if user.contains("- achieved (") {
                achieved(0.9)
            } else {
                json!({}).to_string()
            }
        });
        let registry = registry_with(vec![source(
            "websearch",
            vec![],
            QueryResult::ok(
                "websearch",
                1,
                vec![raw("websearch", "https://example.gov/x", "Result")],
            ),
        )]);

        let (bundle, _dir) = run(transport, registry, Constraints::default(), "question").await;

        assert_eq!(bundle.metadata.status, "completed");
        assert_eq!(bundle.metadata.totals.goals, 1);
        assert_eq!(bundle.metadata.totals.evidence, 1);
        assert!(bundle.metadata.totals.cost_usd > 0.0);

        let meta_file: Value = serde_json::from_str(
            &std::fs::read_to_string(bundle.run_dir.join("metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta_file["status"], json!("completed"));
        assert_eq!(meta_file["totals"]["evidence"], json!(1));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Who runs Agency X?"), "who-runs-agency-x");
        assert_eq!(slugify("???"), "research");
        assert!(slugify(&"long word ".repeat(20)).len() <= 40);
    }

    #[test]
    fn test_builder_requires_transport_and_out_dir() {
        let err = Researcher::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = Researcher::builder()
            .transport(llm(|_| String::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
