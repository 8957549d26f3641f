//! The EXECUTE action: source selection, parallel fan-out, retry and
//! reformulation, URL dedup, filtering, extraction, and admission.

use crate::context::{EvidenceDraft, RunContext, SourceOutcome};
use crate::error::Result;
use crate::goal::ResearchGoal;
use crate::journal::EventType;
use crate::llm::gateway::PromptTemplate;
use crate::llm::schema::{FieldSpec, FieldType, ResponseSchema};
use crate::source::classify::{classify, ErrorCategory};
use crate::source::{QueryParams, RawResult};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::assess::Assessment;
use super::filter::{extract_evidence, filter_batch, FILTER_BATCH_SIZE};

/// Backoff policy for retryable source errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((self.base_delay_ms as f64 * factor).round() as u64)
    }
}

const SELECT_SOURCES: PromptTemplate = PromptTemplate {
    name: "select_sources",
    system: "You pick which data sources to query for a research goal. Prefer the planner's \
             suggestions but drop sources that have performed poorly this run and add untried \
             ones that clearly fit. Name the single most load-bearing source as primary.",
    user: "Goal: {description}\n\nPlanner suggestions: {suggested}\n\n\
           Available sources:\n{catalog}\n\nPerformance this run:\n{stats}",
    wants_date: false,
};

const REFORMULATE: PromptTemplate = PromptTemplate {
    name: "reformulate_query",
    system: "A source rejected a search query as invalid. Rewrite the parameters so the source \
             accepts them, keeping the research intent. Never output the literal string \
             \"null\"; omit fields you cannot fill.",
    user: "Goal: {description}\nSource: {source_id}\nRejected params: {params}\n\
           Source error: {error}",
    wants_date: false,
};

fn select_sources_schema() -> ResponseSchema {
    ResponseSchema::new(
        "select_sources",
        vec![
            FieldSpec::new("sources", FieldType::list(FieldType::String)),
            FieldSpec::new("primary", FieldType::String).optional(),
            FieldSpec::new("rationale", FieldType::String).with_default(json!("")),
        ],
    )
}

fn reformulate_schema() -> ResponseSchema {
    ResponseSchema::new(
        "reformulate_query",
        vec![
            FieldSpec::new("query", FieldType::String),
            FieldSpec::new("date_from", FieldType::String).optional(),
            FieldSpec::new("date_to", FieldType::String).optional(),
        ],
    )
}

/// Outcome of one EXECUTE pass.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub evidence_ids: Vec<u64>,
    pub cost_usd: f64,
    pub accepted: usize,
    pub rejected: usize,
    pub failed_sources: Vec<String>,
}

#[derive(Debug, Clone)]
struct SourceSelection {
    sources: Vec<String>,
    primary: Option<String>,
}

/// Ask the LLM which sources to query, given metadata and per-source
/// performance counters. Falls back to the planner's suggestions (or all
/// enabled sources) when the selector fails.
async fn select_sources(
    ctx: &RunContext,
    goal: &ResearchGoal,
    assessment: &Assessment,
) -> (SourceSelection, f64) {
    let enabled = ctx.registry.enabled_metadata();
    let catalog = enabled
        .iter()
        .map(|m| {
            format!(
                "{} ({}) [{}]: {}",
                m.id, m.display_name, m.category, m.characteristics
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    let stats = ctx.source_stats_snapshot();
    let stats_text = if stats.is_empty() {
        "(no queries yet)".to_string()
    } else {
        let mut lines: Vec<String> = stats
            .iter()
            .map(|(id, s)| {
                let errors = s
                    .errors
                    .iter()
                    .map(|(cat, n)| format!("error_{cat}={n}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!(
                    "{id}: success={} zero_results={} low_quality={} {errors}",
                    s.success, s.zero_results, s.low_quality
                )
            })
            .collect();
        lines.sort();
        lines.join("\n")
    };

    let vars = [
        ("description", goal.description.clone()),
        ("suggested", assessment.suggested_sources.join(", ")),
        ("catalog", catalog),
        ("stats", stats_text),
    ];

    let fallback = |cost: f64| {
        let suggested: Vec<String> = assessment
            .suggested_sources
            .iter()
            .filter_map(|s| ctx.registry.resolve(s))
            .collect();
        let sources = if suggested.is_empty() {
            enabled.iter().map(|m| m.id.clone()).collect()
        } else {
            suggested
        };
        (
            SourceSelection {
                primary: sources.first().cloned(),
                sources,
            },
            cost,
        )
    };

    let resp = match ctx
        .llm
        .call(&SELECT_SOURCES, &vars, &select_sources_schema(), Some(&goal.id))
        .await
    {
        Ok(resp) => resp,
        Err(err) if err.is_budget_exhausted() || err.is_cancelled() => return fallback(0.0),
        Err(err) => {
            tracing::warn!(error = %err, "source selector failed, using fallback selection");
            return fallback(0.0);
        }
    };

    let mut sources: Vec<String> = Vec::new();
    for name in resp.data["sources"].as_array().cloned().unwrap_or_default() {
        let Some(name) = name.as_str() else { continue };
        if let Some(id) = ctx.registry.resolve(name) {
            if !sources.contains(&id) {
                sources.push(id);
            }
        }
    }
    let primary = resp.data["primary"]
        .as_str()
        .and_then(|p| ctx.registry.resolve(p))
        .filter(|p| sources.contains(p));

    ctx.log(
        EventType::SourceSelection,
        Some(&goal.id),
        json!({
            "sources": &sources,
            "primary": &primary,
            "suggested": &assessment.suggested_sources,
            "rationale": &resp.data["rationale"],
        }),
    );

    if sources.is_empty() {
        return fallback(resp.cost_usd);
    }
    (SourceSelection { sources, primary }, resp.cost_usd)
}

/// Raw results pulled from one source, plus the LLM cost spent on it.
#[derive(Debug, Default)]
struct SourcePull {
    raws: Vec<RawResult>,
    cost_usd: f64,
    failed: bool,
}

async fn pull_source(
    ctx: &RunContext,
    goal: &ResearchGoal,
    assessment: &Assessment,
    source_id: &str,
    retry_policy: &RetryPolicy,
) -> SourcePull {
    let mut pull = SourcePull::default();

    if ctx.budget.should_stop().is_some() {
        return pull;
    }

    // Rate-limited sources sit out the rest of their cool-down.
    if ctx.rate_limited_remaining(source_id).is_some() {
        ctx.log(
            EventType::SourceSkipped,
            Some(&goal.id),
            json!({"source_id": source_id, "reason": "rate_limited"}),
        );
        return pull;
    }

    let adapter = match ctx.registry.get(source_id) {
        Ok(Some(adapter)) => adapter,
        _ => {
            ctx.log(
                EventType::SourceSkipped,
                Some(&goal.id),
                json!({"source_id": source_id, "reason": "unavailable"}),
            );
            return pull;
        }
    };
    let meta = adapter.metadata().clone();

    // The selector already vetted suggested sources; only its additions get
    // the per-adapter relevance check.
    let was_suggested = assessment
        .suggested_sources
        .iter()
        .any(|s| ctx.registry.resolve(s).as_deref() == Some(source_id));
    if !was_suggested && !adapter.is_relevant(&goal.description, &ctx.llm).await {
        ctx.log(
            EventType::SourceSkipped,
            Some(&goal.id),
            json!({"source_id": source_id, "reason": "not_relevant"}),
        );
        return pull;
    }

    let params = match adapter
        .generate_query(&goal.description, assessment.param_hints.as_ref(), &ctx.llm)
        .await
    {
        Ok(Some(params)) => params,
        Ok(None) => {
            ctx.log(
                EventType::SourceSkipped,
                Some(&goal.id),
                json!({"source_id": source_id, "reason": "query_declined"}),
            );
            return pull;
        }
        Err(err) => {
            if !(err.is_budget_exhausted() || err.is_cancelled()) {
                ctx.log(
                    EventType::SourceSkipped,
                    Some(&goal.id),
                    json!({
                        "source_id": source_id,
                        "reason": "query_generation_failed",
                        "error": err.to_string(),
                    }),
                );
            }
            return pull;
        }
    };
    ctx.log(
        EventType::QueryGenerated,
        Some(&goal.id),
        json!({"source_id": source_id, "params": &params}),
    );

    let limit = ctx.constraints.result_limit_for(source_id);
    let mut params = params;
    let mut reformulations = 0u32;
    let mut retries = 0u32;

    loop {
        if ctx.budget.should_stop().is_some() {
            return pull;
        }

        ctx.log(
            EventType::SourceQuery,
            Some(&goal.id),
            json!({"source_id": source_id, "query": &params.query, "limit": limit}),
        );
        let result = adapter.execute_search(&params, limit, false).await;
        ctx.log(
            EventType::SourceResponse,
            Some(&goal.id),
            json!({
                "source_id": source_id,
                "success": result.success,
                "total": result.total,
                "returned": result.results.len(),
                "http_code": result.http_code,
            }),
        );

        if result.success {
            if result.results.is_empty() {
                ctx.record_source_outcome(source_id, SourceOutcome::ZeroResults);
            } else {
                ctx.record_source_outcome(source_id, SourceOutcome::Success);
            }
            pull.raws = result.results;
            return pull;
        }

        let Some(api_error) = classify(&result, &meta) else {
            pull.failed = true;
            return pull;
        };
        ctx.log(
            EventType::ErrorClassified,
            Some(&goal.id),
            json!({
                "source_id": source_id,
                "category": api_error.category,
                "http_code": api_error.http_code,
                "is_retryable": api_error.is_retryable,
                "is_reformulable": api_error.is_reformulable,
                "message": &api_error.message,
            }),
        );
        ctx.record_source_outcome(source_id, SourceOutcome::Error(api_error.category));

        if api_error.category == ErrorCategory::RateLimit {
            let cooldown = api_error.retry_after.unwrap_or(Duration::from_secs(60));
            ctx.log(
                EventType::RateLimitHit,
                Some(&goal.id),
                json!({"source_id": source_id, "cooldown_s": cooldown.as_secs()}),
            );
            ctx.rate_limit_source(source_id, cooldown);
            ctx.add_limitation(
                "rate_limit",
                format!("{source_id} was rate limited and skipped for the rest of the run"),
            );
            pull.failed = true;
            return pull;
        }

        if api_error.is_reformulable && reformulations < ctx.constraints.max_retries_per_goal {
            reformulations += 1;
            match reformulate_query(ctx, goal, source_id, &params, &api_error.message).await {
                Ok(Some((new_params, cost))) => {
                    pull.cost_usd += cost;
                    ctx.log(
                        EventType::Reformulation,
                        Some(&goal.id),
                        json!({
                            "source_id": source_id,
                            "attempt": reformulations,
                            "query": &new_params.query,
                        }),
                    );
                    params = new_params;
                    continue;
                }
                Ok(None) | Err(_) => {
                    pull.failed = true;
                    return pull;
                }
            }
        }

        if api_error.is_retryable && retries < retry_policy.max_retries {
            retries += 1;
            tokio::time::sleep(retry_policy.delay_for_attempt(retries)).await;
            continue;
        }

        pull.failed = true;
        return pull;
    }
}

async fn reformulate_query(
    ctx: &RunContext,
    goal: &ResearchGoal,
    source_id: &str,
    prior: &QueryParams,
    error: &str,
) -> Result<Option<(QueryParams, f64)>> {
    let vars = [
        ("description", goal.description.clone()),
        ("source_id", source_id.to_string()),
        ("params", serde_json::to_string(prior)?),
        ("error", error.to_string()),
    ];
    let resp = ctx
        .llm
        .call(&REFORMULATE, &vars, &reformulate_schema(), Some(&goal.id))
        .await?;
    let params = QueryParams {
        query: resp.data["query"].as_str().unwrap_or_default().to_string(),
        date_from: resp.data["date_from"].as_str().map(str::to_string),
        date_to: resp.data["date_to"].as_str().map(str::to_string),
        extra: prior.extra.clone(),
    };
    Ok(params.sanitized().map(|p| (p, resp.cost_usd)))
}

/// Run the full EXECUTE pass for a goal.
pub async fn execute_goal(
    ctx: &RunContext,
    goal: &ResearchGoal,
    assessment: &Assessment,
) -> Result<ExecOutcome> {
    let mut outcome = ExecOutcome::default();
    let retry_policy = RetryPolicy::default();

    let (selection, selection_cost) = select_sources(ctx, goal, assessment).await;
    outcome.cost_usd += selection_cost;

    // Parallel fan-out, bounded by max_concurrent.
    let fanout = Arc::new(Semaphore::new(ctx.constraints.max_concurrent.max(1)));
    let pulls = join_all(selection.sources.iter().map(|source_id| {
        let fanout = fanout.clone();
        let retry_policy = retry_policy.clone();
        async move {
            let _slot = fanout.acquire().await.expect("fan-out semaphore closed");
            let pull = pull_source(ctx, goal, assessment, source_id, &retry_policy).await;
            (source_id.clone(), pull)
        }
    }))
    .await;

    let mut raws: Vec<RawResult> = Vec::new();
    let mut results_per_source: HashMap<String, usize> = HashMap::new();
    for (source_id, pull) in pulls {
        outcome.cost_usd += pull.cost_usd;
        if pull.failed {
            outcome.failed_sources.push(source_id.clone());
            if selection.primary.as_deref() == Some(source_id.as_str()) {
                ctx.record_critical_failure(&goal.id, &source_id);
                ctx.add_limitation(
                    "critical_source_failure",
                    format!("primary source {source_id} failed for goal {}", goal.id),
                );
            } else {
                ctx.add_limitation(
                    "source_failure",
                    format!("{source_id} failed for goal {}", goal.id),
                );
            }
        }
        results_per_source.insert(source_id.clone(), pull.raws.len());
        raws.extend(pull.raws);
    }

    // URL dedup before filtering: known URLs become index references.
    let mut fresh: Vec<RawResult> = Vec::new();
    for raw in raws {
        if let Some(url) = raw.url.as_deref() {
            if let Some(existing) = ctx.lookup_url(url) {
                ctx.log(
                    EventType::UrlDuplicate,
                    Some(&goal.id),
                    json!({"evidence_id": existing, "url": url}),
                );
                ctx.attach_evidence(&goal.id, existing);
                if !outcome.evidence_ids.contains(&existing) {
                    outcome.evidence_ids.push(existing);
                }
                continue;
            }
        }
        fresh.push(raw);
    }

    let mut accepted_per_source: HashMap<String, usize> = HashMap::new();
    for batch in fresh.chunks(FILTER_BATCH_SIZE) {
        if ctx.budget.should_stop().is_some() {
            break;
        }
        let (verdicts, filter_cost) = match filter_batch(ctx, goal, batch).await {
            Ok(v) => v,
            Err(err) if err.is_budget_exhausted() || err.is_cancelled() => break,
            Err(err) => return Err(err),
        };
        outcome.cost_usd += filter_cost;

        for verdict in verdicts {
            let raw = &batch[verdict.index];
            if verdict.score < ctx.constraints.filter_threshold {
                outcome.rejected += 1;
                ctx.log(
                    EventType::EvidenceRejected,
                    Some(&goal.id),
                    json!({
                        "source_id": &raw.source_id,
                        "url": &raw.url,
                        "score": verdict.score,
                        "rationale": &verdict.rationale,
                    }),
                );
                continue;
            }

            let (extraction, extract_cost) = match extract_evidence(ctx, goal, raw).await {
                Ok(e) => e,
                Err(err) if err.is_budget_exhausted() || err.is_cancelled() => break,
                Err(err) => return Err(err),
            };
            outcome.cost_usd += extract_cost;

            let draft = EvidenceDraft {
                raw: raw.clone(),
                llm_summary: extraction.summary,
                extracted_facts: extraction.facts,
                extracted_entities: extraction.entities,
                extracted_dates: extraction.dates,
                relevance_score: verdict.score,
                filter_rationale: verdict.rationale,
                truncated: extraction.truncated,
            };
            match ctx.admit_evidence(&goal.id, draft)? {
                crate::context::Admission::Fresh(id) => {
                    outcome.accepted += 1;
                    *accepted_per_source.entry(raw.source_id.clone()).or_default() += 1;
                    if !outcome.evidence_ids.contains(&id) {
                        outcome.evidence_ids.push(id);
                    }
                    ctx.log(
                        EventType::EvidenceAccepted,
                        Some(&goal.id),
                        json!({
                            "evidence_id": id,
                            "source_id": &raw.source_id,
                            "url": &raw.url,
                            "score": verdict.score,
                        }),
                    );
                }
                crate::context::Admission::Duplicate(id) => {
                    ctx.log(
                        EventType::UrlDuplicate,
                        Some(&goal.id),
                        json!({"evidence_id": id, "url": &raw.url}),
                    );
                    if !outcome.evidence_ids.contains(&id) {
                        outcome.evidence_ids.push(id);
                    }
                }
            }
        }
    }

    // Sources that returned results none of which survived the filter.
    for (source_id, returned) in &results_per_source {
        if *returned > 0 && accepted_per_source.get(source_id).copied().unwrap_or(0) == 0 {
            ctx.record_source_outcome(source_id, SourceOutcome::LowQuality);
        }
    }

    if outcome.accepted < ctx.constraints.min_results_to_continue {
        ctx.add_limitation(
            "insufficient_results",
            format!(
                "goal {} accepted {} result(s), below the configured minimum of {}",
                goal.id, outcome.accepted, ctx.constraints.min_results_to_continue
            ),
        );
    }

    Ok(outcome)
}
