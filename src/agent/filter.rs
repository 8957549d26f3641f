//! Goal-focused result filtering and structured fact extraction.
//!
//! The filter applies a strict rubric: for entity-specific goals the entity
//! must actually appear in the result; keyword overlap alone does not pass.
//! There is no lenient fallback when the strict pass accepts nothing.

use crate::context::RunContext;
use crate::error::Result;
use crate::evidence::Entity;
use crate::goal::ResearchGoal;
use crate::journal::EventType;
use crate::llm::gateway::PromptTemplate;
use crate::llm::schema::{FieldSpec, FieldType, ResponseSchema};
use crate::source::RawResult;
use serde_json::json;

/// Results per filter LLM call.
pub(crate) const FILTER_BATCH_SIZE: usize = 8;

/// Per-evidence bounds on extracted lists.
const MAX_FACTS: usize = 10;
const MAX_ENTITIES: usize = 10;
const MAX_DATES: usize = 10;

const FILTER: PromptTemplate = PromptTemplate {
    name: "filter_results",
    system: "You filter search results for an investigative research goal. Score each result \
             0-10 for how directly it bears on the goal. Apply a strict rubric: if the goal \
             names a specific entity (person, company, agency), the result must actually \
             mention that entity to score above 5. Shared keywords without the entity are not \
             relevance. Give every result a one-sentence rationale.",
    user: "Goal: {description}\n\nResults (index | source | title | url | snippet):\n{results}",
    wants_date: false,
};

const EXTRACT: PromptTemplate = PromptTemplate {
    name: "extract_evidence",
    system: "You extract structured findings from one search result for a research goal. Be \
             faithful to the text; do not infer beyond it. Limit yourself to the {max_facts} \
             most load-bearing facts, {max_entities} entities, and {max_dates} dates. Dates \
             must be ISO-8601 (YYYY-MM-DD, or YYYY-MM / YYYY when the day is unknown).",
    user: "Goal: {description}\n\nSource: {source_id}\nTitle: {title}\nURL: {url}\n\
           Content:\n{content}",
    wants_date: false,
};

/// One scored result from the filter call.
#[derive(Debug, Clone)]
pub struct FilterVerdict {
    pub index: usize,
    pub score: u8,
    pub rationale: String,
}

fn filter_schema() -> ResponseSchema {
    ResponseSchema::new(
        "filter_results",
        vec![FieldSpec::new(
            "verdicts",
            FieldType::list(FieldType::object(vec![
                FieldSpec::new("index", FieldType::Integer),
                FieldSpec::new("score", FieldType::Integer),
                FieldSpec::new("rationale", FieldType::String),
            ])),
        )],
    )
}

fn extract_schema() -> ResponseSchema {
    ResponseSchema::new(
        "extract_evidence",
        vec![
            FieldSpec::new("summary", FieldType::String),
            FieldSpec::new("facts", FieldType::list(FieldType::String)).with_default(json!([])),
            FieldSpec::new(
                "entities",
                FieldType::list(FieldType::object(vec![
                    FieldSpec::new("name", FieldType::String),
                    FieldSpec::new("type", FieldType::String),
                ])),
            )
            .with_default(json!([])),
            FieldSpec::new("dates", FieldType::list(FieldType::String)).with_default(json!([])),
        ],
    )
}

/// Score one batch of results against the goal. Results the model fails to
/// score come back with score 0 so they are rejected, never silently kept.
pub async fn filter_batch(
    ctx: &RunContext,
    goal: &ResearchGoal,
    raws: &[RawResult],
) -> Result<(Vec<FilterVerdict>, f64)> {
    let listing = raws
        .iter()
        .enumerate()
        .map(|(i, raw)| format!("{i} | {} | {}", raw.source_id, raw.digest()))
        .collect::<Vec<_>>()
        .join("\n");

    let vars = [
        ("description", goal.description.clone()),
        ("results", listing),
    ];
    let resp = ctx
        .llm
        .call(&FILTER, &vars, &filter_schema(), Some(&goal.id))
        .await?;

    let mut verdicts: Vec<FilterVerdict> = Vec::with_capacity(raws.len());
    let returned = resp.data["verdicts"].as_array().cloned().unwrap_or_default();
    for i in 0..raws.len() {
        let verdict = returned
            .iter()
            .find(|v| v["index"].as_u64() == Some(i as u64));
        match verdict {
            Some(v) => verdicts.push(FilterVerdict {
                index: i,
                score: v["score"].as_u64().unwrap_or(0).min(10) as u8,
                rationale: v["rationale"].as_str().unwrap_or_default().to_string(),
            }),
            None => verdicts.push(FilterVerdict {
                index: i,
                score: 0,
                rationale: "no verdict returned by filter".to_string(),
            }),
        }
    }

    ctx.log(
        EventType::RelevanceFiltering,
        Some(&goal.id),
        json!({
            "batch_size": raws.len(),
            "threshold": ctx.constraints.filter_threshold,
            "scores": verdicts.iter().map(|v| v.score).collect::<Vec<_>>(),
        }),
    );

    Ok((verdicts, resp.cost_usd))
}

/// Structured extraction for one kept result.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub summary: String,
    pub facts: Vec<String>,
    pub entities: Vec<Entity>,
    pub dates: Vec<String>,
    /// True when a list exceeded its bound and was trimmed
    pub truncated: bool,
}

/// Extract summary, facts, entities, and dates from one result, enforcing
/// the per-evidence bounds. Overlong lists are trimmed and the trim is
/// logged as `evidence_truncated`.
pub async fn extract_evidence(
    ctx: &RunContext,
    goal: &ResearchGoal,
    raw: &RawResult,
) -> Result<(Extraction, f64)> {
    let content = raw
        .raw_content
        .as_deref()
        .or(raw.snippet.as_deref())
        .unwrap_or_default();

    let vars = [
        ("description", goal.description.clone()),
        ("source_id", raw.source_id.clone()),
        ("title", raw.title.clone().unwrap_or_default()),
        ("url", raw.url.clone().unwrap_or_default()),
        ("content", content.chars().take(12_000).collect::<String>()),
        ("max_facts", MAX_FACTS.to_string()),
        ("max_entities", MAX_ENTITIES.to_string()),
        ("max_dates", MAX_DATES.to_string()),
    ];
    let resp = ctx
        .llm
        .call(&EXTRACT, &vars, &extract_schema(), Some(&goal.id))
        .await?;

    let mut extraction = Extraction {
        summary: resp.data["summary"].as_str().unwrap_or_default().to_string(),
        facts: string_list(&resp.data["facts"]),
        entities: resp.data["entities"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| {
                        Some(Entity {
                            name: v["name"].as_str()?.to_string(),
                            entity_type: v["type"].as_str().unwrap_or("unknown").to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default(),
        dates: string_list(&resp.data["dates"]),
        truncated: false,
    };

    for (field, len, cap) in [
        ("facts", extraction.facts.len(), MAX_FACTS),
        ("entities", extraction.entities.len(), MAX_ENTITIES),
        ("dates", extraction.dates.len(), MAX_DATES),
    ] {
        if len > cap {
            ctx.log(
                EventType::EvidenceTruncated,
                Some(&goal.id),
                json!({
                    "list": field,
                    "original": len,
                    "kept": cap,
                    "url": &raw.url,
                }),
            );
            extraction.truncated = true;
        }
    }
    extraction.facts.truncate(MAX_FACTS);
    extraction.entities.truncate(MAX_ENTITIES);
    extraction.dates.truncate(MAX_DATES);

    Ok((extraction, resp.cost_usd))
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
