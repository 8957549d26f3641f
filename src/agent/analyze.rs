//! The ANALYZE action: global evidence selection and synthesis.
//!
//! ANALYZE is the only path that consults evidence across branches: a
//! selection call picks relevant evidence ids from the whole run index, a
//! synthesis call reasons over them. Selected ids are attached to the
//! analyzing goal, so cross-branch reuse shows up in `result.by_goal`.

use crate::context::RunContext;
use crate::error::Result;
use crate::evidence::EvidenceId;
use crate::goal::ResearchGoal;
use crate::journal::EventType;
use crate::llm::gateway::PromptTemplate;
use crate::llm::schema::{FieldSpec, FieldType, ResponseSchema};
use serde_json::json;

/// How many index entries the selection prompt may see.
const SELECTION_DIGEST_CAP: usize = 40;
/// How many evidence records the synthesis prompt may see.
const SYNTHESIS_EVIDENCE_CAP: usize = 20;

const SELECT_EVIDENCE: PromptTemplate = PromptTemplate {
    name: "global_evidence_selection",
    system: "You pick which already-collected evidence items bear on a research goal. Select \
             only items that directly help answer it, from any branch of the investigation.",
    user: "Goal: {description}\n\nCollected evidence:\n{digest}",
    wants_date: false,
};

const SYNTHESIZE: PromptTemplate = PromptTemplate {
    name: "synthesize_answer",
    system: "You write the answer to a research goal from collected evidence. Cite evidence as \
             [E<id>]. State what the evidence supports and what remains unknown. Calibrate \
             confidence (0-1) honestly: lower it when sources failed or were rate limited, \
             when evidence is thin, or when items conflict.",
    user: "Goal: {description}\n\nEvidence:\n{evidence}\n\nKnown collection problems this \
           run:\n{problems}",
    wants_date: true,
};

fn select_schema() -> ResponseSchema {
    ResponseSchema::new(
        "global_evidence_selection",
        vec![
            FieldSpec::new("evidence_ids", FieldType::list(FieldType::Integer)),
            FieldSpec::new("rationale", FieldType::String).with_default(json!("")),
        ],
    )
}

fn synthesize_schema() -> ResponseSchema {
    ResponseSchema::new(
        "synthesize_answer",
        vec![
            FieldSpec::new("answer", FieldType::String),
            FieldSpec::new("confidence", FieldType::Float),
            FieldSpec::new("limitations", FieldType::list(FieldType::String))
                .with_default(json!([])),
        ],
    )
}

/// Outcome of an ANALYZE pass.
#[derive(Debug, Default)]
pub struct Analysis {
    pub selected: Vec<EvidenceId>,
    pub answer: String,
    pub confidence: f64,
    pub limitations: Vec<String>,
    pub cost_usd: f64,
}

/// Select evidence from the run index and synthesize an answer.
pub async fn analyze_goal(ctx: &RunContext, goal: &ResearchGoal) -> Result<Analysis> {
    let mut analysis = Analysis::default();

    let (digest, total) = ctx.index_digest(&goal.description, SELECTION_DIGEST_CAP);
    if digest.is_empty() {
        analysis.answer = "No evidence has been collected yet for this goal.".to_string();
        analysis.confidence = 0.1;
        return Ok(analysis);
    }

    let digest_text = digest
        .iter()
        .map(|e| format!("E{} [goal {}]: {}", e.evidence_id, e.goal_id, e.summary_for_selection))
        .collect::<Vec<_>>()
        .join("\n");
    let vars = [
        ("description", goal.description.clone()),
        ("digest", digest_text),
    ];
    let resp = ctx
        .llm
        .call(&SELECT_EVIDENCE, &vars, &select_schema(), Some(&goal.id))
        .await?;
    analysis.cost_usd += resp.cost_usd;

    let known: Vec<EvidenceId> = digest.iter().map(|e| e.evidence_id).collect();
    let mut selected: Vec<EvidenceId> = Vec::new();
    if let Some(ids) = resp.data["evidence_ids"].as_array() {
        for id in ids.iter().filter_map(|v| v.as_u64()) {
            if known.contains(&id) && !selected.contains(&id) {
                selected.push(id);
            }
        }
    }

    ctx.log(
        EventType::GlobalEvidenceSelection,
        Some(&goal.id),
        json!({
            "considered": total,
            "shown": digest.len(),
            "selected": &selected,
            "rationale": &resp.data["rationale"],
        }),
    );

    if selected.is_empty() {
        analysis.answer =
            "None of the collected evidence bears on this goal.".to_string();
        analysis.confidence = 0.1;
        return Ok(analysis);
    }

    // Cross-branch reuse: the selected ids now also belong to this goal.
    for &id in &selected {
        ctx.attach_evidence(&goal.id, id);
    }

    let records = ctx.get_evidence(&selected);
    let shown = records.len().min(SYNTHESIS_EVIDENCE_CAP);
    if records.len() > SYNTHESIS_EVIDENCE_CAP {
        ctx.log(
            EventType::EvidenceTruncated,
            Some(&goal.id),
            json!({
                "list": "synthesis_evidence",
                "original": records.len(),
                "kept": SYNTHESIS_EVIDENCE_CAP,
            }),
        );
    }
    let evidence_text = records[..shown]
        .iter()
        .map(|e| {
            let facts = if e.extracted_facts.is_empty() {
                String::new()
            } else {
                format!("\n  facts: {}", e.extracted_facts.join("; "))
            };
            format!("E{}: {}{}", e.evidence_id, e.llm_summary, facts)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut problems: Vec<String> = ctx
        .limitations()
        .iter()
        .map(|l| format!("{}: {}", l.kind, l.detail))
        .collect();
    if problems.is_empty() {
        problems.push("(none)".to_string());
    }

    let vars = [
        ("description", goal.description.clone()),
        ("evidence", evidence_text),
        ("problems", problems.join("\n")),
    ];
    let resp = ctx
        .llm
        .call(&SYNTHESIZE, &vars, &synthesize_schema(), Some(&goal.id))
        .await?;
    analysis.cost_usd += resp.cost_usd;

    analysis.selected = selected;
    analysis.answer = resp.data["answer"].as_str().unwrap_or_default().to_string();
    analysis.confidence = resp.data["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
    analysis.limitations = resp.data["limitations"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    // A failed primary source anywhere in this subtree caps confidence.
    if ctx.critical_failure_in_subtree(&goal.id) {
        analysis.confidence = analysis.confidence.min(0.6);
    }

    Ok(analysis)
}
