//! Action assessment: the first LLM decision of every goal.

use crate::context::RunContext;
use crate::error::Result;
use crate::goal::{Action, ResearchGoal};
use crate::llm::gateway::PromptTemplate;
use crate::llm::schema::{FieldSpec, FieldType, ResponseSchema};
use crate::source::ParamHints;
use serde_json::json;

use super::SiblingNote;

/// How many index entries the assessor prompt may see.
const INDEX_DIGEST_CAP: usize = 12;

const ASSESS: PromptTemplate = PromptTemplate {
    name: "assess_action",
    system: "You plan one step of an investigative research run. Choose exactly one action for \
             the current goal:\n\
             - EXECUTE: query external sources now; right for concrete, answerable questions.\n\
             - DECOMPOSE: split into sub-goals; right for broad, comparative, or multi-entity \
             questions.\n\
             - ANALYZE: answer from evidence already collected in this run; right when the \
             evidence digest below already covers the goal.\n\
             Set comparative to true when the goal asks to compare, contrast, or synthesize \
             across entities or time periods. Today is {current_date}.",
    user: "Goal {goal_id} (depth {depth} of {max_depth}): {description}\n\n\
           Remaining budget: ${remaining_cost} / {remaining_secs}s / {remaining_goals} goals\n\n\
           Completed sibling goals:\n{siblings}\n\n\
           Evidence already collected ({index_len} items total, showing {digest_len}):\n{digest}",
    wants_date: true,
};

/// Assessor output.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub action: Action,
    pub rationale: String,
    pub suggested_sources: Vec<String>,
    pub param_hints: Option<ParamHints>,
    pub comparative: bool,
}

fn assess_schema() -> ResponseSchema {
    ResponseSchema::new(
        "assess_action",
        vec![
            FieldSpec::new(
                "action",
                FieldType::enum_of(["EXECUTE", "DECOMPOSE", "ANALYZE"]),
            ),
            FieldSpec::new("rationale", FieldType::String),
            FieldSpec::new("comparative", FieldType::Boolean).with_default(json!(false)),
            FieldSpec::new("suggested_sources", FieldType::list(FieldType::String))
                .with_default(json!([])),
            FieldSpec::new("param_hints", FieldType::object(vec![])).optional(),
        ],
    )
}

/// Decide the action for a goal. Depth at or past `max_depth` forbids
/// DECOMPOSE: the choice is coerced to EXECUTE and noted in the rationale.
pub async fn assess_action(
    ctx: &RunContext,
    goal: &ResearchGoal,
    siblings: &[SiblingNote],
) -> Result<(Assessment, f64)> {
    let (digest, index_len) = ctx.index_digest(&goal.description, INDEX_DIGEST_CAP);
    let digest_text = if digest.is_empty() {
        "(none)".to_string()
    } else {
        digest
            .iter()
            .map(|e| format!("E{} [goal {}]: {}", e.evidence_id, e.goal_id, e.summary_for_selection))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let siblings_text = if siblings.is_empty() {
        "(none)".to_string()
    } else {
        siblings
            .iter()
            .map(|s| format!("[{}] {} -> {}: {}", s.goal_id, s.description, s.status, s.summary))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let snapshot = ctx.budget.snapshot();

    let vars = [
        ("goal_id", goal.id.clone()),
        ("depth", goal.depth.to_string()),
        ("max_depth", ctx.constraints.max_depth.to_string()),
        ("description", goal.description.clone()),
        ("remaining_cost", format!("{:.4}", snapshot.remaining_cost_usd)),
        ("remaining_secs", snapshot.remaining_secs.to_string()),
        ("remaining_goals", snapshot.remaining_goals.to_string()),
        ("siblings", siblings_text),
        ("index_len", index_len.to_string()),
        ("digest_len", digest.len().to_string()),
        ("digest", digest_text),
    ];

    let resp = ctx
        .llm
        .call(&ASSESS, &vars, &assess_schema(), Some(&goal.id))
        .await?;

    let mut action = match resp.data["action"].as_str() {
        Some("DECOMPOSE") => Action::Decompose,
        Some("ANALYZE") => Action::Analyze,
        _ => Action::Execute,
    };
    let mut rationale = resp.data["rationale"].as_str().unwrap_or_default().to_string();

    if action == Action::Decompose && goal.depth >= ctx.constraints.max_depth {
        action = Action::Execute;
        rationale = format!("{rationale} [depth cap reached; decomposition coerced to EXECUTE]");
    }
    // ANALYZE with nothing in the index cannot produce evidence.
    if action == Action::Analyze && index_len == 0 {
        action = Action::Execute;
        rationale = format!("{rationale} [empty run index; ANALYZE coerced to EXECUTE]");
    }

    let assessment = Assessment {
        action,
        rationale,
        suggested_sources: resp.data["suggested_sources"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        param_hints: resp.data["param_hints"].as_object().cloned(),
        comparative: resp.data["comparative"].as_bool().unwrap_or(false),
    };
    Ok((assessment, resp.cost_usd))
}
