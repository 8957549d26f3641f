//! The DECOMPOSE action: sub-goal planning, DAG validation, and
//! topological dependency grouping.

use crate::context::RunContext;
use crate::error::Result;
use crate::goal::ResearchGoal;
use crate::journal::EventType;
use crate::llm::gateway::PromptTemplate;
use crate::llm::schema::{FieldSpec, FieldType, ResponseSchema};
use serde_json::json;

use super::assess::Assessment;

/// Upper bound on sub-goals per decomposition.
const MAX_SUBGOALS: usize = 8;

const DECOMPOSE: PromptTemplate = PromptTemplate {
    name: "decompose_goal",
    system: "You split a research goal into 2-{max_subgoals} sub-goals. Each sub-goal must be \
             independently pursuable. Use dependencies (indices into your own list) when one \
             sub-goal needs another's findings. For comparative or synthesis goals you MUST \
             include a final synthesis sub-goal, marked with synthesis=true, that depends on \
             every data-collection sub-goal.",
    user: "Goal: {description}\n\nThis goal was judged comparative: {comparative}",
    wants_date: false,
};

fn decompose_schema() -> ResponseSchema {
    ResponseSchema::new(
        "decompose_goal",
        vec![FieldSpec::new(
            "subgoals",
            FieldType::list(FieldType::object(vec![
                FieldSpec::new("description", FieldType::String),
                FieldSpec::new("dependencies", FieldType::list(FieldType::Integer))
                    .with_default(json!([])),
                FieldSpec::new("synthesis", FieldType::Boolean).with_default(json!(false)),
            ])),
        )],
    )
}

#[derive(Debug, Clone)]
struct SubgoalSpec {
    description: String,
    dependencies: Vec<usize>,
    synthesis: bool,
}

/// A validated decomposition: child goals plus their concurrent execution
/// groups (indices into `children`).
#[derive(Debug)]
pub struct Decomposition {
    pub children: Vec<ResearchGoal>,
    pub groups: Vec<Vec<usize>>,
    pub cost_usd: f64,
}

/// Plan a decomposition. Returns `Ok(None)` when the plan is structurally
/// invalid (out-of-range dependency, cycle, empty list); the caller falls
/// back to EXECUTE on the same goal.
pub async fn plan_decomposition(
    ctx: &RunContext,
    goal: &ResearchGoal,
    assessment: &Assessment,
) -> Result<Option<Decomposition>> {
    let vars = [
        ("description", goal.description.clone()),
        ("comparative", assessment.comparative.to_string()),
        ("max_subgoals", MAX_SUBGOALS.to_string()),
    ];
    let resp = ctx
        .llm
        .call(&DECOMPOSE, &vars, &decompose_schema(), Some(&goal.id))
        .await?;
    let cost_usd = resp.cost_usd;

    let mut specs: Vec<SubgoalSpec> = resp.data["subgoals"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .map(|v| SubgoalSpec {
            description: v["description"].as_str().unwrap_or_default().to_string(),
            dependencies: v["dependencies"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|d| d.as_u64())
                        .map(|d| d as usize)
                        .collect()
                })
                .unwrap_or_default(),
            synthesis: v["synthesis"].as_bool().unwrap_or(false),
        })
        .collect();

    if specs.is_empty() {
        ctx.log(
            EventType::DecompositionInvalid,
            Some(&goal.id),
            json!({"reason": "empty decomposition"}),
        );
        return Ok(None);
    }

    // Trimming for size must stay visible: warn with original and kept
    // counts and mark the logged plan truncated.
    let original = specs.len();
    let mut truncated = false;
    if specs.len() > MAX_SUBGOALS {
        specs.truncate(MAX_SUBGOALS);
        for spec in &mut specs {
            spec.dependencies.retain(|d| *d < MAX_SUBGOALS);
        }
        truncated = true;
        ctx.log(
            EventType::EvidenceTruncated,
            Some(&goal.id),
            json!({"list": "decomposition", "original": original, "kept": MAX_SUBGOALS}),
        );
    }

    if let Some(reason) = validate_dependencies(&specs) {
        ctx.log(
            EventType::DecompositionInvalid,
            Some(&goal.id),
            json!({"reason": reason}),
        );
        return Ok(None);
    }

    // Comparative questions must end in a synthesis step that sees the
    // collected data; append one if the model forgot.
    let mut implicit_synthesis = false;
    if assessment.comparative && !specs.iter().any(|s| s.synthesis && !s.dependencies.is_empty()) {
        let all: Vec<usize> = (0..specs.len()).collect();
        specs.push(SubgoalSpec {
            description: format!(
                "Synthesize and compare the findings of the preceding sub-goals to answer: {}",
                goal.description
            ),
            dependencies: all,
            synthesis: true,
        });
        implicit_synthesis = true;
    }

    let Some(groups) = topo_groups(&specs) else {
        ctx.log(
            EventType::DecompositionInvalid,
            Some(&goal.id),
            json!({"reason": "dependency cycle"}),
        );
        return Ok(None);
    };

    let children: Vec<ResearchGoal> = specs
        .iter()
        .enumerate()
        .map(|(i, spec)| {
            ResearchGoal::child(goal, i, spec.description.clone(), spec.dependencies.clone())
        })
        .collect();

    ctx.log(
        EventType::Decomposition,
        Some(&goal.id),
        json!({
            "subgoals": children
                .iter()
                .map(|c| json!({"id": &c.id, "description": &c.description, "dependencies": &c.dependencies}))
                .collect::<Vec<_>>(),
            "implicit_synthesis": implicit_synthesis,
            "truncated": truncated,
        }),
    );
    for (i, group) in groups.iter().enumerate() {
        ctx.log(
            EventType::DependencyGroup,
            Some(&goal.id),
            json!({
                "group_index": i,
                "goal_ids": group.iter().map(|&g| children[g].id.clone()).collect::<Vec<_>>(),
            }),
        );
    }

    Ok(Some(Decomposition {
        children,
        groups,
        cost_usd,
    }))
}

/// Check indices: in range and not self-referential.
fn validate_dependencies(specs: &[SubgoalSpec]) -> Option<String> {
    for (i, spec) in specs.iter().enumerate() {
        for &dep in &spec.dependencies {
            if dep >= specs.len() {
                return Some(format!(
                    "sub-goal {i} depends on index {dep}, out of range for {} sub-goals",
                    specs.len()
                ));
            }
            if dep == i {
                return Some(format!("sub-goal {i} depends on itself"));
            }
        }
    }
    None
}

/// Group sub-goals by topological level: each group only depends on
/// earlier groups, so its members can run concurrently. Returns `None` on a
/// cycle.
fn topo_groups(specs: &[SubgoalSpec]) -> Option<Vec<Vec<usize>>> {
    let n = specs.len();
    let mut placed = vec![false; n];
    let mut groups = Vec::new();
    let mut remaining = n;

    while remaining > 0 {
        let mut group: Vec<usize> = (0..n)
            .filter(|&i| {
                !placed[i] && specs[i].dependencies.iter().all(|&d| placed[d])
            })
            .collect();
        if group.is_empty() {
            return None;
        }
        group.sort_unstable();
        for &i in &group {
            placed[i] = true;
        }
        remaining -= group.len();
        groups.push(group);
    }
    Some(groups)
}
