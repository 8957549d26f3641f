//! The recursive agent core.
//!
//! [`ResearchAgent::pursue`] drives the per-goal state machine:
//! assess -> (EXECUTE | DECOMPOSE | ANALYZE) -> check-achievement ->
//! follow-ups. Each invocation holds one concurrency permit for its own LLM
//! work and releases it before awaiting children, so a run never deadlocks
//! on its own semaphore. Child goals are spawned as tasks and joined per
//! dependency group; group k+1 sees the results of group k as sibling
//! context.

pub mod analyze;
pub mod assess;
pub mod decompose;
pub mod execute;
pub mod filter;

use crate::context::RunContext;
use crate::error::Error;
use crate::goal::{Action, GoalResult, GoalStatus, ResearchGoal};
use crate::journal::EventType;
use crate::llm::gateway::PromptTemplate;
use crate::llm::schema::{FieldSpec, FieldType, ResponseSchema};
use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

pub use assess::Assessment;
pub use execute::ExecOutcome;

/// Follow-up sub-goals allowed per goal.
const MAX_FOLLOW_UPS: usize = 2;

const CHECK_ACHIEVEMENT: PromptTemplate = PromptTemplate {
    name: "check_achievement",
    system: "You judge whether a research goal has been achieved by the work done so far. Be \
             strict: partial coverage is not achievement. List concrete gaps that further \
             sub-goals could close; leave gaps empty when there is nothing actionable.",
    user: "Goal: {description}\n\nAction taken: {action}\n\
           Evidence accepted for this goal: {evidence_count} (run minimum: {min_results})\n\
           Synthesized answer (empty if none):\n{answer}\n\n\
           Sub-goal outcomes:\n{sub_outcomes}",
    wants_date: false,
};

const FOLLOW_UPS: PromptTemplate = PromptTemplate {
    name: "generate_follow_ups",
    system: "You propose follow-up research sub-goals that close the listed gaps. Propose at \
             most {max_follow_ups}. Do not repeat or rephrase any goal that already exists in \
             this run.",
    user: "Goal: {description}\n\nGaps:\n{gaps}\n\nGoals already pursued in this run:\n{existing}",
    wants_date: false,
};

fn check_schema() -> ResponseSchema {
    ResponseSchema::new(
        "check_achievement",
        vec![
            FieldSpec::new("achieved", FieldType::Boolean),
            FieldSpec::new("confidence", FieldType::Float),
            FieldSpec::new("reasoning", FieldType::String),
            FieldSpec::new("gaps", FieldType::list(FieldType::String)).with_default(json!([])),
        ],
    )
}

fn follow_ups_schema() -> ResponseSchema {
    ResponseSchema::new(
        "generate_follow_ups",
        vec![FieldSpec::new(
            "subgoals",
            FieldType::list(FieldType::String),
        )],
    )
}

/// A completed sibling's outcome, shown to later dependency groups.
#[derive(Debug, Clone)]
pub struct SiblingNote {
    pub goal_id: String,
    pub description: String,
    pub status: GoalStatus,
    pub summary: String,
}

impl SiblingNote {
    fn from_result(result: &GoalResult) -> Self {
        Self {
            goal_id: result.goal.id.clone(),
            description: result.goal.description.clone(),
            status: result.status,
            summary: result.reasoning.chars().take(240).collect(),
        }
    }
}

#[derive(Debug)]
struct Achievement {
    achieved: bool,
    confidence: f64,
    reasoning: String,
    gaps: Vec<String>,
}

/// The recursive research agent for one run.
pub struct ResearchAgent {
    ctx: Arc<RunContext>,
}

impl ResearchAgent {
    pub fn new(ctx: Arc<RunContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Pursue a goal to a terminal [`GoalResult`]. Never returns an error:
    /// every failure mode is a status on the result.
    pub fn pursue(
        self: &Arc<Self>,
        goal: ResearchGoal,
        siblings: Vec<SiblingNote>,
    ) -> BoxFuture<'static, GoalResult> {
        let agent = self.clone();
        Box::pin(async move { agent.pursue_inner(goal, siblings).await })
    }

    async fn pursue_inner(
        self: Arc<Self>,
        goal: ResearchGoal,
        siblings: Vec<SiblingNote>,
    ) -> GoalResult {
        let ctx = self.ctx.clone();
        let started = Instant::now();
        ctx.register_goal(&goal);

        if let Err(reason) = ctx.budget.admit_goal() {
            let result = match reason {
                crate::budget::StopReason::Goals => {
                    GoalResult::skipped(goal, "max_goals reached")
                }
                other => GoalResult::cancelled(goal, other.as_str()),
            };
            return self.finish(result, started);
        }

        let mut permit = match ctx.budget.acquire().await {
            Ok(p) => Some(p),
            Err(err) => {
                return self.finish(GoalResult::cancelled(goal, &err.to_string()), started)
            }
        };

        ctx.log(
            EventType::GoalStarted,
            Some(&goal.id),
            json!({
                "description": &goal.description,
                "depth": goal.depth,
                "parent_id": &goal.parent_id,
                "dependencies": &goal.dependencies,
            }),
        );

        let mut cost_usd = 0.0_f64;

        let (assessment, assess_cost) = match assess::assess_action(&ctx, &goal, &siblings).await
        {
            Ok(v) => v,
            Err(err) => {
                return self.finish(
                    self.result_from_llm_error(goal, err, Vec::new(), Vec::new(), cost_usd),
                    started,
                )
            }
        };
        cost_usd += assess_cost;

        ctx.log(
            EventType::ActionSelected,
            Some(&goal.id),
            json!({
                "action": assessment.action,
                "rationale": &assessment.rationale,
                "suggested_sources": &assessment.suggested_sources,
                "comparative": assessment.comparative,
            }),
        );

        let mut evidence_ids: Vec<u64> = Vec::new();
        let mut sub_results: Vec<GoalResult> = Vec::new();
        let mut synthesized = false;
        let mut answer = String::new();
        let mut accepted = 0usize;
        let mut synthesis_confidence: Option<f64> = None;

        match assessment.action {
            Action::Execute => {
                match execute::execute_goal(&ctx, &goal, &assessment).await {
                    Ok(outcome) => {
                        cost_usd += outcome.cost_usd;
                        accepted = outcome.accepted;
                        evidence_ids = outcome.evidence_ids;
                    }
                    Err(err) => {
                        return self.finish(
                            self.result_from_llm_error(goal, err, evidence_ids, sub_results, cost_usd),
                            started,
                        )
                    }
                }
            }
            Action::Analyze => match analyze::analyze_goal(&ctx, &goal).await {
                Ok(analysis) => {
                    cost_usd += analysis.cost_usd;
                    accepted = analysis.selected.len();
                    synthesized = !analysis.selected.is_empty();
                    synthesis_confidence = Some(analysis.confidence);
                    for limitation in &analysis.limitations {
                        ctx.add_limitation("synthesis", limitation.clone());
                    }
                    evidence_ids = analysis.selected;
                    answer = analysis.answer;
                }
                Err(err) => {
                    return self.finish(
                        self.result_from_llm_error(goal, err, evidence_ids, sub_results, cost_usd),
                        started,
                    )
                }
            },
            Action::Decompose => {
                match decompose::plan_decomposition(&ctx, &goal, &assessment).await {
                    Ok(Some(plan)) => {
                        cost_usd += plan.cost_usd;
                        // Children acquire their own permits; holding ours
                        // across the join would deadlock at max_concurrent=1.
                        permit = None;
                        sub_results = self.run_groups(&goal, plan).await;
                        match ctx.budget.acquire().await {
                            Ok(p) => permit = Some(p),
                            Err(_) => {
                                let mut result =
                                    GoalResult::cancelled(goal, "cancelled during decomposition");
                                result.sub_results = sub_results;
                                result.cost_usd = cost_usd;
                                return self.finish(result, started);
                            }
                        }
                        accepted = sub_results
                            .iter()
                            .map(|r| r.evidence_ids.len())
                            .sum::<usize>();
                    }
                    Ok(None) => {
                        // Invalid decomposition: fall back to EXECUTE on the
                        // same goal, spawning no children.
                        match execute::execute_goal(&ctx, &goal, &assessment).await {
                            Ok(outcome) => {
                                cost_usd += outcome.cost_usd;
                                accepted = outcome.accepted;
                                evidence_ids = outcome.evidence_ids;
                            }
                            Err(err) => {
                                return self.finish(
                                    self.result_from_llm_error(
                                        goal,
                                        err,
                                        evidence_ids,
                                        sub_results,
                                        cost_usd,
                                    ),
                                    started,
                                )
                            }
                        }
                    }
                    Err(err) => {
                        return self.finish(
                            self.result_from_llm_error(goal, err, evidence_ids, sub_results, cost_usd),
                            started,
                        )
                    }
                }
            }
        }

        // check-achievement, with one follow-up round when gaps remain and
        // budget allows.
        let mut synthesis_done = synthesized
            || sub_results.iter().any(GoalResult::subtree_has_synthesis);
        let mut achievement = match self
            .check_achievement(&goal, &assessment, accepted, &answer, &sub_results, synthesis_done)
            .await
        {
            Ok((achievement, cost)) => {
                cost_usd += cost;
                achievement
            }
            Err(err) => {
                let mut result =
                    self.result_from_llm_error(goal, err, evidence_ids, sub_results, cost_usd);
                result.synthesized = synthesized;
                return self.finish(result, started);
            }
        };

        if !achievement.achieved
            && !achievement.gaps.is_empty()
            && goal.depth < ctx.constraints.max_depth
            && ctx.budget.should_stop().is_none()
        {
            // Follow-up children take their own permits.
            drop(permit.take());
            match self
                .run_follow_ups(&goal, &achievement.gaps, sub_results.len())
                .await
            {
                Ok((mut follow_results, cost)) => {
                    cost_usd += cost;
                    if !follow_results.is_empty() {
                        sub_results.append(&mut follow_results);
                        synthesis_done = synthesized
                            || sub_results.iter().any(GoalResult::subtree_has_synthesis);
                        permit = ctx.budget.acquire().await.ok();
                        if permit.is_some() {
                            if let Ok((second, cost)) = self
                                .check_achievement(
                                    &goal,
                                    &assessment,
                                    accepted,
                                    &answer,
                                    &sub_results,
                                    synthesis_done,
                                )
                                .await
                            {
                                cost_usd += cost;
                                achievement = second;
                            }
                        }
                    }
                }
                Err(err) if err.is_budget_exhausted() || err.is_cancelled() => {}
                Err(err) => {
                    tracing::warn!(goal = %goal.id, error = %err, "follow-up generation failed");
                }
            }
        }
        drop(permit);

        let mut confidence = achievement.confidence.clamp(0.0, 1.0);
        // The synthesis call already discounts failed or rate-limited
        // sources in its self-assessment; it caps the goal's confidence.
        if let Some(cap) = synthesis_confidence {
            confidence = confidence.min(cap.clamp(0.0, 1.0));
        }
        if ctx.critical_failure_in_subtree(&goal.id) {
            confidence = confidence.min(0.6);
        }

        let reasoning = if answer.is_empty() {
            achievement.reasoning
        } else {
            format!("{}\n\n{}", answer, achievement.reasoning)
        };

        let result = GoalResult {
            goal,
            status: GoalStatus::Completed,
            evidence_ids,
            sub_results,
            confidence,
            reasoning,
            cost_usd,
            duration_ms: 0,
            error: None,
            synthesized,
        };
        self.finish(result, started)
    }

    /// Spawn each dependency group concurrently, in group order. Later
    /// groups see earlier groups' outcomes as sibling notes.
    async fn run_groups(
        self: &Arc<Self>,
        _parent: &ResearchGoal,
        plan: decompose::Decomposition,
    ) -> Vec<GoalResult> {
        let mut results: Vec<Option<GoalResult>> = plan.children.iter().map(|_| None).collect();
        let mut notes: Vec<SiblingNote> = Vec::new();

        for group in &plan.groups {
            let handles: Vec<(usize, tokio::task::JoinHandle<GoalResult>)> = group
                .iter()
                .map(|&i| {
                    let child = plan.children[i].clone();
                    (i, tokio::spawn(self.pursue(child, notes.clone())))
                })
                .collect();

            for (i, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(join_err) => {
                        let child = plan.children[i].clone();
                        self.ctx.log(
                            EventType::GoalFailed,
                            Some(&child.id),
                            json!({"reason": format!("task panicked: {join_err}")}),
                        );
                        GoalResult::failed(child, "task panicked")
                    }
                };
                results[i] = Some(result);
            }

            for &i in group {
                if let Some(result) = &results[i] {
                    notes.push(SiblingNote::from_result(result));
                }
            }
        }

        results.into_iter().flatten().collect()
    }

    async fn check_achievement(
        &self,
        goal: &ResearchGoal,
        assessment: &Assessment,
        accepted: usize,
        answer: &str,
        sub_results: &[GoalResult],
        synthesis_done: bool,
    ) -> crate::error::Result<(Achievement, f64)> {
        let sub_outcomes = if sub_results.is_empty() {
            "(none)".to_string()
        } else {
            sub_results
                .iter()
                .map(|r| {
                    format!(
                        "[{}] {} -> {} (confidence {:.2})",
                        r.goal.id, r.goal.description, r.status, r.confidence
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let vars = [
            ("description", goal.description.clone()),
            ("action", assessment.action.to_string()),
            ("evidence_count", accepted.to_string()),
            (
                "min_results",
                self.ctx.constraints.min_results_to_continue.to_string(),
            ),
            ("answer", answer.to_string()),
            ("sub_outcomes", sub_outcomes),
        ];
        let resp = self
            .ctx
            .llm
            .call(&CHECK_ACHIEVEMENT, &vars, &check_schema(), Some(&goal.id))
            .await?;

        let mut achieved = resp.data["achieved"].as_bool().unwrap_or(false);
        // Comparative goals are only achieved once a synthesis has actually
        // run somewhere in their subtree.
        if assessment.comparative && !synthesis_done {
            achieved = false;
        }

        Ok((
            Achievement {
                achieved,
                confidence: resp.data["confidence"].as_f64().unwrap_or(0.0),
                reasoning: resp.data["reasoning"].as_str().unwrap_or_default().to_string(),
                gaps: resp.data["gaps"]
                    .as_array()
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            resp.cost_usd,
        ))
    }

    /// Generate and pursue follow-up sub-goals for unresolved gaps.
    async fn run_follow_ups(
        self: &Arc<Self>,
        goal: &ResearchGoal,
        gaps: &[String],
        existing_children: usize,
    ) -> crate::error::Result<(Vec<GoalResult>, f64)> {
        let existing = self
            .ctx
            .goal_catalog()
            .iter()
            .map(|(id, desc)| format!("[{id}] {desc}"))
            .collect::<Vec<_>>()
            .join("\n");
        let vars = [
            ("description", goal.description.clone()),
            ("gaps", gaps.join("\n")),
            ("existing", existing),
            ("max_follow_ups", MAX_FOLLOW_UPS.to_string()),
        ];
        let resp = self
            .ctx
            .llm
            .call(&FOLLOW_UPS, &vars, &follow_ups_schema(), Some(&goal.id))
            .await?;
        let cost = resp.cost_usd;

        let mut descriptions: Vec<String> = resp.data["subgoals"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if descriptions.len() > MAX_FOLLOW_UPS {
            self.ctx.log(
                EventType::EvidenceTruncated,
                Some(&goal.id),
                json!({
                    "list": "follow_ups",
                    "original": descriptions.len(),
                    "kept": MAX_FOLLOW_UPS,
                }),
            );
            descriptions.truncate(MAX_FOLLOW_UPS);
        }
        if descriptions.is_empty() {
            return Ok((Vec::new(), cost));
        }

        let children: Vec<ResearchGoal> = descriptions
            .iter()
            .enumerate()
            .map(|(i, desc)| {
                ResearchGoal::child(goal, existing_children + i, desc.clone(), Vec::new())
            })
            .collect();

        let handles: Vec<tokio::task::JoinHandle<GoalResult>> = children
            .iter()
            .map(|child| tokio::spawn(self.pursue(child.clone(), Vec::new())))
            .collect();

        let mut results = Vec::with_capacity(children.len());
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    self.ctx.log(
                        EventType::GoalFailed,
                        Some(&children[i].id),
                        json!({"reason": format!("task panicked: {join_err}")}),
                    );
                    results.push(GoalResult::failed(children[i].clone(), "task panicked"));
                }
            }
        }
        Ok((results, cost))
    }

    /// Map an LLM-layer error onto the goal's terminal result, preserving
    /// whatever evidence and sub-results were gathered.
    fn result_from_llm_error(
        &self,
        goal: ResearchGoal,
        err: Error,
        evidence_ids: Vec<u64>,
        sub_results: Vec<GoalResult>,
        cost_usd: f64,
    ) -> GoalResult {
        let mut result = match &err {
            Error::BudgetExhausted { .. } => {
                if goal.parent_id.is_none() {
                    GoalResult::cancelled(goal, "budget")
                } else {
                    GoalResult::failed(goal, "budget")
                }
            }
            Error::Cancelled { reason } => {
                let reason = reason.clone();
                GoalResult::cancelled(goal, &reason)
            }
            Error::SchemaValidation { .. } => GoalResult::failed(goal, "llm_schema"),
            other => GoalResult::failed(goal, &other.to_string()),
        };
        result.evidence_ids = evidence_ids;
        result.sub_results = sub_results;
        result.cost_usd = cost_usd;
        result
    }

    /// Stamp the duration and write the terminal event.
    fn finish(&self, mut result: GoalResult, started: Instant) -> GoalResult {
        result.duration_ms = started.elapsed().as_millis() as u64;
        let event_type = match result.status {
            GoalStatus::Completed => EventType::GoalCompleted,
            GoalStatus::Failed => EventType::GoalFailed,
            GoalStatus::Cancelled | GoalStatus::Skipped => EventType::GoalCancelled,
        };
        let payload = json!({
            "status": result.status,
            "confidence": result.confidence,
            "evidence_count": result.evidence_ids.len(),
            "sub_goals": result.sub_results.len(),
            "cost_usd": result.cost_usd,
            "duration_ms": result.duration_ms,
            "error": &result.error,
        });
        // goal_completed has zero loss tolerance; surface write failures
        // loudly instead of swallowing them.
        if let Err(err) = self
            .ctx
            .logger
            .emit(event_type, Some(&result.goal.id), payload)
        {
            tracing::error!(goal = %result.goal.id, error = %err, "failed to write terminal goal event");
        }
        result
    }
}
