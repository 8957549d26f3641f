//! Research goals and their results.

use crate::evidence::EvidenceId;
use serde::{Deserialize, Serialize};

/// A research question or sub-question the agent pursues.
///
/// Goals are immutable once created. `id` is a stable hierarchical string
/// ("0", "0.2", "0.2.1"); parents are referenced by id, never by pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchGoal {
    pub id: String,
    pub description: String,
    pub depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Indices of sibling goals (in the parent's decomposition) that must
    /// complete before this one runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<usize>,
}

impl ResearchGoal {
    /// The root goal of a run.
    pub fn root(description: impl Into<String>) -> Self {
        Self {
            id: "0".to_string(),
            description: description.into(),
            depth: 0,
            parent_id: None,
            dependencies: Vec::new(),
        }
    }

    /// A child goal at sibling index `index`.
    pub fn child(
        parent: &ResearchGoal,
        index: usize,
        description: impl Into<String>,
        dependencies: Vec<usize>,
    ) -> Self {
        Self {
            id: format!("{}.{index}", parent.id),
            description: description.into(),
            depth: parent.depth + 1,
            parent_id: Some(parent.id.clone()),
            dependencies,
        }
    }
}

/// Action chosen by the assessor for one goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Execute,
    Decompose,
    Analyze,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Execute => "EXECUTE",
            Self::Decompose => "DECOMPOSE",
            Self::Analyze => "ANALYZE",
        };
        f.write_str(s)
    }
}

/// Terminal status of a pursued goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of pursuing one goal, including its whole subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalResult {
    pub goal: ResearchGoal,
    pub status: GoalStatus,
    /// Evidence selected for this goal, by id reference
    pub evidence_ids: Vec<EvidenceId>,
    pub sub_results: Vec<GoalResult>,
    /// Self-assessed confidence (0-1), clamped down on critical source
    /// failures
    pub confidence: f64,
    pub reasoning: String,
    /// Cost of this goal's own LLM calls (children account separately)
    pub cost_usd: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether an ANALYZE synthesis ran for this goal itself
    #[serde(default)]
    pub synthesized: bool,
}

impl GoalResult {
    fn bare(goal: ResearchGoal, status: GoalStatus) -> Self {
        Self {
            goal,
            status,
            evidence_ids: Vec::new(),
            sub_results: Vec::new(),
            confidence: 0.0,
            reasoning: String::new(),
            cost_usd: 0.0,
            duration_ms: 0,
            error: None,
            synthesized: false,
        }
    }

    /// A goal that never ran because the run is shutting down.
    pub fn cancelled(goal: ResearchGoal, reason: &str) -> Self {
        let mut result = Self::bare(goal, GoalStatus::Cancelled);
        result.reasoning = format!("cancelled: {reason}");
        result.error = Some(reason.to_string());
        result
    }

    /// A goal that was not admitted (goal-count cap).
    pub fn skipped(goal: ResearchGoal, reason: &str) -> Self {
        let mut result = Self::bare(goal, GoalStatus::Skipped);
        result.reasoning = format!("skipped: {reason}");
        result
    }

    /// A goal that hit a fatal error.
    pub fn failed(goal: ResearchGoal, reason: &str) -> Self {
        let mut result = Self::bare(goal, GoalStatus::Failed);
        result.reasoning = format!("failed: {reason}");
        result.error = Some(reason.to_string());
        result
    }

    /// Whether any goal in this subtree ran an ANALYZE synthesis.
    pub fn subtree_has_synthesis(&self) -> bool {
        self.synthesized || self.sub_results.iter().any(GoalResult::subtree_has_synthesis)
    }

    /// All evidence ids in this subtree, deduplicated, in first-seen order.
    pub fn flatten_evidence_ids(&self) -> Vec<EvidenceId> {
        let mut out = Vec::new();
        self.collect_evidence_ids(&mut out);
        out
    }

    fn collect_evidence_ids(&self, out: &mut Vec<EvidenceId>) {
        for id in &self.evidence_ids {
            if !out.contains(id) {
                out.push(*id);
            }
        }
        for sub in &self.sub_results {
            sub.collect_evidence_ids(out);
        }
    }

    /// Total LLM cost across the subtree.
    pub fn subtree_cost_usd(&self) -> f64 {
        self.cost_usd
            + self
                .sub_results
                .iter()
                .map(GoalResult::subtree_cost_usd)
                .sum::<f64>()
    }

    /// Number of goals in the subtree, this one included.
    pub fn subtree_goal_count(&self) -> usize {
        1 + self
            .sub_results
            .iter()
            .map(GoalResult::subtree_goal_count)
            .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_ids_are_hierarchical() {
        let root = ResearchGoal::root("q");
        let child = ResearchGoal::child(&root, 2, "sub", vec![0, 1]);
        assert_eq!(child.id, "0.2");
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id.as_deref(), Some("0"));

        let grandchild = ResearchGoal::child(&child, 0, "subsub", vec![]);
        assert_eq!(grandchild.id, "0.2.0");
        assert_eq!(grandchild.depth, 2);
    }

    #[test]
    fn test_subtree_synthesis_detection() {
        let root = ResearchGoal::root("q");
        let mut result = GoalResult::bare(root.clone(), GoalStatus::Completed);
        assert!(!result.subtree_has_synthesis());

        let mut child = GoalResult::bare(
            ResearchGoal::child(&root, 0, "c", vec![]),
            GoalStatus::Completed,
        );
        child.synthesized = true;
        result.sub_results.push(child);
        assert!(result.subtree_has_synthesis());
    }

    #[test]
    fn test_flatten_dedups_shared_evidence() {
        let root = ResearchGoal::root("q");
        let mut result = GoalResult::bare(root.clone(), GoalStatus::Completed);
        result.evidence_ids = vec![1, 2];

        let mut a = GoalResult::bare(
            ResearchGoal::child(&root, 0, "a", vec![]),
            GoalStatus::Completed,
        );
        a.evidence_ids = vec![2, 3];
        let mut b = GoalResult::bare(
            ResearchGoal::child(&root, 1, "b", vec![]),
            GoalStatus::Completed,
        );
        b.evidence_ids = vec![3, 4];
        result.sub_results.push(a);
        result.sub_results.push(b);

        assert_eq!(result.flatten_evidence_ids(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_subtree_rollups() {
        let root = ResearchGoal::root("q");
        let mut result = GoalResult::bare(root.clone(), GoalStatus::Completed);
        result.cost_usd = 0.01;
        let mut child = GoalResult::bare(
            ResearchGoal::child(&root, 0, "c", vec![]),
            GoalStatus::Failed,
        );
        child.cost_usd = 0.02;
        result.sub_results.push(child);

        assert!((result.subtree_cost_usd() - 0.03).abs() < 1e-9);
        assert_eq!(result.subtree_goal_count(), 2);
    }

    #[test]
    fn test_action_wire_format() {
        assert_eq!(serde_json::to_string(&Action::Execute).unwrap(), "\"EXECUTE\"");
        assert_eq!(
            serde_json::from_str::<Action>("\"DECOMPOSE\"").unwrap(),
            Action::Decompose
        );
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(GoalStatus::Cancelled.as_str(), "cancelled");
        let cancelled = GoalResult::cancelled(ResearchGoal::root("q"), "time");
        assert_eq!(cancelled.status, GoalStatus::Cancelled);
        assert_eq!(cancelled.error.as_deref(), Some("time"));
    }
}
