//! Final report rendering and run metadata.

use crate::config::Constraints;
use crate::context::{Limitation, SourceStats};
use crate::evidence::ProcessedEvidence;
use crate::goal::{GoalResult, GoalStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Run-level totals for `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTotals {
    pub goals: usize,
    pub evidence: usize,
    pub cost_usd: f64,
}

/// Per-source rollup for `metadata.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesSummary {
    pub queried: usize,
    pub failed: usize,
    pub rate_limited: Vec<String>,
}

impl SourcesSummary {
    pub fn from_stats(stats: &HashMap<String, SourceStats>, rate_limited: Vec<String>) -> Self {
        Self {
            queried: stats.len(),
            failed: stats.values().filter(|s| !s.errors.is_empty()).count(),
            rate_limited,
        }
    }
}

/// Contents of `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub constraints: Constraints,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Terminal run status: completed | failed | skipped | cancelled | crashed
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub totals: RunTotals,
    pub sources: SourcesSummary,
    pub limitations: Vec<Limitation>,
}

/// Render the final markdown report with `[E<id>]` citations.
pub fn render_report(
    question: &str,
    root: &GoalResult,
    evidence: &[ProcessedEvidence],
    metadata: &RunMetadata,
) -> String {
    let mut md = String::new();

    md.push_str(&format!("# Research Report: {question}\n\n"));
    md.push_str(&format!(
        "- Run: `{}`\n- Date: {}\n- Status: {}{}\n- Goals: {} | Evidence: {} | Cost: ${:.4}\n\n",
        metadata.run_id,
        metadata.started_at.format("%Y-%m-%d %H:%M UTC"),
        metadata.status,
        metadata
            .reason
            .as_deref()
            .map(|r| format!(" ({r})"))
            .unwrap_or_default(),
        metadata.totals.goals,
        metadata.totals.evidence,
        metadata.totals.cost_usd,
    ));

    md.push_str("## Executive Summary\n\n");
    if root.reasoning.is_empty() {
        md.push_str("No summary was produced.\n\n");
    } else {
        md.push_str(&root.reasoning);
        md.push_str("\n\n");
    }
    md.push_str(&format!(
        "Overall confidence: {:.2}\n\n",
        root.confidence
    ));

    md.push_str("## Findings\n\n");
    render_goal(&mut md, root, 0);

    md.push_str("## Evidence\n\n");
    if evidence.is_empty() {
        md.push_str("No evidence was collected.\n\n");
    } else {
        for e in evidence {
            let title = e.raw.title.as_deref().unwrap_or("(untitled)");
            let url = e
                .raw
                .url
                .as_deref()
                .map(|u| format!(" — {u}"))
                .unwrap_or_default();
            md.push_str(&format!(
                "- [E{}] {} ({}{})\n  {}\n",
                e.evidence_id, title, e.raw.source_id, url, e.llm_summary
            ));
        }
        md.push('\n');
    }

    md.push_str("## Research Limitations\n\n");
    if metadata.limitations.is_empty() {
        md.push_str("No limitations were recorded; all consulted sources responded.\n");
    } else {
        let mut by_kind: Vec<(&str, Vec<&Limitation>)> = Vec::new();
        for limitation in &metadata.limitations {
            match by_kind.iter_mut().find(|(k, _)| *k == limitation.kind) {
                Some((_, items)) => items.push(limitation),
                None => by_kind.push((&limitation.kind, vec![limitation])),
            }
        }
        for (kind, items) in by_kind {
            md.push_str(&format!("### {kind}\n\n"));
            for item in items {
                md.push_str(&format!("- {}\n", item.detail));
            }
            md.push('\n');
        }
        if metadata.status != "completed" {
            md.push_str("Results are partial.\n");
        }
    }

    md
}

fn render_goal(md: &mut String, result: &GoalResult, depth: usize) {
    let marker = match result.status {
        GoalStatus::Completed => "",
        GoalStatus::Failed => " [failed]",
        GoalStatus::Skipped => " [skipped]",
        GoalStatus::Cancelled => " [cancelled]",
    };
    let heading = "#".repeat((depth + 3).min(6));
    md.push_str(&format!(
        "{heading} [{}] {}{marker}\n\n",
        result.goal.id, result.goal.description
    ));
    if depth > 0 && !result.reasoning.is_empty() {
        md.push_str(&result.reasoning);
        md.push_str("\n\n");
    }
    if !result.evidence_ids.is_empty() {
        let cites = result
            .evidence_ids
            .iter()
            .map(|id| format!("[E{id}]"))
            .collect::<Vec<_>>()
            .join(", ");
        md.push_str(&format!(
            "Evidence: {cites} (confidence {:.2})\n\n",
            result.confidence
        ));
    }
    for sub in &result.sub_results {
        render_goal(md, sub, depth + 1);
    }
}
