//! Evidence model and the per-run evidence index.
//!
//! A [`ProcessedEvidence`] is the goal-focused view of one raw source
//! result: filter-passing, extraction-enriched, identified by a monotonic
//! `evidence_id`, and immutable once appended. [`IndexEntry`] summaries go
//! into the shared [`RunIndex`] so sibling and cousin goals can reuse
//! evidence without re-querying. The index grows monotonically within a run
//! and is discarded at run end; growth is unbounded within a session.

pub mod url;

use crate::source::RawResult;
use serde::{Deserialize, Serialize};

/// Monotonic, run-unique evidence identifier.
pub type EvidenceId = u64;

/// A named entity extracted from evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

/// Filter-passing, extraction-enriched evidence derived from one raw result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvidence {
    pub evidence_id: EvidenceId,
    /// Goal that first admitted this evidence
    pub goal_id: String,
    /// The raw source result, preserved verbatim
    pub raw: RawResult,
    pub llm_summary: String,
    pub extracted_facts: Vec<String>,
    pub extracted_entities: Vec<Entity>,
    /// ISO-8601 dates mentioned in the evidence
    pub extracted_dates: Vec<String>,
    /// Relevance score from the filter (0-10)
    pub relevance_score: u8,
    pub filter_rationale: String,
    /// True when an extracted list was trimmed to its per-evidence bound;
    /// the trim is also recorded as an `evidence_truncated` event
    #[serde(default)]
    pub truncated: bool,
}

/// Cross-branch index entry for one piece of evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub evidence_id: EvidenceId,
    pub goal_id: String,
    /// Short summary shown to the global-evidence selector
    pub summary_for_selection: String,
    /// SHA-256 of the normalized URL, when the result had one
    pub url_hash: Option<String>,
    pub keywords: Vec<String>,
}

impl IndexEntry {
    /// Build the index entry for a freshly admitted piece of evidence.
    pub fn for_evidence(evidence: &ProcessedEvidence, url_hash: Option<String>) -> Self {
        let mut keywords = extract_keywords(&evidence.llm_summary);
        for entity in &evidence.extracted_entities {
            for kw in extract_keywords(&entity.name) {
                if !keywords.contains(&kw) {
                    keywords.push(kw);
                }
            }
        }
        keywords.truncate(16);
        Self {
            evidence_id: evidence.evidence_id,
            goal_id: evidence.goal_id.clone(),
            summary_for_selection: evidence.llm_summary.clone(),
            url_hash,
            keywords,
        }
    }
}

/// The per-run pool of evidence summaries available to any goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunIndex {
    entries: Vec<IndexEntry>,
}

impl RunIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Select up to `cap` entries for a prompt digest, ranked by keyword
    /// overlap with `text`. Falls back to the most recent entries when
    /// nothing overlaps. Returns the selected entries and the total index
    /// size at selection time, so callers can report truncation.
    pub fn select_digest(&self, text: &str, cap: usize) -> (Vec<IndexEntry>, usize) {
        let total = self.entries.len();
        if total <= cap {
            return (self.entries.clone(), total);
        }

        let wanted = extract_keywords(text);
        let mut scored: Vec<(usize, &IndexEntry)> = self
            .entries
            .iter()
            .map(|entry| {
                let score = entry
                    .keywords
                    .iter()
                    .filter(|kw| wanted.contains(kw))
                    .count();
                (score, entry)
            })
            .collect();

        if scored.iter().all(|(score, _)| *score == 0) {
            let selected = self.entries[total - cap..].to_vec();
            return (selected, total);
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.evidence_id.cmp(&a.1.evidence_id)));
        let selected = scored.into_iter().take(cap).map(|(_, e)| e.clone()).collect();
        (selected, total)
    }
}

const STOPWORDS: &[&str] = &[
    "about", "after", "against", "among", "before", "being", "between", "circa", "could",
    "during", "every", "from", "have", "into", "their", "there", "these", "they", "this",
    "those", "under", "until", "what", "when", "where", "which", "while", "with", "would",
];

/// Lowercased keywords of length >= 4, stopwords removed, order-preserving
/// dedup, capped at 16.
pub fn extract_keywords(text: &str) -> Vec<String> {
    let mut keywords = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric()) {
        if word.len() < 4 {
            continue;
        }
        let lower = word.to_lowercase();
        if STOPWORDS.contains(&lower.as_str()) {
            continue;
        }
        if !keywords.contains(&lower) {
            keywords.push(lower);
        }
        if keywords.len() >= 16 {
            break;
        }
    }
    keywords
}
