//! Run-wide shared context.
//!
//! A single [`RunContext`] is shared by reference across every recursive
//! invocation. All mutable run state lives behind one lock, held only for
//! the duration of each update; reads that need consistency take a snapshot
//! under the same lock. Cross-references between goals and evidence are by
//! id, never by pointer.

use crate::budget::BudgetController;
use crate::config::Constraints;
use crate::error::Result;
use crate::evidence::url::{normalize_url, url_hash};
use crate::evidence::{EvidenceId, IndexEntry, ProcessedEvidence, RunIndex};
use crate::goal::ResearchGoal;
use crate::journal::{EventType, ExecutionLogger};
use crate::llm::gateway::LlmGateway;
use crate::llm::types::CostLedger;
use crate::source::classify::ErrorCategory;
use crate::source::registry::SourceRegistry;
use crate::source::RawResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-source performance counters surfaced to the source selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceStats {
    pub success: u32,
    pub zero_results: u32,
    pub low_quality: u32,
    /// Error counts keyed by classifier category (e.g. "rate_limit")
    pub errors: HashMap<String, u32>,
}

/// Outcome of one source attempt, for the performance counters.
#[derive(Debug, Clone, Copy)]
pub enum SourceOutcome {
    Success,
    ZeroResults,
    LowQuality,
    Error(ErrorCategory),
}

/// A user-visible limitation of the run (failed sources, rate limits,
/// budget truncation), surfaced in metadata.json and the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limitation {
    pub kind: String,
    pub detail: String,
}

/// What happened when evidence was offered to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New evidence stored under this id
    Fresh(EvidenceId),
    /// The normalized URL was already admitted; the existing id was
    /// cross-referenced instead
    Duplicate(EvidenceId),
}

impl Admission {
    pub fn evidence_id(&self) -> EvidenceId {
        match self {
            Self::Fresh(id) | Self::Duplicate(id) => *id,
        }
    }
}

/// Evidence fields produced by filtering and extraction, before an id is
/// assigned.
#[derive(Debug, Clone)]
pub struct EvidenceDraft {
    pub raw: RawResult,
    pub llm_summary: String,
    pub extracted_facts: Vec<String>,
    pub extracted_entities: Vec<crate::evidence::Entity>,
    pub extracted_dates: Vec<String>,
    pub relevance_score: u8,
    pub filter_rationale: String,
    pub truncated: bool,
}

struct SharedState {
    index: RunIndex,
    evidence: Vec<ProcessedEvidence>,
    by_goal: BTreeMap<String, Vec<EvidenceId>>,
    /// normalized URL -> admitting evidence id
    seen_urls: HashMap<String, EvidenceId>,
    source_stats: HashMap<String, SourceStats>,
    /// source id -> cool-down expiry
    rate_limited: HashMap<String, Instant>,
    limitations: Vec<Limitation>,
    /// (goal_id, source_id) pairs where a primary source failed
    critical_failures: Vec<(String, String)>,
    /// every goal created in the run, for follow-up dedup
    goal_catalog: Vec<(String, String)>,
}

/// Session-wide shared state for one research run.
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub constraints: Constraints,
    pub budget: Arc<BudgetController>,
    pub logger: Arc<ExecutionLogger>,
    pub llm: Arc<LlmGateway>,
    pub registry: Arc<SourceRegistry>,
    pub ledger: Arc<Mutex<CostLedger>>,
    pub run_dir: PathBuf,
    next_evidence_id: AtomicU64,
    state: Mutex<SharedState>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: impl Into<String>,
        run_dir: PathBuf,
        constraints: Constraints,
        budget: Arc<BudgetController>,
        logger: Arc<ExecutionLogger>,
        llm: Arc<LlmGateway>,
        registry: Arc<SourceRegistry>,
        ledger: Arc<Mutex<CostLedger>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            constraints,
            budget,
            logger,
            llm,
            registry,
            ledger,
            run_dir,
            next_evidence_id: AtomicU64::new(1),
            state: Mutex::new(SharedState {
                index: RunIndex::new(),
                evidence: Vec::new(),
                by_goal: BTreeMap::new(),
                seen_urls: HashMap::new(),
                source_stats: HashMap::new(),
                rate_limited: HashMap::new(),
                limitations: Vec::new(),
                critical_failures: Vec::new(),
                goal_catalog: Vec::new(),
            }),
        }
    }

    /// Log an event, downgrading logger failures to a warning. Critical
    /// events (`goal_completed`, `run_completed`) go through
    /// [`ExecutionLogger::emit`] directly so errors propagate.
    pub fn log(&self, event_type: EventType, goal_id: Option<&str>, data: Value) {
        if let Err(err) = self.logger.emit(event_type, goal_id, data) {
            tracing::warn!(error = %err, "failed to write execution log event");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedState> {
        self.state.lock().expect("run context lock poisoned")
    }

    // ---- evidence -------------------------------------------------------

    /// Look up an already-admitted evidence id by raw URL.
    pub fn lookup_url(&self, raw_url: &str) -> Option<EvidenceId> {
        let normalized = normalize_url(raw_url)?;
        self.lock().seen_urls.get(&normalized).copied()
    }

    /// Admit filtered-and-extracted evidence for a goal.
    ///
    /// If the normalized URL was already admitted (possibly by a concurrent
    /// sibling), the existing id is attached to this goal instead and no
    /// duplicate record is stored.
    pub fn admit_evidence(&self, goal_id: &str, draft: EvidenceDraft) -> Result<Admission> {
        let normalized = draft.raw.url.as_deref().and_then(normalize_url);

        {
            let mut state = self.lock();
            if let Some(normalized) = &normalized {
                if let Some(&existing) = state.seen_urls.get(normalized) {
                    attach(&mut state, goal_id, existing);
                    return Ok(Admission::Duplicate(existing));
                }
            }

            let evidence_id = self.next_evidence_id.fetch_add(1, Ordering::SeqCst);
            let evidence = ProcessedEvidence {
                evidence_id,
                goal_id: goal_id.to_string(),
                raw: draft.raw,
                llm_summary: draft.llm_summary,
                extracted_facts: draft.extracted_facts,
                extracted_entities: draft.extracted_entities,
                extracted_dates: draft.extracted_dates,
                relevance_score: draft.relevance_score,
                filter_rationale: draft.filter_rationale,
                truncated: draft.truncated,
            };

            let hash = normalized.as_deref().map(url_hash);
            state.index.push(IndexEntry::for_evidence(&evidence, hash));
            if let Some(normalized) = normalized {
                state.seen_urls.insert(normalized, evidence_id);
            }
            attach(&mut state, goal_id, evidence_id);
            state.evidence.push(evidence.clone());
            drop(state);

            self.write_raw_response(&evidence)?;
            Ok(Admission::Fresh(evidence_id))
        }
    }

    /// Attach an existing evidence id to a goal (cross-branch reuse).
    pub fn attach_evidence(&self, goal_id: &str, evidence_id: EvidenceId) {
        attach(&mut self.lock(), goal_id, evidence_id);
    }

    fn write_raw_response(&self, evidence: &ProcessedEvidence) -> Result<()> {
        let dir = self
            .run_dir
            .join("raw_responses")
            .join(&evidence.raw.source_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", evidence.evidence_id));
        let payload = serde_json::to_string_pretty(&evidence.raw)?;
        std::fs::write(path, payload)?;
        Ok(())
    }

    /// Index digest for a prompt, plus the total index size at selection
    /// time so callers can report truncation.
    pub fn index_digest(&self, text: &str, cap: usize) -> (Vec<IndexEntry>, usize) {
        self.lock().index.select_digest(text, cap)
    }

    pub fn index_len(&self) -> usize {
        self.lock().index.len()
    }

    /// Fetch evidence records by id, in the order given.
    pub fn get_evidence(&self, ids: &[EvidenceId]) -> Vec<ProcessedEvidence> {
        let state = self.lock();
        ids.iter()
            .filter_map(|id| state.evidence.iter().find(|e| e.evidence_id == *id))
            .cloned()
            .collect()
    }

    pub fn evidence_snapshot(&self) -> Vec<ProcessedEvidence> {
        self.lock().evidence.clone()
    }

    pub fn by_goal_snapshot(&self) -> BTreeMap<String, Vec<EvidenceId>> {
        self.lock().by_goal.clone()
    }

    pub fn evidence_count(&self) -> usize {
        self.lock().evidence.len()
    }

    // ---- source performance --------------------------------------------

    pub fn record_source_outcome(&self, source_id: &str, outcome: SourceOutcome) {
        let mut state = self.lock();
        let stats = state.source_stats.entry(source_id.to_string()).or_default();
        match outcome {
            SourceOutcome::Success => stats.success += 1,
            SourceOutcome::ZeroResults => stats.zero_results += 1,
            SourceOutcome::LowQuality => stats.low_quality += 1,
            SourceOutcome::Error(category) => {
                *stats.errors.entry(category.to_string()).or_default() += 1;
            }
        }
    }

    pub fn source_stats_snapshot(&self) -> HashMap<String, SourceStats> {
        self.lock().source_stats.clone()
    }

    // ---- rate limiting --------------------------------------------------

    /// Place a source in the rate-limited set until the cool-down expires.
    pub fn rate_limit_source(&self, source_id: &str, cooldown: Duration) {
        self.lock()
            .rate_limited
            .insert(source_id.to_string(), Instant::now() + cooldown);
    }

    /// Remaining cool-down for a source, if it is currently rate limited.
    pub fn rate_limited_remaining(&self, source_id: &str) -> Option<Duration> {
        let state = self.lock();
        let expiry = state.rate_limited.get(source_id)?;
        let now = Instant::now();
        if *expiry > now {
            Some(*expiry - now)
        } else {
            None
        }
    }

    /// Sources that were rate limited at any point in the run.
    pub fn rate_limited_sources(&self) -> Vec<String> {
        let mut sources: Vec<_> = self.lock().rate_limited.keys().cloned().collect();
        sources.sort();
        sources
    }

    // ---- limitations and failures --------------------------------------

    pub fn add_limitation(&self, kind: &str, detail: impl Into<String>) {
        let limitation = Limitation {
            kind: kind.to_string(),
            detail: detail.into(),
        };
        let mut state = self.lock();
        if !state.limitations.contains(&limitation) {
            state.limitations.push(limitation);
        }
    }

    pub fn limitations(&self) -> Vec<Limitation> {
        self.lock().limitations.clone()
    }

    /// Record that a selector-designated primary source failed for a goal.
    pub fn record_critical_failure(&self, goal_id: &str, source_id: &str) {
        self.lock()
            .critical_failures
            .push((goal_id.to_string(), source_id.to_string()));
    }

    /// Whether any critical source failure was recorded in the subtree
    /// rooted at `goal_id`.
    pub fn critical_failure_in_subtree(&self, goal_id: &str) -> bool {
        let prefix = format!("{goal_id}.");
        self.lock()
            .critical_failures
            .iter()
            .any(|(g, _)| g == goal_id || g.starts_with(&prefix))
    }

    // ---- goal catalog ---------------------------------------------------

    /// Record a created goal so follow-up generation can avoid duplicates.
    pub fn register_goal(&self, goal: &ResearchGoal) {
        self.lock()
            .goal_catalog
            .push((goal.id.clone(), goal.description.clone()));
    }

    pub fn goal_catalog(&self) -> Vec<(String, String)> {
        self.lock().goal_catalog.clone()
    }
}

fn attach(state: &mut SharedState, goal_id: &str, evidence_id: EvidenceId) {
    let ids = state.by_goal.entry(goal_id.to_string()).or_default();
    if !ids.contains(&evidence_id) {
        ids.push(evidence_id);
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("run_dir", &self.run_dir)
            .finish()
    }
}
