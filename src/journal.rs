//! Append-only JSONL execution log.
//!
//! Every observable step of a run is appended to `execution_log.jsonl` as one
//! JSON object per line, headed by a schema-version event. Writes are
//! serialized and flushed at event boundaries; `goal_completed` and
//! `run_completed` additionally fsync, since the log is the system of record
//! for those transitions.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Version of the event schema written to the log header.
pub const LOG_SCHEMA_VERSION: u32 = 1;

/// The documented set of event types. Any event observed in a run log must
/// come from this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SchemaVersion,
    RunStarted,
    RunCompleted,
    GoalStarted,
    GoalCompleted,
    GoalFailed,
    GoalCancelled,
    ActionSelected,
    SourceSelection,
    SourceRegistrationFailed,
    SourceSkipped,
    QueryGenerated,
    SourceQuery,
    SourceResponse,
    RelevanceFiltering,
    EvidenceAccepted,
    EvidenceRejected,
    EvidenceTruncated,
    UrlDuplicate,
    GlobalEvidenceSelection,
    Decomposition,
    DecompositionInvalid,
    DependencyGroup,
    Reformulation,
    ErrorClassified,
    BudgetBreach,
    RateLimitHit,
    CostTick,
    ReportWritten,
}

impl EventType {
    /// All documented event types.
    pub fn all() -> &'static [EventType] {
        use EventType::*;
        &[
            SchemaVersion,
            RunStarted,
            RunCompleted,
            GoalStarted,
            GoalCompleted,
            GoalFailed,
            GoalCancelled,
            ActionSelected,
            SourceSelection,
            SourceRegistrationFailed,
            SourceSkipped,
            QueryGenerated,
            SourceQuery,
            SourceResponse,
            RelevanceFiltering,
            EvidenceAccepted,
            EvidenceRejected,
            EvidenceTruncated,
            UrlDuplicate,
            GlobalEvidenceSelection,
            Decomposition,
            DecompositionInvalid,
            DependencyGroup,
            Reformulation,
            ErrorClassified,
            BudgetBreach,
            RateLimitHit,
            CostTick,
            ReportWritten,
        ]
    }

    /// Events whose loss tolerance is zero.
    fn requires_fsync(&self) -> bool {
        matches!(self, Self::GoalCompleted | Self::RunCompleted)
    }
}

/// One logged event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    pub event_type: EventType,
    pub data: Value,
}

struct Inner {
    writer: BufWriter<File>,
    last_ts: DateTime<Utc>,
}

/// Synchronous, append-only JSONL logger for one run.
pub struct ExecutionLogger {
    run_id: String,
    inner: Mutex<Inner>,
}

impl ExecutionLogger {
    /// Open (create) the log file and write the schema-version header event.
    pub fn open(path: &Path, run_id: impl Into<String>) -> Result<Self> {
        let run_id = run_id.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let logger = Self {
            run_id,
            inner: Mutex::new(Inner {
                writer: BufWriter::new(file),
                last_ts: Utc::now(),
            }),
        };
        logger.emit(
            EventType::SchemaVersion,
            None,
            serde_json::json!({ "schema_version": LOG_SCHEMA_VERSION }),
        )?;
        Ok(logger)
    }

    /// Append one event. Timestamps are clamped monotonic under the writer
    /// lock, and the line is flushed before returning.
    pub fn emit(&self, event_type: EventType, goal_id: Option<&str>, data: Value) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");

        let mut ts = Utc::now();
        if ts < inner.last_ts {
            ts = inner.last_ts;
        }
        inner.last_ts = ts;

        let event = Event {
            ts,
            run_id: self.run_id.clone(),
            goal_id: goal_id.map(str::to_string),
            event_type,
            data,
        };

        tracing::debug!(target: "dossier::journal", event = %serde_json::to_string(&event.event_type).unwrap_or_default(), goal = ?event.goal_id);

        let line = serde_json::to_string(&event)?;
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.write_all(b"\n")?;
        inner.writer.flush()?;
        if event_type.requires_fsync() {
            inner.writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl std::fmt::Debug for ExecutionLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLogger")
            .field("run_id", &self.run_id)
            .finish()
    }
}

/// Load a JSONL log back into memory, e.g. for inspection or tests.
pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_header_and_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("execution_log.jsonl");
        let logger = ExecutionLogger::open(&path, "run-1").unwrap();
        logger
            .emit(EventType::RunStarted, None, json!({"question": "q"}))
            .unwrap();
        logger
            .emit(
                EventType::GoalStarted,
                Some("0"),
                json!({"description": "q"}),
            )
            .unwrap();
        logger
            .emit(EventType::RunCompleted, None, json!({"status": "completed"}))
            .unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].event_type, EventType::SchemaVersion);
        assert_eq!(events[0].data["schema_version"], LOG_SCHEMA_VERSION);
        assert_eq!(events[2].goal_id.as_deref(), Some("0"));
    }

    #[test]
    fn test_timestamps_monotonic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let logger = ExecutionLogger::open(&path, "run-1").unwrap();
        for i in 0..50 {
            logger
                .emit(EventType::CostTick, Some("0"), json!({"i": i}))
                .unwrap();
        }
        let events = read_events(&path).unwrap();
        for pair in events.windows(2) {
            assert!(pair[0].ts <= pair[1].ts);
        }
    }

    #[test]
    fn test_event_type_wire_names_are_snake_case() {
        let s = serde_json::to_string(&EventType::GlobalEvidenceSelection).unwrap();
        assert_eq!(s, "\"global_evidence_selection\"");
        let s = serde_json::to_string(&EventType::RateLimitHit).unwrap();
        assert_eq!(s, "\"rate_limit_hit\"");
    }

    #[test]
    fn test_all_contains_every_emittable_type() {
        // Spot-check the catalog used by the subset property test.
        assert!(EventType::all().contains(&EventType::SchemaVersion));
        assert!(EventType::all().contains(&EventType::UrlDuplicate));
        assert!(EventType::all().contains(&EventType::ReportWritten));
        assert_eq!(EventType::all().len(), 29);
    }
}
