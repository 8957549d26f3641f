//! Budget enforcement: cost, wall-clock, goal-count, and concurrency caps.
//!
//! A single [`BudgetController`] is shared by every recursive invocation in a
//! run. Concurrency is bounded by a semaphore whose permits are RAII guards,
//! so release happens on every exit path including cancellation and panics.
//!
//! Cost enforcement is ε-tolerant: the first call that pushes spend past the
//! cap is still admitted (so its cost can be observed), after which no new
//! paid work starts.

use crate::config::Constraints;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Why the controller wants work to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Time,
    Cost,
    Goals,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Cost => "cost",
            Self::Goals => "goals",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RAII concurrency permit. Dropping it releases the slot.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

/// Remaining headroom, rendered into assessor prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub spent_cost_usd: f64,
    pub remaining_cost_usd: f64,
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    pub started_goals: usize,
    pub remaining_goals: usize,
}

struct CostState {
    spent_usd: f64,
    breached: bool,
}

/// Tracks spend against the run [`Constraints`] and owns the concurrency
/// semaphore and the cancellation flag.
pub struct BudgetController {
    max_time: Duration,
    max_cost_usd: f64,
    max_goals: usize,
    started: Instant,
    semaphore: Arc<Semaphore>,
    cost: Mutex<CostState>,
    started_goals: AtomicUsize,
    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<StopReason>>,
}

impl BudgetController {
    pub fn new(constraints: &Constraints) -> Self {
        Self {
            max_time: constraints.max_time,
            max_cost_usd: constraints.max_cost_usd,
            max_goals: constraints.max_goals,
            started: Instant::now(),
            semaphore: Arc::new(Semaphore::new(constraints.max_concurrent.max(1))),
            cost: Mutex::new(CostState {
                spent_usd: 0.0,
                breached: false,
            }),
            started_goals: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
        }
    }

    /// Acquire a concurrency permit, waiting if the run is saturated.
    pub async fn acquire(&self) -> Result<Permit> {
        if let Some(reason) = self.cancel_state() {
            return Err(Error::cancelled(reason.as_str()));
        }
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("concurrency semaphore closed".to_string()))?;
        Ok(Permit { _permit: permit })
    }

    /// Check whether new work may start.
    ///
    /// Checked before every new LLM call, every new source call, and before
    /// admitting a new sub-goal.
    pub fn should_stop(&self) -> Option<StopReason> {
        if let Some(reason) = self.cancel_state() {
            return Some(reason);
        }
        if self.started.elapsed() >= self.max_time {
            return Some(StopReason::Time);
        }
        if self.cost.lock().expect("cost lock poisoned").breached {
            return Some(StopReason::Cost);
        }
        if self.started_goals.load(Ordering::SeqCst) >= self.max_goals {
            return Some(StopReason::Goals);
        }
        None
    }

    /// Count a goal against `max_goals`. Returns the stop reason if the goal
    /// may not start.
    pub fn admit_goal(&self) -> std::result::Result<(), StopReason> {
        if let Some(reason) = self.should_stop() {
            return Err(reason);
        }
        self.started_goals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Record observed cost. Returns true exactly once, on the call that
    /// breaches `max_cost_usd`.
    pub fn record_cost(&self, cost_usd: f64) -> bool {
        let mut state = self.cost.lock().expect("cost lock poisoned");
        state.spent_usd += cost_usd;
        if !state.breached && state.spent_usd > self.max_cost_usd {
            state.breached = true;
            return true;
        }
        false
    }

    /// Trip the run-wide cancellation flag. The first reason wins.
    pub fn cancel(&self, reason: StopReason) {
        let mut slot = self.cancel_reason.lock().expect("cancel lock poisoned");
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// The cancellation reason, if the flag is set.
    pub fn cancel_state(&self) -> Option<StopReason> {
        if !self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        Some(
            self.cancel_reason
                .lock()
                .expect("cancel lock poisoned")
                .unwrap_or(StopReason::Cancelled),
        )
    }

    pub fn spent_cost_usd(&self) -> f64 {
        self.cost.lock().expect("cost lock poisoned").spent_usd
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn started_goals(&self) -> usize {
        self.started_goals.load(Ordering::SeqCst)
    }

    /// Remaining headroom for prompt context.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let spent = self.spent_cost_usd();
        let elapsed = self.started.elapsed();
        let started_goals = self.started_goals();
        BudgetSnapshot {
            spent_cost_usd: spent,
            remaining_cost_usd: (self.max_cost_usd - spent).max(0.0),
            elapsed_secs: elapsed.as_secs(),
            remaining_secs: self.max_time.saturating_sub(elapsed).as_secs(),
            started_goals,
            remaining_goals: self.max_goals.saturating_sub(started_goals),
        }
    }
}

impl std::fmt::Debug for BudgetController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetController")
            .field("spent_cost_usd", &self.spent_cost_usd())
            .field("started_goals", &self.started_goals())
            .field("cancelled", &self.cancel_state())
            .finish()
    }
}
