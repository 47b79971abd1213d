// ── Observability Events ─────────────────────────────────────────────────────
// Bounded in-memory event feed for the embedder's audit and UI collaborators.
// Not a logger replacement: log lines narrate, events are structured data the
// embedder can drain and persist. Oldest events fall off at the cap.
//
// Also owns the per-belief failure-streak bookkeeping: repeated update
// rejections against one belief surface as a BeliefNeedsAttention event
// instead of an unbounded stream of identical errors.

use crate::atoms::error::CoreError;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ── Constants ────────────────────────────────────────────────────────────────

/// Events retained before FIFO eviction.
pub const MAX_EVENTS: usize = 500;

/// Consecutive rejected updates on one belief before it is flagged.
pub const ATTENTION_STREAK: u32 = 3;

// ── Event types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A belief keeps rejecting updates; someone should look at it or at the
    /// feed that keeps targeting it.
    BeliefNeedsAttention {
        belief: Uuid,
        consecutive_failures: u32,
        last_error: String,
    },
    UpdateRejected {
        belief: Uuid,
        error: String,
    },
    Escalated {
        key: String,
        reason: String,
    },
    SleepModeChanged {
        active: bool,
    },
    LearningBudgetMissed {
        date: String,
        consumed_secs: f64,
        required_secs: f64,
    },
    BeliefReset {
        belief: Uuid,
    },
    BeliefRemoved {
        belief: Uuid,
    },
    TuningProposed {
        domain: String,
        field: String,
        proposed: f64,
    },
}

impl CoreEvent {
    /// Stable label for log lines and metric counters.
    pub fn label(&self) -> &'static str {
        match self {
            CoreEvent::BeliefNeedsAttention { .. } => "belief_needs_attention",
            CoreEvent::UpdateRejected { .. } => "update_rejected",
            CoreEvent::Escalated { .. } => "escalated",
            CoreEvent::SleepModeChanged { .. } => "sleep_mode_changed",
            CoreEvent::LearningBudgetMissed { .. } => "learning_budget_missed",
            CoreEvent::BeliefReset { .. } => "belief_reset",
            CoreEvent::BeliefRemoved { .. } => "belief_removed",
            CoreEvent::TuningProposed { .. } => "tuning_proposed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub event: CoreEvent,
}

// ── Event log ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<EventRecord>>,
    streaks: Mutex<HashMap<Uuid, u32>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: CoreEvent) {
        debug!("[belief:events] {}", event.label());
        let mut events = self.events.lock();
        events.push(EventRecord {
            at: Utc::now(),
            event,
        });
        if events.len() > MAX_EVENTS {
            let overflow = events.len() - MAX_EVENTS;
            events.drain(0..overflow);
        }
    }

    /// Most recent events, newest last.
    pub fn recent(&self, n: usize) -> Vec<EventRecord> {
        let events = self.events.lock();
        let start = events.len().saturating_sub(n);
        events[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    // ── Failure streaks ──────────────────────────────────────────────────────

    /// Count one rejected update against a belief. Every ATTENTION_STREAK
    /// consecutive rejections emit a BeliefNeedsAttention event.
    pub fn record_update_failure(&self, belief: Uuid, error: &CoreError) -> u32 {
        let streak = {
            let mut streaks = self.streaks.lock();
            let entry = streaks.entry(belief).or_insert(0);
            *entry += 1;
            *entry
        };
        self.record(CoreEvent::UpdateRejected {
            belief,
            error: error.to_string(),
        });
        if streak % ATTENTION_STREAK == 0 {
            warn!(
                "[belief:events] belief {} has rejected {} consecutive updates ({})",
                belief,
                streak,
                error.kind_label()
            );
            self.record(CoreEvent::BeliefNeedsAttention {
                belief,
                consecutive_failures: streak,
                last_error: error.to_string(),
            });
        }
        streak
    }

    /// A successful update ends the streak.
    pub fn clear_failure_streak(&self, belief: Uuid) {
        self.streaks.lock().remove(&belief);
    }

    pub fn failure_streak(&self, belief: Uuid) -> u32 {
        self.streaks.lock().get(&belief).copied().unwrap_or(0)
    }
}
