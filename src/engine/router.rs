// ── Escalation Router ────────────────────────────────────────────────────────
// Fast path vs. deliberation. The fast path answers from stored beliefs on
// the caller's thread; escalation hands the situation to a slower reasoning
// layer outside this crate. Routing never fails: when in doubt, escalate.
//
// Checks run in a fixed order and the first hit wins:
//   high stakes -> unseen situation -> heuristic conflict -> low confidence.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::profile::LearningProfile;
use crate::atoms::types::ContextTag;
use crate::engine::observability::{CoreEvent, EventLog};
use crate::engine::repository::BeliefRepository;
use crate::engine::scheduler::BudgetState;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ── Inputs ───────────────────────────────────────────────────────────────────

/// Stakes classification supplied by the embedder. Anything touching security
/// or safety bypasses the fast path outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StakesClass {
    Routine,
    Security,
    Safety,
}

impl StakesClass {
    pub fn is_high_stakes(&self) -> bool {
        matches!(self, StakesClass::Security | StakesClass::Safety)
    }
}

impl Default for StakesClass {
    fn default() -> Self {
        StakesClass::Routine
    }
}

impl fmt::Display for StakesClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StakesClass::Routine => "routine",
            StakesClass::Security => "security",
            StakesClass::Safety => "safety",
        };
        write!(f, "{}", s)
    }
}

/// One cheap heuristic's recommendation for the situation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeuristicVote {
    pub heuristic: String,
    pub action: String,
}

impl HeuristicVote {
    pub fn new(heuristic: impl Into<String>, action: impl Into<String>) -> Self {
        HeuristicVote {
            heuristic: heuristic.into(),
            action: action.into(),
        }
    }
}

/// Everything the router knows about the situation being decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SituationFingerprint {
    /// Belief key the situation maps onto.
    pub key: String,
    #[serde(default)]
    pub context: Vec<ContextTag>,
    #[serde(default)]
    pub stakes: StakesClass,
    /// Embedder-supplied dissimilarity to anything seen before, in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub novelty: Option<f64>,
    #[serde(default)]
    pub heuristics: Vec<HeuristicVote>,
}

impl SituationFingerprint {
    pub fn new(key: impl Into<String>) -> Self {
        SituationFingerprint {
            key: key.into(),
            context: Vec::new(),
            stakes: StakesClass::Routine,
            novelty: None,
            heuristics: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<ContextTag>) -> Self {
        self.context = context;
        self
    }

    pub fn with_stakes(mut self, stakes: StakesClass) -> Self {
        self.stakes = stakes;
        self
    }

    pub fn with_novelty(mut self, novelty: f64) -> Self {
        self.novelty = Some(novelty);
        self
    }

    pub fn with_vote(mut self, vote: HeuristicVote) -> Self {
        self.heuristics.push(vote);
        self
    }
}

// ── Outputs ──────────────────────────────────────────────────────────────────

/// A fast-path answer backed by a stored belief (or by its absence).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    /// The heuristics' agreed action, when they agree.
    pub action: Option<String>,
    pub belief: Option<Uuid>,
    pub confidence: f64,
    pub mean: Option<f64>,
    pub novelty: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    HighStakes { stakes: StakesClass },
    Unseen { novelty: f64, threshold: f64 },
    HeuristicConflict { actions: Vec<String> },
    LowConfidence { confidence: f64, threshold: f64 },
}

impl EscalationReason {
    pub fn label(&self) -> &'static str {
        match self {
            EscalationReason::HighStakes { .. } => "high_stakes",
            EscalationReason::Unseen { .. } => "unseen",
            EscalationReason::HeuristicConflict { .. } => "heuristic_conflict",
            EscalationReason::LowConfidence { .. } => "low_confidence",
        }
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::HighStakes { stakes } => write!(f, "high stakes ({})", stakes),
            EscalationReason::Unseen { novelty, threshold } => {
                write!(f, "unseen situation (novelty {:.2} >= {:.2})", novelty, threshold)
            }
            EscalationReason::HeuristicConflict { actions } => {
                write!(f, "heuristic conflict ({})", actions.join(" vs "))
            }
            EscalationReason::LowConfidence { confidence, threshold } => {
                write!(f, "low confidence ({:.2} < {:.2})", confidence, threshold)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum RouteDecision {
    FastPath(Decision),
    Escalate(EscalationReason),
}

impl RouteDecision {
    pub fn is_escalation(&self) -> bool {
        matches!(self, RouteDecision::Escalate(_))
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Novelty at or above this escalates as unseen.
    #[serde(default = "default_novelty_threshold")]
    pub novelty_threshold: f64,
}

fn default_novelty_threshold() -> f64 {
    0.35
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            novelty_threshold: default_novelty_threshold(),
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.novelty_threshold.is_finite() && (0.0..=1.0).contains(&self.novelty_threshold)) {
            return Err(CoreError::config(format!(
                "novelty_threshold must be in [0, 1], got {}",
                self.novelty_threshold
            )));
        }
        Ok(())
    }
}

// ── Router ───────────────────────────────────────────────────────────────────

pub struct EscalationRouter {
    repo: Arc<BeliefRepository>,
    budget: Arc<BudgetState>,
    events: Arc<EventLog>,
    cfg: RouterConfig,
}

impl EscalationRouter {
    pub fn new(
        repo: Arc<BeliefRepository>,
        budget: Arc<BudgetState>,
        events: Arc<EventLog>,
        cfg: RouterConfig,
    ) -> Self {
        EscalationRouter {
            repo,
            budget,
            events,
            cfg,
        }
    }

    /// Decide whether the fast path may answer. Infallible: a situation the
    /// checks cannot clear escalates instead of erroring.
    pub fn route(&self, fp: &SituationFingerprint, profile: &LearningProfile) -> RouteDecision {
        if fp.stakes.is_high_stakes() {
            return self.escalate(fp, EscalationReason::HighStakes { stakes: fp.stakes });
        }

        if let Some(novelty) = fp.novelty {
            if novelty >= self.cfg.novelty_threshold {
                return self.escalate(
                    fp,
                    EscalationReason::Unseen {
                        novelty,
                        threshold: self.cfg.novelty_threshold,
                    },
                );
            }
        }

        let mut actions: Vec<String> = fp.heuristics.iter().map(|v| v.action.clone()).collect();
        actions.sort();
        actions.dedup();
        if actions.len() >= 2 {
            return self.escalate(fp, EscalationReason::HeuristicConflict { actions });
        }

        // Belief lookup: closest variant of the key by shared context tags.
        let snapshot = self
            .repo
            .find_by_key(&fp.key)
            .into_iter()
            .filter_map(|id| self.repo.snapshot(id).ok())
            .max_by_key(|s| (shared_tags(&fp.context, &s.context_tags), s.observation_count));
        let confidence = snapshot.as_ref().map(|s| s.confidence).unwrap_or(0.0);

        if confidence < profile.action_threshold {
            return self.escalate(
                fp,
                EscalationReason::LowConfidence {
                    confidence,
                    threshold: profile.action_threshold,
                },
            );
        }

        let decision = Decision {
            action: actions.into_iter().next(),
            belief: snapshot.as_ref().map(|s| s.id),
            confidence,
            mean: snapshot.as_ref().map(|s| s.mean),
            novelty: fp.novelty,
        };
        debug!(
            "[belief:router] fast path for '{}' (confidence {:.2}, sleep_active {})",
            fp.key,
            confidence,
            self.budget.snapshot().sleep_active
        );
        RouteDecision::FastPath(decision)
    }

    fn escalate(&self, fp: &SituationFingerprint, reason: EscalationReason) -> RouteDecision {
        info!("[belief:router] escalating '{}': {}", fp.key, reason);
        self.events.record(CoreEvent::Escalated {
            key: fp.key.clone(),
            reason: reason.label().to_string(),
        });
        RouteDecision::Escalate(reason)
    }
}

/// Count of (key, value) pairs present on both sides.
fn shared_tags(a: &[ContextTag], b: &[ContextTag]) -> usize {
    a.iter()
        .filter(|tag| b.iter().any(|other| other.key == tag.key && other.value == tag.value))
        .count()
}
