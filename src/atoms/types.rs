// ── Credence Atoms: Belief Data Model ───────────────────────────────────────
//
// Type definitions for the belief core: statistically-modeled patterns, the
// evidence that updates them, and the snapshots exported to observers.
// These are pure data types (no store access, no I/O). The update math lives
// in engine::models; commit semantics live in engine::repository.

use crate::atoms::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Model kinds and parameters
// ═══════════════════════════════════════════════════════════════════════════

/// The conjugate model family backing a belief.
///
/// Chosen exactly once at creation (from the evidence shape, unless pinned by
/// an explicit override) and never reselected afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    /// Repeated success/failure outcomes; Beta prior on the success rate.
    BetaBinomial,
    /// Continuous values with unknown mean and precision.
    NormalGamma,
    /// Event counts per observation interval; Gamma prior on the rate.
    GammaPoisson,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelKind::BetaBinomial => "beta-binomial",
            ModelKind::NormalGamma => "normal-gamma",
            ModelKind::GammaPoisson => "gamma-poisson",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beta-binomial" => Ok(ModelKind::BetaBinomial),
            "normal-gamma" => Ok(ModelKind::NormalGamma),
            "gamma-poisson" => Ok(ModelKind::GammaPoisson),
            other => Err(format!("unknown model kind: {}", other)),
        }
    }
}

/// Kind-specific posterior parameters. The variant IS the model kind; a
/// belief never changes variant after creation.
///
/// Positivity contract: α and β (and κ for normal-gamma) must stay strictly
/// positive. μ is an unconstrained real. `positivity_violation` is the single
/// check every commit path runs before accepting new values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "kebab-case")]
pub enum ModelParams {
    BetaBinomial { alpha: f64, beta: f64 },
    NormalGamma { mu: f64, kappa: f64, alpha: f64, beta: f64 },
    GammaPoisson { alpha: f64, beta: f64 },
}

impl ModelParams {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelParams::BetaBinomial { .. } => ModelKind::BetaBinomial,
            ModelParams::NormalGamma { .. } => ModelKind::NormalGamma,
            ModelParams::GammaPoisson { .. } => ModelKind::GammaPoisson,
        }
    }

    /// All parameters as (name, value) pairs, in declaration order.
    /// Delta math in engine::models relies on this ordering being stable.
    pub fn components(&self) -> Vec<(&'static str, f64)> {
        match *self {
            ModelParams::BetaBinomial { alpha, beta } => {
                vec![("alpha", alpha), ("beta", beta)]
            }
            ModelParams::NormalGamma {
                mu,
                kappa,
                alpha,
                beta,
            } => vec![
                ("mu", mu),
                ("kappa", kappa),
                ("alpha", alpha),
                ("beta", beta),
            ],
            ModelParams::GammaPoisson { alpha, beta } => {
                vec![("alpha", alpha), ("beta", beta)]
            }
        }
    }

    /// First parameter that breaks the positivity contract, if any.
    /// Non-finite values always count; μ is exempt from the sign check.
    pub fn positivity_violation(&self) -> Option<(&'static str, f64)> {
        let mu_exempt = matches!(self, ModelParams::NormalGamma { .. });
        for (name, value) in self.components() {
            if !value.is_finite() {
                return Some((name, value));
            }
            if value <= 0.0 && !(mu_exempt && name == "mu") {
                return Some((name, value));
            }
        }
        None
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Evidence and observations
// ═══════════════════════════════════════════════════════════════════════════

/// Evidence payload attached to one observation. The shape determines which
/// model family can absorb it; the mapping is one-to-one and fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Evidence {
    /// Bernoulli trial outcomes, possibly batched.
    Binary { successes: u64, failures: u64 },
    /// Continuous-valued samples.
    Continuous { values: Vec<f64> },
    /// Event counts, one entry per observed interval.
    Counts { counts: Vec<u64> },
}

impl Evidence {
    /// Single successful trial.
    pub fn success() -> Self {
        Evidence::Binary {
            successes: 1,
            failures: 0,
        }
    }

    /// Single failed trial.
    pub fn failure() -> Self {
        Evidence::Binary {
            successes: 0,
            failures: 1,
        }
    }

    /// Single continuous sample.
    pub fn value(v: f64) -> Self {
        Evidence::Continuous { values: vec![v] }
    }

    /// Single interval count.
    pub fn count(c: u64) -> Self {
        Evidence::Counts { counts: vec![c] }
    }

    /// Number of underlying trials / samples / intervals. Saturates instead
    /// of wrapping on adversarially large trial counts.
    pub fn sample_size(&self) -> u64 {
        match self {
            Evidence::Binary {
                successes,
                failures,
            } => successes.saturating_add(*failures),
            Evidence::Continuous { values } => values.len() as u64,
            Evidence::Counts { counts } => counts.len() as u64,
        }
    }

    /// The model family this shape maps to.
    pub fn implied_kind(&self) -> ModelKind {
        match self {
            Evidence::Binary { .. } => ModelKind::BetaBinomial,
            Evidence::Continuous { .. } => ModelKind::NormalGamma,
            Evidence::Counts { .. } => ModelKind::GammaPoisson,
        }
    }

    /// Usable evidence carries at least one sample and only finite values.
    pub fn validate(&self) -> CoreResult<()> {
        match self {
            Evidence::Binary {
                successes,
                failures,
            } => {
                if successes.saturating_add(*failures) == 0 {
                    return Err(CoreError::invalid_shape("binary evidence with zero trials"));
                }
            }
            Evidence::Continuous { values } => {
                if values.is_empty() {
                    return Err(CoreError::invalid_shape("continuous evidence with no samples"));
                }
                if let Some(v) = values.iter().find(|v| !v.is_finite()) {
                    return Err(CoreError::invalid_shape(format!(
                        "continuous evidence contains non-finite value {}",
                        v
                    )));
                }
            }
            Evidence::Counts { counts } => {
                if counts.is_empty() {
                    return Err(CoreError::invalid_shape("count evidence with no intervals"));
                }
            }
        }
        Ok(())
    }
}

/// One key/value discriminator in an observation's context descriptor.
///
/// `context_defining` marks keys whose divergence forks a belief into a
/// context variant instead of updating it in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTag {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub context_defining: bool,
}

impl ContextTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        ContextTag {
            key: key.into(),
            value: value.into(),
            context_defining: false,
        }
    }

    /// A tag whose divergence splits beliefs rather than blending them.
    pub fn defining(key: impl Into<String>, value: impl Into<String>) -> Self {
        ContextTag {
            key: key.into(),
            value: value.into(),
            context_defining: true,
        }
    }
}

/// Where an observation should land.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum BeliefTarget {
    /// Route directly to a known belief id.
    Existing { id: Uuid },
    /// Resolve by pattern key; the resolver decides update / fork / create.
    Key { key: String },
}

/// A timestamped piece of evidence addressed at a pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub target: BeliefTarget,
    pub evidence: Evidence,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<ContextTag>,
    /// Free-form provenance tag ("episodic", "mined", "causal", ...).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

impl Observation {
    /// Key-addressed observation stamped now.
    pub fn new(key: impl Into<String>, evidence: Evidence) -> Self {
        Observation {
            target: BeliefTarget::Key { key: key.into() },
            evidence,
            at: Utc::now(),
            context: Vec::new(),
            source: String::new(),
        }
    }

    /// Observation addressed at a known belief id.
    pub fn for_belief(id: Uuid, evidence: Evidence) -> Self {
        Observation {
            target: BeliefTarget::Existing { id },
            evidence,
            at: Utc::now(),
            context: Vec::new(),
            source: String::new(),
        }
    }

    pub fn with_context(mut self, context: Vec<ContextTag>) -> Self {
        self.context = context;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn observed_at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }

    /// The pattern key, when this observation is key-addressed.
    pub fn key(&self) -> Option<&str> {
        match &self.target {
            BeliefTarget::Key { key } => Some(key),
            BeliefTarget::Existing { .. } => None,
        }
    }
}

/// Declared observation cadence, consumed by the staleness engine.
/// Beliefs without one are never scored for staleness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedPeriod {
    pub period_secs: f64,
    pub std_dev_secs: f64,
}

impl ExpectedPeriod {
    pub fn new(period_secs: f64, std_dev_secs: f64) -> Self {
        ExpectedPeriod {
            period_secs,
            std_dev_secs,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Beliefs
// ═══════════════════════════════════════════════════════════════════════════

/// Typed link between beliefs. Recorded additively for future propagation
/// work; nothing in the core traverses these yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Supports,
    Contradicts,
    Relates,
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EdgeKind::Supports => "supports",
            EdgeKind::Contradicts => "contradicts",
            EdgeKind::Relates => "relates",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for EdgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "supports" => Ok(EdgeKind::Supports),
            "contradicts" => Ok(EdgeKind::Contradicts),
            "relates" => Ok(EdgeKind::Relates),
            other => Err(format!("unknown edge kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeliefEdge {
    pub target: Uuid,
    pub kind: EdgeKind,
}

/// A statistically-modeled pattern with Bayesian-updatable parameters.
///
/// Confidence is never stored. It is derived from the parameters and the
/// current staleness on every read, so the two can never drift apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    pub id: Uuid,
    /// Logical pattern key shared by every context variant of the pattern.
    pub key: String,
    pub params: ModelParams,
    /// Total evidence samples absorbed. Monotonically non-decreasing.
    pub observation_count: u64,
    /// Bumped on every committed parameter change (update, revise, reset).
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub last_observed: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_tags: Vec<ContextTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_period: Option<ExpectedPeriod>,
    /// True when the model kind was pinned by the caller at creation.
    #[serde(default)]
    pub model_override: bool,
    /// Set on context-forked beliefs; the belief this one split from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Flagged by the staleness sweep once the belief is overdue enough to
    /// warrant re-checking. Cleared by the next successful update.
    #[serde(default)]
    pub needs_verify: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<BeliefEdge>,
    /// Provenance of the creating observation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

impl Belief {
    pub fn kind(&self) -> ModelKind {
        self.params.kind()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 4: Derived reads and reports
// ═══════════════════════════════════════════════════════════════════════════

/// Overdue-ness classification. Verify covers everything from the first
/// overdue deviation until decay kicks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessBand {
    Fresh,
    Verify,
    Decayed,
}

impl Default for StalenessBand {
    fn default() -> Self {
        StalenessBand::Fresh
    }
}

/// Central 100·level% credible interval around the posterior mean.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CredibleInterval {
    pub lo: f64,
    pub hi: f64,
    pub level: f64,
}

/// Read-only export of one belief for observers and audit collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeliefSnapshot {
    pub id: Uuid,
    pub key: String,
    pub model: ModelKind,
    pub mean: f64,
    pub interval: CredibleInterval,
    /// Evidence-weight confidence with the staleness discount applied.
    pub confidence: f64,
    pub observation_count: u64,
    pub version: u64,
    /// Standard-deviations overdue, when a cadence is declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staleness: Option<f64>,
    pub band: StalenessBand,
    pub last_observed: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_tags: Vec<ContextTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub needs_verify: bool,
}

/// Returned by repository mutations: the committed parameter state plus the
/// derived read the caller usually wants next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedBelief {
    pub id: Uuid,
    pub params: ModelParams,
    pub mean: f64,
    pub confidence: f64,
    pub observation_count: u64,
    pub version: u64,
    /// True when regularization shortened this commit's parameter movement.
    pub clamped: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_kind_round_trip() {
        for kind in [
            ModelKind::BetaBinomial,
            ModelKind::NormalGamma,
            ModelKind::GammaPoisson,
        ] {
            let parsed: ModelKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("beta".parse::<ModelKind>().is_err());
    }

    #[test]
    fn test_edge_kind_round_trip() {
        for kind in [EdgeKind::Supports, EdgeKind::Contradicts, EdgeKind::Relates] {
            let parsed: EdgeKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_evidence_shape_mapping() {
        assert_eq!(Evidence::success().implied_kind(), ModelKind::BetaBinomial);
        assert_eq!(Evidence::value(1.5).implied_kind(), ModelKind::NormalGamma);
        assert_eq!(Evidence::count(3).implied_kind(), ModelKind::GammaPoisson);
    }

    #[test]
    fn test_evidence_sample_sizes() {
        let e = Evidence::Binary {
            successes: 8,
            failures: 2,
        };
        assert_eq!(e.sample_size(), 10);
        assert_eq!(
            Evidence::Continuous {
                values: vec![1.0, 2.0, 3.0]
            }
            .sample_size(),
            3
        );
        assert_eq!(Evidence::Counts { counts: vec![5, 0] }.sample_size(), 2);
    }

    #[test]
    fn test_binary_trial_counts_saturate() {
        let e = Evidence::Binary {
            successes: u64::MAX,
            failures: 3,
        };
        assert_eq!(e.sample_size(), u64::MAX);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn test_evidence_validation_rejects_degenerate_payloads() {
        assert!(Evidence::Binary {
            successes: 0,
            failures: 0
        }
        .validate()
        .is_err());
        assert!(Evidence::Continuous { values: vec![] }.validate().is_err());
        assert!(Evidence::Continuous {
            values: vec![1.0, f64::NAN]
        }
        .validate()
        .is_err());
        assert!(Evidence::Counts { counts: vec![] }.validate().is_err());
        assert!(Evidence::success().validate().is_ok());
    }

    #[test]
    fn test_positivity_violation_flags_first_offender() {
        let p = ModelParams::BetaBinomial {
            alpha: -1.0,
            beta: 2.0,
        };
        assert_eq!(p.positivity_violation(), Some(("alpha", -1.0)));

        // μ may be negative; κ may not.
        let ok = ModelParams::NormalGamma {
            mu: -3.0,
            kappa: 1.0,
            alpha: 1.0,
            beta: 1.0,
        };
        assert!(ok.positivity_violation().is_none());

        let bad = ModelParams::NormalGamma {
            mu: -3.0,
            kappa: 0.0,
            alpha: 1.0,
            beta: 1.0,
        };
        assert_eq!(bad.positivity_violation(), Some(("kappa", 0.0)));
    }

    #[test]
    fn test_positivity_violation_flags_non_finite() {
        let p = ModelParams::GammaPoisson {
            alpha: f64::INFINITY,
            beta: 1.0,
        };
        assert!(p.positivity_violation().is_some());
    }

    #[test]
    fn test_observation_builder() {
        let obs = Observation::new("net/latency", Evidence::value(42.0))
            .with_context(vec![ContextTag::defining("env", "prod")])
            .with_source("episodic");
        assert_eq!(obs.key(), Some("net/latency"));
        assert_eq!(obs.context.len(), 1);
        assert!(obs.context[0].context_defining);
        assert_eq!(obs.source, "episodic");
    }
}
