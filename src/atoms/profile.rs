// ── Credence Atoms: Learning Profiles ───────────────────────────────────────
//
// Hierarchical learning configuration: one global default plus sparse
// per-domain overrides, merged field-by-field at read time. A resolved
// profile is an immutable value; the meta-learning layer mutates the store
// only through the approval path (`set_domain_field`).

use crate::atoms::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ── Prior strength ──────────────────────────────────────────────────────────

/// Named prior weight. The scale is a pseudo-count multiplier used for seed
/// priors and for the regularization movement cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorStrength {
    Weak,
    Moderate,
    Strong,
}

impl PriorStrength {
    pub fn scale(&self) -> f64 {
        match self {
            PriorStrength::Weak => 1.0,
            PriorStrength::Moderate => 4.0,
            PriorStrength::Strong => 16.0,
        }
    }
}

impl Default for PriorStrength {
    fn default() -> Self {
        PriorStrength::Weak
    }
}

impl fmt::Display for PriorStrength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PriorStrength::Weak => "weak",
            PriorStrength::Moderate => "moderate",
            PriorStrength::Strong => "strong",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PriorStrength {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weak" => Ok(PriorStrength::Weak),
            "moderate" => Ok(PriorStrength::Moderate),
            "strong" => Ok(PriorStrength::Strong),
            other => Err(format!("unknown prior strength: {}", other)),
        }
    }
}

// ── Self-tuning policy ──────────────────────────────────────────────────────

/// Per-field [lo, hi] bounds for tuning proposals, keyed by field name
/// ("learning_rate", "action_threshold", "proactivity", "regularization").
pub type TuningBounds = HashMap<String, [f64; 2]>;

/// Self-tuning policy. Proposals are always plain data; `suggest_only`
/// (the default) keeps them queued until an explicit approval call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfTuning {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_suggest_only")]
    pub suggest_only: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub bounds: TuningBounds,
}

fn default_suggest_only() -> bool {
    true
}

impl Default for SelfTuning {
    fn default() -> Self {
        SelfTuning {
            enabled: false,
            suggest_only: true,
            bounds: HashMap::new(),
        }
    }
}

// ── Learning profile ────────────────────────────────────────────────────────

/// Resolved learning configuration. Every numeric field is range-checked by
/// `validate`; default values keep the engine conservative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningProfile {
    /// Scales every parameter delta before commit. (0, 1].
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// How eagerly the embedding layers act unprompted. [0, 1]. Carried for
    /// the decision layer and the tuning surface; no core update reads it.
    #[serde(default = "default_proactivity")]
    pub proactivity: f64,
    /// Minimum belief confidence for the fast path. [0, 1].
    #[serde(default = "default_action_threshold")]
    pub action_threshold: f64,
    #[serde(default)]
    pub prior_strength: PriorStrength,
    /// Per-update movement cap multiplier. 0 disables capping.
    #[serde(default)]
    pub regularization: f64,
    #[serde(default)]
    pub self_tuning: SelfTuning,
}

fn default_learning_rate() -> f64 {
    1.0
}

fn default_proactivity() -> f64 {
    0.5
}

fn default_action_threshold() -> f64 {
    0.6
}

impl Default for LearningProfile {
    fn default() -> Self {
        LearningProfile {
            learning_rate: default_learning_rate(),
            proactivity: default_proactivity(),
            action_threshold: default_action_threshold(),
            prior_strength: PriorStrength::default(),
            regularization: 0.0,
            self_tuning: SelfTuning::default(),
        }
    }
}

impl LearningProfile {
    pub fn validate(&self) -> CoreResult<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(CoreError::config(format!(
                "learning_rate must be in (0, 1], got {}",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.proactivity) {
            return Err(CoreError::config(format!(
                "proactivity must be in [0, 1], got {}",
                self.proactivity
            )));
        }
        if !(0.0..=1.0).contains(&self.action_threshold) {
            return Err(CoreError::config(format!(
                "action_threshold must be in [0, 1], got {}",
                self.action_threshold
            )));
        }
        if !self.regularization.is_finite() || self.regularization < 0.0 {
            return Err(CoreError::config(format!(
                "regularization must be finite and >= 0, got {}",
                self.regularization
            )));
        }
        for (field, [lo, hi]) in &self.self_tuning.bounds {
            if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                return Err(CoreError::config(format!(
                    "tuning bounds for '{}' are not a valid [lo, hi] range",
                    field
                )));
            }
        }
        Ok(())
    }

    /// Total parameter movement allowed per update, or None when capping is
    /// disabled (`regularization == 0`).
    pub fn movement_cap(&self) -> Option<f64> {
        if self.regularization > 0.0 {
            Some(self.regularization * self.prior_strength.scale())
        } else {
            None
        }
    }
}

// ── Domain overrides ────────────────────────────────────────────────────────

/// Sparse per-domain override. Unset fields fall through to the global
/// default at resolve time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proactivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_strength: Option<PriorStrength>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regularization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_tuning: Option<SelfTuning>,
}

/// Global defaults plus per-domain overrides. Domains are the first path
/// segment of a pattern key ("net/latency" belongs to domain "net").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileStore {
    #[serde(default)]
    pub global: LearningProfile,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub domains: HashMap<String, ProfileOverride>,
}

impl ProfileStore {
    /// Merge the domain override field-by-field over the global default.
    /// Unknown domains resolve to the global profile unchanged.
    pub fn resolve(&self, domain: Option<&str>) -> LearningProfile {
        let mut profile = self.global.clone();
        if let Some(ov) = domain.and_then(|d| self.domains.get(d)) {
            if let Some(v) = ov.learning_rate {
                profile.learning_rate = v;
            }
            if let Some(v) = ov.proactivity {
                profile.proactivity = v;
            }
            if let Some(v) = ov.action_threshold {
                profile.action_threshold = v;
            }
            if let Some(v) = ov.prior_strength {
                profile.prior_strength = v;
            }
            if let Some(v) = ov.regularization {
                profile.regularization = v;
            }
            if let Some(v) = &ov.self_tuning {
                profile.self_tuning = v.clone();
            }
        }
        profile
    }

    /// Resolve using the pattern key's domain segment.
    pub fn resolve_for_key(&self, key: &str) -> LearningProfile {
        self.resolve(Some(domain_of(key)))
    }

    /// Validate the global profile and every resolved domain profile.
    pub fn validate(&self) -> CoreResult<()> {
        self.global.validate()?;
        for domain in self.domains.keys() {
            self.resolve(Some(domain))
                .validate()
                .map_err(|e| CoreError::config(format!("domain '{}': {}", domain, e)))?;
        }
        Ok(())
    }

    /// Write one numeric field of a domain override, validating the resolved
    /// result before committing. This is the only mutation path the
    /// meta-learning approval flow uses.
    pub fn set_domain_field(&mut self, domain: &str, field: &str, value: f64) -> CoreResult<()> {
        let mut ov = self.domains.get(domain).cloned().unwrap_or_default();
        match field {
            "learning_rate" => ov.learning_rate = Some(value),
            "proactivity" => ov.proactivity = Some(value),
            "action_threshold" => ov.action_threshold = Some(value),
            "regularization" => ov.regularization = Some(value),
            other => {
                return Err(CoreError::config(format!(
                    "'{}' is not a tunable profile field",
                    other
                )));
            }
        }
        let mut candidate = self.clone();
        candidate.domains.insert(domain.to_string(), ov.clone());
        candidate
            .resolve(Some(domain))
            .validate()
            .map_err(|e| CoreError::config(format!("rejected tuning write: {}", e)))?;
        self.domains.insert(domain.to_string(), ov);
        Ok(())
    }
}

/// First path segment of a pattern key.
pub fn domain_of(key: &str) -> &str {
    key.split('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(LearningProfile::default().validate().is_ok());
        assert!(ProfileStore::default().validate().is_ok());
    }

    #[test]
    fn test_prior_strength_scales() {
        assert_eq!(PriorStrength::Weak.scale(), 1.0);
        assert_eq!(PriorStrength::Moderate.scale(), 4.0);
        assert_eq!(PriorStrength::Strong.scale(), 16.0);
    }

    #[test]
    fn test_validation_bounds() {
        let mut p = LearningProfile::default();
        p.learning_rate = 0.0;
        assert!(p.validate().is_err());
        p.learning_rate = 1.5;
        assert!(p.validate().is_err());
        p.learning_rate = 1.0;
        p.action_threshold = -0.1;
        assert!(p.validate().is_err());
        p.action_threshold = 0.6;
        p.regularization = f64::NAN;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_domain_override_merges_field_by_field() {
        let mut store = ProfileStore::default();
        store.domains.insert(
            "net".to_string(),
            ProfileOverride {
                learning_rate: Some(0.25),
                prior_strength: Some(PriorStrength::Strong),
                ..Default::default()
            },
        );

        let net = store.resolve(Some("net"));
        assert!((net.learning_rate - 0.25).abs() < 1e-12);
        assert_eq!(net.prior_strength, PriorStrength::Strong);
        // Untouched fields fall through to the global default.
        assert!((net.action_threshold - 0.6).abs() < 1e-12);

        let other = store.resolve(Some("ui"));
        assert_eq!(other, store.global);
        assert_eq!(store.resolve(None), store.global);
    }

    #[test]
    fn test_resolve_for_key_uses_first_segment() {
        let mut store = ProfileStore::default();
        store.domains.insert(
            "net".to_string(),
            ProfileOverride {
                action_threshold: Some(0.8),
                ..Default::default()
            },
        );
        let p = store.resolve_for_key("net/latency/api");
        assert!((p.action_threshold - 0.8).abs() < 1e-12);
        assert_eq!(domain_of("standalone"), "standalone");
    }

    #[test]
    fn test_set_domain_field_validates_before_commit() {
        let mut store = ProfileStore::default();
        assert!(store.set_domain_field("net", "learning_rate", 0.5).is_ok());
        assert!((store.resolve(Some("net")).learning_rate - 0.5).abs() < 1e-12);

        // Out-of-range writes are rejected and leave the store untouched.
        assert!(store.set_domain_field("net", "learning_rate", 3.0).is_err());
        assert!((store.resolve(Some("net")).learning_rate - 0.5).abs() < 1e-12);

        assert!(store.set_domain_field("net", "prior_strength", 2.0).is_err());
    }

    #[test]
    fn test_profile_round_trips_through_json() {
        let mut store = ProfileStore::default();
        store.global.self_tuning.enabled = true;
        store
            .global
            .self_tuning
            .bounds
            .insert("learning_rate".to_string(), [0.1, 1.0]);
        let json = serde_json::to_string(&store).unwrap();
        let back: ProfileStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }
}
