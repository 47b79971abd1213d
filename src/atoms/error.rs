// ── Credence Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the belief core, built with `thiserror`.
//
// Design rules:
//   • Variants map to the validation failures of the create/update contract
//     plus the scheduler's budget signal. Corrective actions (regularization
//     clamping, staleness decay) are never errors.
//   • Rejections always leave stored state untouched: a failed update retains
//     the original parameters.
//   • Messages carry belief ids and offending values, never whole payloads.

use thiserror::Error;
use uuid::Uuid;

// ── Primary error enum ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CoreError {
    /// Evidence payload does not fit any usable model shape, or does not fit
    /// the targeted belief's model family.
    #[error("Invalid evidence shape: {0}")]
    InvalidShape(String),

    /// Explicit model override conflicts with the evidence shape or with a
    /// stored belief's model kind.
    #[error("Invalid model override: requested {requested}, existing {existing}")]
    InvalidOverride { requested: String, existing: String },

    /// Operation on an unknown id.
    #[error("No such entity: {0}")]
    NotFound(Uuid),

    /// An update would drive α, β, or κ non-positive (or non-finite).
    /// The stored parameters are retained unchanged.
    #[error("Degenerate parameters for belief {belief}: {parameter} would become {value}")]
    DegenerateParameters {
        belief: Uuid,
        parameter: &'static str,
        value: f64,
    },

    /// A batch job asked for more than its tier currently allows.
    /// The job is deferred, not failed.
    #[error("Budget exceeded on {tier} tier: requested {requested_secs:.1}s, remaining {remaining_secs:.1}s")]
    BudgetExceeded {
        tier: String,
        requested_secs: f64,
        remaining_secs: f64,
    },

    /// Profile or component configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization / deserialization failure (snapshot export).
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ── Convenience constructors ────────────────────────────────────────────────

impl CoreError {
    /// Create an invalid-shape rejection with a human-readable reason.
    pub fn invalid_shape(reason: impl Into<String>) -> Self {
        Self::InvalidShape(reason.into())
    }

    /// Create an invalid-override rejection.
    pub fn invalid_override(requested: impl Into<String>, existing: impl Into<String>) -> Self {
        Self::InvalidOverride {
            requested: requested.into(),
            existing: existing.into(),
        }
    }

    /// Create a degenerate-parameters rejection for one belief.
    pub fn degenerate(belief: Uuid, parameter: &'static str, value: f64) -> Self {
        Self::DegenerateParameters {
            belief,
            parameter,
            value,
        }
    }

    /// Create a budget-exceeded signal for a tier.
    pub fn budget(tier: impl Into<String>, requested_secs: f64, remaining_secs: f64) -> Self {
        Self::BudgetExceeded {
            tier: tier.into(),
            requested_secs,
            remaining_secs,
        }
    }

    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    /// Short stable label for event records and failure-streak bookkeeping.
    pub fn kind_label(&self) -> &'static str {
        match self {
            CoreError::InvalidShape(_) => "invalid_shape",
            CoreError::InvalidOverride { .. } => "invalid_override",
            CoreError::NotFound(_) => "not_found",
            CoreError::DegenerateParameters { .. } => "degenerate_parameters",
            CoreError::BudgetExceeded { .. } => "budget_exceeded",
            CoreError::Config(_) => "config",
            CoreError::Serialization(_) => "serialization",
        }
    }

    /// True for the rejection kinds that count toward a belief's
    /// needs-attention streak.
    pub fn is_update_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidShape(_) | CoreError::DegenerateParameters { .. }
        )
    }
}

// ── Convenience alias ───────────────────────────────────────────────────────

/// All fallible core operations return this type.
pub type CoreResult<T> = Result<T, CoreError>;

// ── Conversion: CoreError → String ──────────────────────────────────────────
// Lets embedders with stringly-typed boundaries call `.map_err(CoreError::into)`.

impl From<CoreError> for String {
    fn from(e: CoreError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let id = Uuid::new_v4();
        let e = CoreError::degenerate(id, "alpha", -0.5);
        let msg = e.to_string();
        assert!(msg.contains("alpha"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_kind_labels_are_stable() {
        assert_eq!(
            CoreError::invalid_shape("empty evidence").kind_label(),
            "invalid_shape"
        );
        assert_eq!(
            CoreError::budget("sleep", 10.0, 2.0).kind_label(),
            "budget_exceeded"
        );
    }

    #[test]
    fn test_rejection_classification() {
        let id = Uuid::new_v4();
        assert!(CoreError::invalid_shape("x").is_update_rejection());
        assert!(CoreError::degenerate(id, "kappa", 0.0).is_update_rejection());
        assert!(!CoreError::NotFound(id).is_update_rejection());
        assert!(!CoreError::config("x").is_update_rejection());
    }
}
