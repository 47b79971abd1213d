// ── Meta-Learning ────────────────────────────────────────────────────────────
// Watches aggregate outcomes per profile domain and proposes profile
// adjustments. Suggest-only by default: proposals sit pending until approved,
// and every applied change goes through the same validated ProfileStore path
// a manual edit would. Belief parameters are never touched from here.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::profile::ProfileStore;
use crate::engine::observability::{CoreEvent, EventLog};
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

// ── Constants ────────────────────────────────────────────────────────────────

/// Clamped-update share that suggests the learning rate is too hot.
pub const HIGH_CORRECTION_RATE: f64 = 0.30;

/// Escalation share that suggests the action threshold is too strict.
pub const HIGH_ESCALATION_RATE: f64 = 0.50;

/// Stale share of swept beliefs that suggests verification lags.
pub const HIGH_STALE_RATE: f64 = 0.50;

/// Observations required before a rate is trusted.
pub const MIN_SAMPLES: u64 = 20;

// ── Metrics ──────────────────────────────────────────────────────────────────

/// Per-domain outcome counters since the last measurement window reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningMetrics {
    pub updates: u64,
    pub clamped_updates: u64,
    pub rejected_updates: u64,
    pub routes: u64,
    pub escalations: u64,
    pub stale_beliefs: u64,
    pub swept_beliefs: u64,
}

impl TuningMetrics {
    pub fn correction_rate(&self) -> f64 {
        if self.updates == 0 {
            return 0.0;
        }
        self.clamped_updates as f64 / self.updates as f64
    }

    pub fn escalation_rate(&self) -> f64 {
        if self.routes == 0 {
            return 0.0;
        }
        self.escalations as f64 / self.routes as f64
    }

    pub fn stale_rate(&self) -> f64 {
        if self.swept_beliefs == 0 {
            return 0.0;
        }
        self.stale_beliefs as f64 / self.swept_beliefs as f64
    }
}

// ── Proposals ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Applied,
    Dismissed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuningProposal {
    pub id: Uuid,
    pub domain: String,
    pub field: String,
    pub current: f64,
    pub proposed: f64,
    /// The metrics window that motivated the proposal.
    pub justification: TuningMetrics,
    pub created_at: DateTime<Utc>,
    pub status: ProposalStatus,
}

// ── Learner ──────────────────────────────────────────────────────────────────

pub struct MetaLearner {
    metrics: Mutex<HashMap<String, TuningMetrics>>,
    proposals: Mutex<Vec<TuningProposal>>,
    events: Arc<EventLog>,
}

impl MetaLearner {
    pub fn new(events: Arc<EventLog>) -> Self {
        MetaLearner {
            metrics: Mutex::new(HashMap::new()),
            proposals: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn record_update(&self, domain: &str, clamped: bool) {
        let mut metrics = self.metrics.lock();
        let m = metrics.entry(domain.to_string()).or_default();
        m.updates += 1;
        if clamped {
            m.clamped_updates += 1;
        }
    }

    pub fn record_rejection(&self, domain: &str) {
        let mut metrics = self.metrics.lock();
        metrics.entry(domain.to_string()).or_default().rejected_updates += 1;
    }

    pub fn record_route(&self, domain: &str, escalated: bool) {
        let mut metrics = self.metrics.lock();
        let m = metrics.entry(domain.to_string()).or_default();
        m.routes += 1;
        if escalated {
            m.escalations += 1;
        }
    }

    pub fn record_sweep(&self, domain: &str, stale: u64, swept: u64) {
        let mut metrics = self.metrics.lock();
        let m = metrics.entry(domain.to_string()).or_default();
        m.stale_beliefs += stale;
        m.swept_beliefs += swept;
    }

    pub fn metrics_for(&self, domain: &str) -> TuningMetrics {
        self.metrics.lock().get(domain).copied().unwrap_or_default()
    }

    /// Check a domain's window against the tuning heuristics. New proposals
    /// are recorded pending (or applied immediately when the profile opts out
    /// of suggest-only) and returned.
    pub fn evaluate(&self, store: &mut ProfileStore, domain: &str) -> Vec<TuningProposal> {
        let profile = store.resolve(Some(domain));
        if !profile.self_tuning.enabled {
            return Vec::new();
        }
        let window = self.metrics_for(domain);

        let mut candidates: Vec<(&'static str, f64, f64)> = Vec::new();
        if window.updates >= MIN_SAMPLES && window.correction_rate() >= HIGH_CORRECTION_RATE {
            // Persistent clamping means single observations keep overshooting.
            candidates.push(("learning_rate", profile.learning_rate, profile.learning_rate / 2.0));
        }
        if window.routes >= MIN_SAMPLES && window.escalation_rate() >= HIGH_ESCALATION_RATE {
            candidates.push((
                "action_threshold",
                profile.action_threshold,
                profile.action_threshold - 0.05,
            ));
        }
        if window.swept_beliefs >= MIN_SAMPLES && window.stale_rate() >= HIGH_STALE_RATE {
            candidates.push(("proactivity", profile.proactivity, profile.proactivity + 0.1));
        }
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut new_proposals = Vec::new();
        for (field, current, raw) in candidates {
            let proposed = clamp_to_bounds(raw, profile.self_tuning.bounds.get(field));
            if !field_is_legal(field, proposed) {
                debug!(
                    "[belief:meta] dropping {}/{} proposal, {} is out of range",
                    domain, field, proposed
                );
                continue;
            }
            if (proposed - current).abs() < 1e-9 {
                continue;
            }
            if self.has_pending(domain, field) {
                continue;
            }

            let mut proposal = TuningProposal {
                id: Uuid::new_v4(),
                domain: domain.to_string(),
                field: field.to_string(),
                current,
                proposed,
                justification: window,
                created_at: Utc::now(),
                status: ProposalStatus::Pending,
            };
            self.events.record(CoreEvent::TuningProposed {
                domain: domain.to_string(),
                field: field.to_string(),
                proposed,
            });

            if profile.self_tuning.suggest_only {
                info!(
                    "[belief:meta] proposing {}/{}: {:.3} -> {:.3}",
                    domain, field, current, proposed
                );
            } else if store.set_domain_field(domain, field, proposed).is_ok() {
                proposal.status = ProposalStatus::Applied;
                self.reset_window(domain);
                info!(
                    "[belief:meta] auto-applied {}/{}: {:.3} -> {:.3}",
                    domain, field, current, proposed
                );
            }

            self.proposals.lock().push(proposal.clone());
            new_proposals.push(proposal);
        }
        new_proposals
    }

    pub fn pending(&self) -> Vec<TuningProposal> {
        self.proposals
            .lock()
            .iter()
            .filter(|p| p.status == ProposalStatus::Pending)
            .cloned()
            .collect()
    }

    /// Apply a pending proposal through the validated profile path. The
    /// domain's measurement window restarts so the next evaluation judges
    /// the new setting on fresh evidence.
    pub fn apply_approved(&self, store: &mut ProfileStore, id: Uuid) -> CoreResult<()> {
        let mut proposals = self.proposals.lock();
        let proposal = proposals
            .iter_mut()
            .find(|p| p.id == id && p.status == ProposalStatus::Pending)
            .ok_or_else(|| CoreError::config(format!("no pending proposal {}", id)))?;
        store.set_domain_field(&proposal.domain, &proposal.field, proposal.proposed)?;
        proposal.status = ProposalStatus::Applied;
        info!(
            "[belief:meta] approved {}/{}: {:.3} -> {:.3}",
            proposal.domain, proposal.field, proposal.current, proposal.proposed
        );
        let domain = proposal.domain.clone();
        drop(proposals);
        self.reset_window(&domain);
        Ok(())
    }

    pub fn dismiss(&self, id: Uuid) -> CoreResult<()> {
        let mut proposals = self.proposals.lock();
        let proposal = proposals
            .iter_mut()
            .find(|p| p.id == id && p.status == ProposalStatus::Pending)
            .ok_or_else(|| CoreError::config(format!("no pending proposal {}", id)))?;
        proposal.status = ProposalStatus::Dismissed;
        let domain = proposal.domain.clone();
        drop(proposals);
        self.reset_window(&domain);
        Ok(())
    }

    fn has_pending(&self, domain: &str, field: &str) -> bool {
        self.proposals
            .lock()
            .iter()
            .any(|p| p.status == ProposalStatus::Pending && p.domain == domain && p.field == field)
    }

    fn reset_window(&self, domain: &str) {
        self.metrics.lock().remove(domain);
    }
}

fn clamp_to_bounds(value: f64, bounds: Option<&[f64; 2]>) -> f64 {
    match bounds {
        Some([lo, hi]) => value.max(*lo).min(*hi),
        None => value,
    }
}

fn field_is_legal(field: &str, value: f64) -> bool {
    match field {
        "learning_rate" => value.is_finite() && value > 0.0 && value <= 1.0,
        "proactivity" | "action_threshold" => value.is_finite() && (0.0..=1.0).contains(&value),
        "regularization" => value.is_finite() && value >= 0.0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning_store() -> ProfileStore {
        let mut store = ProfileStore::default();
        store.global.self_tuning.enabled = true;
        store
    }

    fn make_learner() -> (MetaLearner, Arc<EventLog>) {
        let events = Arc::new(EventLog::new());
        (MetaLearner::new(Arc::clone(&events)), events)
    }

    #[test]
    fn test_high_correction_rate_halves_learning_rate() {
        let (learner, events) = make_learner();
        let mut store = tuning_store();
        for i in 0..20 {
            learner.record_update("deploy", i % 2 == 0);
        }

        let proposals = learner.evaluate(&mut store, "deploy");
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].field, "learning_rate");
        assert_eq!(proposals[0].current, 1.0);
        assert_eq!(proposals[0].proposed, 0.5);
        assert_eq!(proposals[0].status, ProposalStatus::Pending);
        // Suggest-only: the live profile is untouched.
        assert_eq!(store.resolve(Some("deploy")).learning_rate, 1.0);
        assert!(events
            .recent(4)
            .iter()
            .any(|r| matches!(&r.event, CoreEvent::TuningProposed { field, .. } if field == "learning_rate")));
    }

    #[test]
    fn test_small_windows_stay_quiet() {
        let (learner, _) = make_learner();
        let mut store = tuning_store();
        for _ in 0..5 {
            learner.record_update("deploy", true);
        }
        assert!(learner.evaluate(&mut store, "deploy").is_empty());
    }

    #[test]
    fn test_disabled_tuning_never_proposes() {
        let (learner, _) = make_learner();
        let mut store = ProfileStore::default();
        for _ in 0..40 {
            learner.record_update("deploy", true);
        }
        assert!(learner.evaluate(&mut store, "deploy").is_empty());
    }

    #[test]
    fn test_high_escalation_rate_lowers_action_threshold() {
        let (learner, _) = make_learner();
        let mut store = tuning_store();
        for i in 0..20 {
            learner.record_route("net", i < 12);
        }

        let proposals = learner.evaluate(&mut store, "net");
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].field, "action_threshold");
        assert!((proposals[0].proposed - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_high_stale_rate_raises_proactivity() {
        let (learner, _) = make_learner();
        let mut store = tuning_store();
        learner.record_sweep("habit", 15, 20);

        let proposals = learner.evaluate(&mut store, "habit");
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].field, "proactivity");
        assert!((proposals[0].proposed - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_user_bounds_clamp_proposals() {
        let (learner, _) = make_learner();
        let mut store = tuning_store();
        store
            .global
            .self_tuning
            .bounds
            .insert("learning_rate".to_string(), [0.8, 1.0]);
        for _ in 0..20 {
            learner.record_update("deploy", true);
        }

        let proposals = learner.evaluate(&mut store, "deploy");
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].proposed, 0.8);
    }

    #[test]
    fn test_approve_applies_through_profile_store() {
        let (learner, _) = make_learner();
        let mut store = tuning_store();
        for _ in 0..20 {
            learner.record_update("deploy", true);
        }
        let id = learner.evaluate(&mut store, "deploy")[0].id;

        learner.apply_approved(&mut store, id).unwrap();
        assert_eq!(store.resolve(Some("deploy")).learning_rate, 0.5);
        // Other domains keep the global setting.
        assert_eq!(store.resolve(Some("net")).learning_rate, 1.0);
        assert!(learner.pending().is_empty());
        // The window restarted with the new setting.
        assert_eq!(learner.metrics_for("deploy"), TuningMetrics::default());

        let err = learner.apply_approved(&mut store, Uuid::new_v4()).unwrap_err();
        assert_eq!(err.kind_label(), "config");
    }

    #[test]
    fn test_dismiss_keeps_profile_unchanged() {
        let (learner, _) = make_learner();
        let mut store = tuning_store();
        for _ in 0..20 {
            learner.record_update("deploy", true);
        }
        let id = learner.evaluate(&mut store, "deploy")[0].id;

        learner.dismiss(id).unwrap();
        assert_eq!(store.resolve(Some("deploy")).learning_rate, 1.0);
        assert!(learner.pending().is_empty());
    }

    #[test]
    fn test_auto_apply_when_not_suggest_only() {
        let (learner, events) = make_learner();
        let mut store = tuning_store();
        store.global.self_tuning.suggest_only = false;
        for _ in 0..20 {
            learner.record_update("deploy", true);
        }

        let proposals = learner.evaluate(&mut store, "deploy");
        assert_eq!(proposals[0].status, ProposalStatus::Applied);
        assert_eq!(store.resolve(Some("deploy")).learning_rate, 0.5);
        assert!(!events.is_empty());
    }

    #[test]
    fn test_no_duplicate_pending_proposals() {
        let (learner, _) = make_learner();
        let mut store = tuning_store();
        for _ in 0..20 {
            learner.record_update("deploy", true);
        }

        assert_eq!(learner.evaluate(&mut store, "deploy").len(), 1);
        assert!(learner.evaluate(&mut store, "deploy").is_empty());
        assert_eq!(learner.pending().len(), 1);
    }
}
