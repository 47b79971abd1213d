// ── Staleness & Decay ────────────────────────────────────────────────────────
// Overdue scoring for beliefs with a declared cadence. Three stages:
//   score    — standard deviations past the expected period
//   band     — fresh / verify / decayed classification
//   weight   — confidence multiplier once decay sets in
// Parameters are never mutated here. Decay only discounts the evidential
// weight the confidence derivation sees; the verify band sets a persisted
// flag that the next successful update clears.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::types::{Belief, ExpectedPeriod, StalenessBand};
use crate::engine::repository::BeliefRepository;
use crate::engine::scheduler::{BatchJob, BatchWork, PriorityClass, SliceOutcome, Tier, YieldFlag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

// ── Constants ────────────────────────────────────────────────────────────────

/// Staleness below this is simply fresh.
pub const VERIFY_ONSET: f64 = 1.0;

/// Staleness at or above this starts confidence decay.
pub const DECAY_ONSET: f64 = 3.0;

/// Budget estimate for one sweep slice.
const SWEEP_COST_EST_SECS: f64 = 1.0;

// ── Scoring ──────────────────────────────────────────────────────────────────

/// Standard deviations past the expected period. None when the declared
/// cadence is unusable (non-positive or non-finite spread).
pub fn score(period: &ExpectedPeriod, elapsed_secs: f64) -> Option<f64> {
    if !(period.std_dev_secs > 0.0 && period.std_dev_secs.is_finite()) {
        return None;
    }
    Some((elapsed_secs - period.period_secs) / period.std_dev_secs)
}

pub fn classify(score: f64) -> StalenessBand {
    if score < VERIFY_ONSET {
        StalenessBand::Fresh
    } else if score < DECAY_ONSET {
        StalenessBand::Verify
    } else {
        StalenessBand::Decayed
    }
}

/// Pseudo-count weight multiplier for the confidence derivation. 1.0 until
/// decay onset, then a smooth hyperbolic falloff that never reaches zero.
pub fn confidence_weight(score: f64) -> f64 {
    if score < DECAY_ONSET {
        1.0
    } else {
        1.0 / (1.0 + (score - DECAY_ONSET))
    }
}

/// (score, band, weight) for a belief at `now`. Beliefs without a declared
/// cadence are always fresh at full weight.
pub fn assess(belief: &Belief, now: DateTime<Utc>) -> (Option<f64>, StalenessBand, f64) {
    let elapsed_secs = (now - belief.last_observed).num_milliseconds() as f64 / 1000.0;
    match belief.expected_period.as_ref().and_then(|p| score(p, elapsed_secs)) {
        Some(s) => (Some(s), classify(s), confidence_weight(s)),
        None => (None, StalenessBand::Fresh, 1.0),
    }
}

// ── Sweep ────────────────────────────────────────────────────────────────────

/// Sweep cadence configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StalenessConfig {
    /// Seconds between background sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for StalenessConfig {
    fn default() -> Self {
        StalenessConfig {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl StalenessConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.sweep_interval_secs == 0 {
            return Err(CoreError::config("sweep_interval_secs must be positive"));
        }
        Ok(())
    }
}

/// What one sweep found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub swept: usize,
    pub fresh: usize,
    pub verify: usize,
    pub decayed: usize,
    /// Beliefs without a usable declared cadence.
    pub unscored: usize,
    /// Beliefs whose verify flag was set by this sweep.
    pub newly_flagged: usize,
    pub most_stale: Option<(Uuid, f64)>,
    pub duration_ms: u64,
}

/// Re-score every belief, flag the overdue ones for verification, and report.
/// Runs on the background tier; never touches model parameters.
pub fn run_staleness_sweep(repo: &BeliefRepository, now: DateTime<Utc>) -> SweepReport {
    let started = Instant::now();
    let mut report = SweepReport::default();

    for snapshot in repo.snapshot_all_at(now) {
        report.swept += 1;
        match snapshot.staleness {
            None => report.unscored += 1,
            Some(s) => {
                match snapshot.band {
                    StalenessBand::Fresh => report.fresh += 1,
                    StalenessBand::Verify => report.verify += 1,
                    StalenessBand::Decayed => report.decayed += 1,
                }
                if snapshot.band != StalenessBand::Fresh && !snapshot.needs_verify {
                    // Belief may have been updated or removed since the
                    // snapshot; a failed mark is not worth surfacing.
                    if repo.mark_verify(snapshot.id, true).is_ok() {
                        report.newly_flagged += 1;
                        debug!(
                            "[belief:staleness] flagged {} ({}) at {:.2}σ overdue",
                            snapshot.id, snapshot.key, s
                        );
                    }
                }
                if report.most_stale.map(|(_, best)| s > best).unwrap_or(false)
                    || report.most_stale.is_none()
                {
                    report.most_stale = Some((snapshot.id, s));
                }
            }
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        "[belief:staleness] sweep: {} beliefs ({} fresh, {} verify, {} decayed, {} unscored), {} newly flagged in {}ms",
        report.swept,
        report.fresh,
        report.verify,
        report.decayed,
        report.unscored,
        report.newly_flagged,
        report.duration_ms
    );
    report
}

// ── Scheduler integration ────────────────────────────────────────────────────

/// One sweep per slice. Cheap enough that the only checkpoint is at entry.
pub struct SweepWork {
    repo: Arc<BeliefRepository>,
}

#[async_trait]
impl BatchWork for SweepWork {
    async fn run_slice(&self, yield_flag: &YieldFlag) -> CoreResult<SliceOutcome> {
        if yield_flag.is_requested() {
            return Ok(SliceOutcome::Yielded);
        }
        run_staleness_sweep(&self.repo, Utc::now());
        Ok(SliceOutcome::Completed)
    }
}

/// Build the recurring background-tier sweep job.
pub fn sweep_job(repo: Arc<BeliefRepository>, cfg: &StalenessConfig) -> BatchJob {
    BatchJob::new(
        "staleness-sweep",
        Tier::Background,
        PriorityClass::Background,
        SWEEP_COST_EST_SECS,
        Arc::new(SweepWork { repo }),
    )
    .recurring(cfg.sweep_interval_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::profile::LearningProfile;
    use crate::atoms::types::{Evidence, Observation};
    use chrono::Duration;

    #[test]
    fn test_score_in_deviation_units() {
        let period = ExpectedPeriod::new(300.0, 50.0);
        // Expected every ~300s, last seen 400s ago: 2 deviations overdue.
        assert_eq!(score(&period, 400.0), Some(2.0));
        assert_eq!(score(&period, 300.0), Some(0.0));
        // Unusable spread disables scoring.
        assert_eq!(score(&ExpectedPeriod::new(300.0, 0.0), 400.0), None);
    }

    #[test]
    fn test_band_boundaries() {
        assert_eq!(classify(-2.0), StalenessBand::Fresh);
        assert_eq!(classify(0.99), StalenessBand::Fresh);
        assert_eq!(classify(1.0), StalenessBand::Verify);
        assert_eq!(classify(2.0), StalenessBand::Verify);
        assert_eq!(classify(2.99), StalenessBand::Verify);
        assert_eq!(classify(3.0), StalenessBand::Decayed);
    }

    #[test]
    fn test_weight_starts_at_decay_onset() {
        assert_eq!(confidence_weight(0.0), 1.0);
        assert_eq!(confidence_weight(2.9), 1.0);
        assert!((confidence_weight(3.0) - 1.0).abs() < 1e-12);
        assert!((confidence_weight(5.0) - 1.0 / 3.0).abs() < 1e-12);
        // Monotone falloff, never zero.
        assert!(confidence_weight(10.0) < confidence_weight(5.0));
        assert!(confidence_weight(1000.0) > 0.0);
    }

    #[test]
    fn test_sweep_flags_overdue_beliefs() {
        let repo = BeliefRepository::new();
        let profile = LearningProfile::default();
        let now = Utc::now();

        let fresh = repo
            .create(
                &Observation::new("svc/ping", Evidence::success()).observed_at(now),
                None,
                &profile,
            )
            .unwrap();
        let overdue = repo
            .create(
                &Observation::new("svc/backup", Evidence::success())
                    .observed_at(now - Duration::seconds(400)),
                None,
                &profile,
            )
            .unwrap();
        repo.set_expected_period(fresh.id, ExpectedPeriod::new(300.0, 50.0))
            .unwrap();
        repo.set_expected_period(overdue.id, ExpectedPeriod::new(300.0, 50.0))
            .unwrap();

        let report = run_staleness_sweep(&repo, now);
        assert_eq!(report.swept, 2);
        assert_eq!(report.verify, 1);
        assert_eq!(report.newly_flagged, 1);
        assert_eq!(report.most_stale.map(|(id, _)| id), Some(overdue.id));

        assert!(repo.read(overdue.id).unwrap().needs_verify);
        assert!(!repo.read(fresh.id).unwrap().needs_verify);

        // Second sweep finds the flag already set.
        let again = run_staleness_sweep(&repo, now);
        assert_eq!(again.newly_flagged, 0);
    }

    #[test]
    fn test_verify_never_blocks_updates() {
        let repo = BeliefRepository::new();
        let profile = LearningProfile::default();
        let past = Utc::now() - Duration::seconds(4000);

        let created = repo
            .create(
                &Observation::new("svc/backup", Evidence::success()).observed_at(past),
                None,
                &profile,
            )
            .unwrap();
        repo.set_expected_period(created.id, ExpectedPeriod::new(300.0, 50.0))
            .unwrap();
        run_staleness_sweep(&repo, Utc::now());
        assert!(repo.read(created.id).unwrap().needs_verify);

        // A verify-flagged belief still absorbs evidence, which clears the flag.
        let obs = Observation::for_belief(created.id, Evidence::success());
        repo.update(created.id, &obs, &profile).unwrap();
        assert!(!repo.read(created.id).unwrap().needs_verify);
    }

    #[test]
    fn test_decay_discounts_snapshot_confidence() {
        let repo = BeliefRepository::new();
        let profile = LearningProfile::default();
        let now = Utc::now();
        let long_ago = now - Duration::seconds(100_000);

        let created = repo
            .create(
                &Observation::new(
                    "svc/metric",
                    Evidence::Binary {
                        successes: 50,
                        failures: 50,
                    },
                )
                .observed_at(long_ago),
                None,
                &profile,
            )
            .unwrap();
        repo.set_expected_period(created.id, ExpectedPeriod::new(300.0, 50.0))
            .unwrap();

        let decayed = repo.snapshot_at(created.id, now).unwrap();
        assert_eq!(decayed.band, StalenessBand::Decayed);
        assert!(decayed.confidence < created.confidence);

        // Parameters themselves are untouched by decay.
        assert_eq!(repo.read(created.id).unwrap().params, created.params);
    }
}
