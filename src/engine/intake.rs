// ── Candidate Intake ─────────────────────────────────────────────────────────
// Staging area between offline miners and the live belief store. Pattern
// mining and causal extraction submit candidates at any time; application
// happens in batches during sleep windows, through the same resolver and
// update paths as online evidence. Nothing writes beliefs directly from here.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::profile::ProfileStore;
use crate::atoms::types::{ModelParams, Observation};
use crate::engine::observability::EventLog;
use crate::engine::repository::BeliefRepository;
use crate::engine::resolver::{ContextResolver, Resolution};
use crate::engine::scheduler::{BatchJob, BatchWork, PriorityClass, SliceOutcome, Tier, YieldFlag};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

// ── Constants ────────────────────────────────────────────────────────────────

/// Pending candidates kept before the oldest are evicted.
pub const MAX_PENDING_CANDIDATES: usize = 1000;

/// Unapplied candidates older than this are dropped at the next touch.
pub const CANDIDATE_TTL_SECS: i64 = 86_400;

const DRAIN_COST_EST_SECS: f64 = 5.0;

// ── Candidates ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrigin {
    /// Pattern mining over accumulated episodes.
    Mined,
    /// Causal extraction from action/outcome pairs.
    Causal,
}

impl fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CandidateOrigin::Mined => "mined",
            CandidateOrigin::Causal => "causal",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateKind {
    /// Evidence for a (possibly new) belief, resolved like live observations.
    NewBelief { observation: Observation },
    /// A proposed parameter revision of an existing belief.
    Revision { belief_id: Uuid, params: ModelParams },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSubmission {
    pub id: Uuid,
    pub origin: CandidateOrigin,
    pub submitted_at: DateTime<Utc>,
    pub kind: CandidateKind,
}

impl CandidateSubmission {
    pub fn new_belief(origin: CandidateOrigin, observation: Observation) -> Self {
        CandidateSubmission {
            id: Uuid::new_v4(),
            origin,
            submitted_at: Utc::now(),
            kind: CandidateKind::NewBelief { observation },
        }
    }

    pub fn revision(origin: CandidateOrigin, belief_id: Uuid, params: ModelParams) -> Self {
        CandidateSubmission {
            id: Uuid::new_v4(),
            origin,
            submitted_at: Utc::now(),
            kind: CandidateKind::Revision { belief_id, params },
        }
    }
}

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntakeConfig {
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    /// Candidates applied per drain slice.
    #[serde(default = "default_drain_batch")]
    pub drain_batch: usize,
    /// Standing drain job cadence.
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
}

fn default_max_pending() -> usize {
    MAX_PENDING_CANDIDATES
}
fn default_ttl_secs() -> i64 {
    CANDIDATE_TTL_SECS
}
fn default_drain_batch() -> usize {
    50
}
fn default_drain_interval() -> u64 {
    600
}

impl Default for IntakeConfig {
    fn default() -> Self {
        IntakeConfig {
            max_pending: default_max_pending(),
            ttl_secs: default_ttl_secs(),
            drain_batch: default_drain_batch(),
            drain_interval_secs: default_drain_interval(),
        }
    }
}

impl IntakeConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_pending == 0 || self.drain_batch == 0 {
            return Err(CoreError::config(
                "max_pending and drain_batch must be positive",
            ));
        }
        if self.ttl_secs <= 0 {
            return Err(CoreError::config("ttl_secs must be positive"));
        }
        if self.drain_interval_secs == 0 {
            return Err(CoreError::config("drain_interval_secs must be positive"));
        }
        Ok(())
    }
}

// ── Intake queue ─────────────────────────────────────────────────────────────

/// Bounded, TTL-expiring candidate queue. Clone shares the backing queue.
#[derive(Clone)]
pub struct CandidateIntake {
    pending: Arc<Mutex<Vec<CandidateSubmission>>>,
    cfg: IntakeConfig,
}

impl CandidateIntake {
    pub fn new(cfg: IntakeConfig) -> Self {
        CandidateIntake {
            pending: Arc::new(Mutex::new(Vec::new())),
            cfg,
        }
    }

    /// Queue a candidate. A full queue evicts the oldest entry; submission
    /// itself never fails.
    pub fn submit(&self, candidate: CandidateSubmission) -> Uuid {
        let id = candidate.id;
        let mut pending = self.pending.lock();
        Self::purge_expired(&mut pending, self.cfg.ttl_secs);
        if pending.len() >= self.cfg.max_pending {
            let evicted = pending.remove(0);
            warn!(
                "[belief:intake] queue full, evicting oldest candidate {} ({})",
                evicted.id, evicted.origin
            );
        }
        debug!(
            "[belief:intake] queued {} candidate {} ({} pending)",
            candidate.origin,
            id,
            pending.len() + 1
        );
        pending.push(candidate);
        id
    }

    /// Remove and return up to `max` candidates, oldest first.
    pub fn drain(&self, max: usize) -> Vec<CandidateSubmission> {
        let mut pending = self.pending.lock();
        Self::purge_expired(&mut pending, self.cfg.ttl_secs);
        let take = max.min(pending.len());
        pending.drain(..take).collect()
    }

    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock();
        Self::purge_expired(&mut pending, self.cfg.ttl_secs);
        pending.len()
    }

    fn purge_expired(pending: &mut Vec<CandidateSubmission>, ttl_secs: i64) {
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl_secs);
        let before = pending.len();
        pending.retain(|c| c.submitted_at > cutoff);
        let purged = before - pending.len();
        if purged > 0 {
            debug!("[belief:intake] purged {} expired candidates", purged);
        }
    }
}

// ── Application ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IntakeReport {
    pub drained: usize,
    pub created: usize,
    pub updated: usize,
    pub forked: usize,
    pub revised: usize,
    pub rejected: usize,
}

/// Apply up to `max` queued candidates through the normal update paths.
/// Individual rejections are counted and logged; the batch keeps going.
pub fn apply_candidates(
    intake: &CandidateIntake,
    resolver: &ContextResolver,
    repo: &BeliefRepository,
    profiles: &ProfileStore,
    events: &EventLog,
    max: usize,
) -> IntakeReport {
    let batch = intake.drain(max);
    let mut report = IntakeReport {
        drained: batch.len(),
        ..Default::default()
    };

    for candidate in batch {
        match candidate.kind {
            CandidateKind::NewBelief { observation } => {
                let profile = match observation.key() {
                    Some(key) => profiles.resolve_for_key(key),
                    None => profiles.resolve(None),
                };
                match resolver.resolve(&observation, &profile) {
                    Ok(Resolution::Created { .. }) => report.created += 1,
                    Ok(Resolution::Matched { .. }) => report.updated += 1,
                    Ok(Resolution::Forked { .. }) => report.forked += 1,
                    Err(e) => {
                        report.rejected += 1;
                        warn!(
                            "[belief:intake] {} candidate {} rejected: {}",
                            candidate.origin, candidate.id, e
                        );
                    }
                }
            }
            CandidateKind::Revision { belief_id, params } => {
                let profile = match repo.read(belief_id) {
                    Ok(belief) => profiles.resolve_for_key(&belief.key),
                    Err(_) => profiles.resolve(None),
                };
                match repo.revise(belief_id, params, &profile) {
                    Ok(_) => report.revised += 1,
                    Err(e) => {
                        report.rejected += 1;
                        if e.is_update_rejection() {
                            events.record_update_failure(belief_id, &e);
                        }
                        warn!(
                            "[belief:intake] revision {} of {} rejected: {}",
                            candidate.id, belief_id, e
                        );
                    }
                }
            }
        }
    }
    report
}

// ── Drain job ────────────────────────────────────────────────────────────────

/// Standing sleep-tier job that applies queued candidates in batches, with a
/// yield checkpoint between batches.
pub struct IntakeDrainWork {
    pub intake: CandidateIntake,
    pub resolver: Arc<ContextResolver>,
    pub repo: Arc<BeliefRepository>,
    pub profiles: Arc<RwLock<ProfileStore>>,
    pub events: Arc<EventLog>,
    pub batch: usize,
}

#[async_trait]
impl BatchWork for IntakeDrainWork {
    async fn run_slice(&self, yield_flag: &YieldFlag) -> CoreResult<SliceOutcome> {
        let mut total = IntakeReport::default();
        loop {
            if yield_flag.is_requested() {
                info!(
                    "[belief:intake] drain yielded after {} candidates ({} pending)",
                    total.drained,
                    self.intake.pending_count()
                );
                return Ok(SliceOutcome::Yielded);
            }
            let report = {
                let profiles = self.profiles.read();
                apply_candidates(
                    &self.intake,
                    &self.resolver,
                    &self.repo,
                    &profiles,
                    &self.events,
                    self.batch,
                )
            };
            if report.drained == 0 {
                break;
            }
            total.drained += report.drained;
            total.created += report.created;
            total.updated += report.updated;
            total.forked += report.forked;
            total.revised += report.revised;
            total.rejected += report.rejected;
        }
        if total.drained > 0 {
            info!(
                "[belief:intake] drained {} candidates: {} created, {} updated, {} forked, {} revised, {} rejected",
                total.drained, total.created, total.updated, total.forked, total.revised, total.rejected
            );
        }
        Ok(SliceOutcome::Completed)
    }
}

/// Build the standing drain job for the scheduler's sleep tier.
pub fn drain_job(
    intake: CandidateIntake,
    resolver: Arc<ContextResolver>,
    repo: Arc<BeliefRepository>,
    profiles: Arc<RwLock<ProfileStore>>,
    events: Arc<EventLog>,
    cfg: &IntakeConfig,
) -> BatchJob {
    let batch = cfg.drain_batch;
    BatchJob::new(
        "candidate-drain",
        Tier::Sleep,
        PriorityClass::Learning,
        DRAIN_COST_EST_SECS,
        Arc::new(IntakeDrainWork {
            intake,
            resolver,
            repo,
            profiles,
            events,
            batch,
        }),
    )
    .recurring(cfg.drain_interval_secs)
}
