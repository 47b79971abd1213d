// ── Belief Repository ────────────────────────────────────────────────────────
// The single shared mutable resource of the core. Every parameter mutation
// funnels through the absorb/revise contract below, so a commit is always
// all-or-nothing: validation failures leave the stored belief untouched.
//
// Locking: one RwLock over the index maps, one Mutex per belief. Updates to
// the same id serialize behind its mutex; updates to different ids proceed
// independently. No path ever holds two belief locks at once.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::profile::LearningProfile;
use crate::atoms::types::{
    Belief, BeliefEdge, BeliefSnapshot, BeliefTarget, CredibleInterval, ExpectedPeriod, ModelKind,
    ModelParams, Observation, UpdatedBelief,
};
use crate::engine::models;
use crate::engine::observability::{CoreEvent, EventLog};
use crate::engine::staleness;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Default)]
struct Shelves {
    by_id: HashMap<Uuid, Arc<Mutex<Belief>>>,
    by_key: HashMap<String, Vec<Uuid>>,
}

/// Versioned in-memory store of beliefs.
pub struct BeliefRepository {
    shelves: RwLock<Shelves>,
    events: Option<Arc<EventLog>>,
}

impl Default for BeliefRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl BeliefRepository {
    pub fn new() -> Self {
        BeliefRepository {
            shelves: RwLock::new(Shelves::default()),
            events: None,
        }
    }

    /// Store that records forced corrections (reset, remove) to an event log.
    pub fn with_events(events: Arc<EventLog>) -> Self {
        BeliefRepository {
            shelves: RwLock::new(Shelves::default()),
            events: Some(events),
        }
    }

    // ── Creation ────────────────────────────────────────────────────────────

    /// Create a belief from its first observation. The model kind comes from
    /// the evidence shape unless `kind_override` pins it; a pinned kind must
    /// still be able to absorb the creating evidence.
    pub fn create(
        &self,
        observation: &Observation,
        kind_override: Option<ModelKind>,
        profile: &LearningProfile,
    ) -> CoreResult<UpdatedBelief> {
        let key = observation
            .key()
            .ok_or_else(|| CoreError::config("create requires a key-addressed observation"))?;
        observation.evidence.validate()?;

        let implied = observation.evidence.implied_kind();
        let kind = match kind_override {
            Some(k) if k != implied => {
                return Err(CoreError::invalid_override(k.to_string(), implied.to_string()));
            }
            Some(k) => k,
            None => implied,
        };

        let seed = models::seed_params(kind, &observation.evidence, profile.prior_strength.scale())?;
        let mut belief = Belief {
            id: Uuid::new_v4(),
            key: key.to_string(),
            params: seed,
            observation_count: 0,
            version: 0,
            created_at: observation.at,
            last_observed: observation.at,
            context_tags: observation.context.clone(),
            expected_period: None,
            model_override: kind_override.is_some(),
            parent_id: None,
            needs_verify: false,
            edges: Vec::new(),
            source: observation.source.clone(),
        };
        let report = Self::absorb(&mut belief, observation, profile)?;
        debug!(
            "[belief:repo] created {} for key '{}' ({} model)",
            belief.id, belief.key, kind
        );
        self.insert(belief);
        Ok(report)
    }

    /// Split a context variant off an existing belief. The child inherits the
    /// parent's posterior mean at reset evidential weight, absorbs the
    /// triggering observation, and records its lineage in `parent_id`.
    pub fn fork(
        &self,
        parent_id: Uuid,
        observation: &Observation,
        profile: &LearningProfile,
    ) -> CoreResult<UpdatedBelief> {
        let parent_cell = self.cell(parent_id)?;
        let (key, seed, expected_period, model_override) = {
            let parent = parent_cell.lock();
            (
                parent.key.clone(),
                models::reseed_from_parent(&parent.params, profile.prior_strength.scale()),
                parent.expected_period,
                parent.model_override,
            )
        };

        let mut child = Belief {
            id: Uuid::new_v4(),
            key,
            params: seed,
            observation_count: 0,
            version: 0,
            created_at: observation.at,
            last_observed: observation.at,
            context_tags: observation.context.clone(),
            expected_period,
            model_override,
            parent_id: Some(parent_id),
            needs_verify: false,
            edges: Vec::new(),
            source: observation.source.clone(),
        };
        let report = Self::absorb(&mut child, observation, profile)?;
        info!(
            "[belief:repo] forked {} from {} for key '{}'",
            child.id, parent_id, child.key
        );
        self.insert(child);
        Ok(report)
    }

    // ── Updates ─────────────────────────────────────────────────────────────

    /// Absorb one observation into an existing belief.
    pub fn update(
        &self,
        id: Uuid,
        observation: &Observation,
        profile: &LearningProfile,
    ) -> CoreResult<UpdatedBelief> {
        let cell = self.cell(id)?;
        let mut belief = cell.lock();
        Self::absorb(&mut belief, observation, profile)
    }

    /// Move a belief's parameters toward an externally proposed state
    /// (consolidation revisions). A revision is not evidence: it goes through
    /// the same learning-rate / cap / positivity gauntlet as an update, but
    /// leaves `observation_count` and `last_observed` alone.
    pub fn revise(
        &self,
        id: Uuid,
        proposed: ModelParams,
        profile: &LearningProfile,
    ) -> CoreResult<UpdatedBelief> {
        let cell = self.cell(id)?;
        let mut belief = cell.lock();
        if proposed.kind() != belief.kind() {
            return Err(CoreError::invalid_override(
                proposed.kind().to_string(),
                belief.kind().to_string(),
            ));
        }
        let (candidate, clamped) = models::apply_step(
            &belief.params,
            &proposed,
            profile.learning_rate,
            profile.movement_cap(),
        );
        if let Some((parameter, value)) = candidate.positivity_violation() {
            return Err(CoreError::degenerate(belief.id, parameter, value));
        }
        belief.params = candidate;
        belief.version += 1;
        debug!("[belief:repo] revised {} to v{}", belief.id, belief.version);
        Ok(Self::report(&belief, clamped))
    }

    /// Replace a belief's parameters outright. User-initiated correction;
    /// still refuses degenerate or cross-family parameters.
    pub fn reset(&self, id: Uuid, params: ModelParams) -> CoreResult<()> {
        let cell = self.cell(id)?;
        let mut belief = cell.lock();
        if params.kind() != belief.kind() {
            return Err(CoreError::invalid_override(
                params.kind().to_string(),
                belief.kind().to_string(),
            ));
        }
        if let Some((parameter, value)) = params.positivity_violation() {
            return Err(CoreError::degenerate(belief.id, parameter, value));
        }
        belief.params = params;
        belief.version += 1;
        belief.needs_verify = false;
        warn!("[belief:repo] forced reset of {} ({})", belief.id, belief.key);
        if let Some(events) = &self.events {
            events.record(CoreEvent::BeliefReset { belief: id });
            events.clear_failure_streak(id);
        }
        Ok(())
    }

    /// Drop a belief entirely, returning its final state.
    pub fn remove(&self, id: Uuid) -> CoreResult<Belief> {
        let mut shelves = self.shelves.write();
        let cell = shelves.by_id.remove(&id).ok_or(CoreError::NotFound(id))?;
        let belief = cell.lock().clone();
        if let Some(ids) = shelves.by_key.get_mut(&belief.key) {
            ids.retain(|x| *x != id);
            if ids.is_empty() {
                shelves.by_key.remove(&belief.key);
            }
        }
        warn!("[belief:repo] removed {} ({})", id, belief.key);
        if let Some(events) = &self.events {
            events.record(CoreEvent::BeliefRemoved { belief: id });
            events.clear_failure_streak(id);
        }
        Ok(belief)
    }

    // ── Declarations and bookkeeping ────────────────────────────────────────

    /// Declare (or replace) the expected observation cadence.
    pub fn set_expected_period(&self, id: Uuid, period: ExpectedPeriod) -> CoreResult<()> {
        if !(period.period_secs.is_finite()
            && period.std_dev_secs.is_finite()
            && period.period_secs >= 0.0
            && period.std_dev_secs >= 0.0)
        {
            return Err(CoreError::config("expected period must be finite and non-negative"));
        }
        let cell = self.cell(id)?;
        cell.lock().expected_period = Some(period);
        Ok(())
    }

    /// Record a typed edge to another belief. Duplicate edges are ignored.
    pub fn add_edge(&self, id: Uuid, edge: BeliefEdge) -> CoreResult<()> {
        let cell = self.cell(id)?;
        let mut belief = cell.lock();
        if !belief.edges.contains(&edge) {
            belief.edges.push(edge);
        }
        Ok(())
    }

    /// Set or clear the verify flag. Used by the staleness sweep.
    pub fn mark_verify(&self, id: Uuid, flag: bool) -> CoreResult<()> {
        let cell = self.cell(id)?;
        cell.lock().needs_verify = flag;
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// Owned copy of the stored belief.
    pub fn read(&self, id: Uuid) -> CoreResult<Belief> {
        let cell = self.cell(id)?;
        let belief = cell.lock();
        Ok(belief.clone())
    }

    /// Posterior mean plus the staleness-discounted credible interval. An
    /// overdue belief answers wider than a fresh one with the same
    /// parameters.
    pub fn mean_and_confidence(&self, id: Uuid) -> CoreResult<(f64, CredibleInterval)> {
        let cell = self.cell(id)?;
        let belief = cell.lock();
        let (_, _, weight) = staleness::assess(&belief, Utc::now());
        Ok((
            models::mean(&belief.params),
            models::discounted_interval(&belief.params, models::DEFAULT_INTERVAL_LEVEL, weight),
        ))
    }

    pub fn snapshot(&self, id: Uuid) -> CoreResult<BeliefSnapshot> {
        self.snapshot_at(id, Utc::now())
    }

    /// Snapshot with staleness evaluated at an explicit instant.
    pub fn snapshot_at(&self, id: Uuid, now: DateTime<Utc>) -> CoreResult<BeliefSnapshot> {
        let cell = self.cell(id)?;
        let belief = cell.lock();
        Ok(Self::build_snapshot(&belief, now))
    }

    pub fn snapshot_all(&self) -> Vec<BeliefSnapshot> {
        self.snapshot_all_at(Utc::now())
    }

    pub fn snapshot_all_at(&self, now: DateTime<Utc>) -> Vec<BeliefSnapshot> {
        let cells: Vec<Arc<Mutex<Belief>>> =
            self.shelves.read().by_id.values().cloned().collect();
        cells
            .iter()
            .map(|cell| Self::build_snapshot(&cell.lock(), now))
            .collect()
    }

    /// Ids of every context variant stored under a pattern key.
    pub fn find_by_key(&self, key: &str) -> Vec<Uuid> {
        self.shelves
            .read()
            .by_key
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.shelves.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn cell(&self, id: Uuid) -> CoreResult<Arc<Mutex<Belief>>> {
        self.shelves
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound(id))
    }

    fn insert(&self, belief: Belief) {
        let mut shelves = self.shelves.write();
        shelves
            .by_key
            .entry(belief.key.clone())
            .or_default()
            .push(belief.id);
        shelves.by_id.insert(belief.id, Arc::new(Mutex::new(belief)));
    }

    /// The one commit path for evidence. Validates shape and positivity
    /// before touching the belief, so a rejection changes nothing.
    fn absorb(
        belief: &mut Belief,
        observation: &Observation,
        profile: &LearningProfile,
    ) -> CoreResult<UpdatedBelief> {
        observation.evidence.validate()?;
        if observation.evidence.implied_kind() != belief.kind() {
            return Err(CoreError::invalid_shape(format!(
                "{} evidence cannot update {} belief {}",
                observation.evidence.implied_kind(),
                belief.kind(),
                belief.id
            )));
        }

        let target = models::posterior(&belief.params, &observation.evidence)?;
        let (candidate, clamped) = models::apply_step(
            &belief.params,
            &target,
            profile.learning_rate,
            profile.movement_cap(),
        );
        if let Some((parameter, value)) = candidate.positivity_violation() {
            return Err(CoreError::degenerate(belief.id, parameter, value));
        }

        belief.params = candidate;
        belief.observation_count = belief
            .observation_count
            .saturating_add(observation.evidence.sample_size());
        belief.version += 1;
        // Out-of-order evidence never moves the freshness marker backwards.
        if observation.at > belief.last_observed {
            belief.last_observed = observation.at;
        }
        belief.needs_verify = false;
        if clamped {
            warn!(
                "[belief:repo] regularization clamped movement for {} at v{}",
                belief.id, belief.version
            );
        }
        Ok(Self::report(belief, clamped))
    }

    fn report(belief: &Belief, clamped: bool) -> UpdatedBelief {
        let (_, _, weight) = staleness::assess(belief, Utc::now());
        UpdatedBelief {
            id: belief.id,
            params: belief.params,
            mean: models::mean(&belief.params),
            confidence: models::confidence(&belief.params, weight),
            observation_count: belief.observation_count,
            version: belief.version,
            clamped,
        }
    }

    fn build_snapshot(belief: &Belief, now: DateTime<Utc>) -> BeliefSnapshot {
        let (staleness_score, band, weight) = staleness::assess(belief, now);
        BeliefSnapshot {
            id: belief.id,
            key: belief.key.clone(),
            model: belief.kind(),
            mean: models::mean(&belief.params),
            interval: models::credible_interval(&belief.params, models::DEFAULT_INTERVAL_LEVEL),
            confidence: models::confidence(&belief.params, weight),
            observation_count: belief.observation_count,
            version: belief.version,
            staleness: staleness_score,
            band,
            last_observed: belief.last_observed,
            context_tags: belief.context_tags.clone(),
            parent_id: belief.parent_id,
            needs_verify: belief.needs_verify,
        }
    }
}

/// Convenience for updates addressed by `BeliefTarget::Existing`.
impl BeliefRepository {
    /// Route a pre-addressed observation. Key-addressed observations belong
    /// to the resolver, which owns the update/fork/create decision.
    pub fn apply(
        &self,
        observation: &Observation,
        profile: &LearningProfile,
    ) -> CoreResult<UpdatedBelief> {
        match &observation.target {
            BeliefTarget::Existing { id } => self.update(*id, observation, profile),
            BeliefTarget::Key { key } => Err(CoreError::config(format!(
                "key-addressed observation '{}' must go through the resolver",
                key
            ))),
        }
    }
}
