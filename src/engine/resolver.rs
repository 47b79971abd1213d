// ── Context Resolver ─────────────────────────────────────────────────────────
// Decides where each observation lands: update the matching belief, fork a
// context-split child, or create a fresh belief. Matching is delegated to an
// injected ContextMatcher so embedders can swap in semantic similarity later;
// the fork policy itself is fixed — only divergence on a context-defining key
// splits a belief. Differing non-defining tags blend into the best variant.

use crate::atoms::error::{CoreError, CoreResult};
use crate::atoms::profile::LearningProfile;
use crate::atoms::types::{Belief, BeliefTarget, ContextTag, Observation, UpdatedBelief};
use crate::engine::observability::EventLog;
use crate::engine::repository::BeliefRepository;
use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

// ── Matching strategy ────────────────────────────────────────────────────────

/// Pluggable context equivalence. The baseline is exact tag matching;
/// embedders may inject embedding-based matchers without touching the
/// resolution policy.
pub trait ContextMatcher: Send + Sync {
    /// True when the two context descriptors denote the same context.
    fn matches(&self, a: &[ContextTag], b: &[ContextTag]) -> bool;
}

/// Baseline policy: contexts match only when their key/value pairs are equal.
/// Tag order and the defining flag do not participate in equality; keys are
/// unique within a descriptor by contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactTagMatcher;

impl ContextMatcher for ExactTagMatcher {
    fn matches(&self, a: &[ContextTag], b: &[ContextTag]) -> bool {
        a.len() == b.len()
            && a.iter()
                .all(|t| b.iter().any(|u| u.key == t.key && u.value == t.value))
    }
}

/// A defining divergence is a context-defining tag on either side with no
/// exact (key, value) counterpart on the other.
fn defining_divergence(a: &[ContextTag], b: &[ContextTag]) -> bool {
    let diverges = |from: &[ContextTag], to: &[ContextTag]| {
        from.iter()
            .filter(|t| t.context_defining)
            .any(|t| !to.iter().any(|u| u.key == t.key && u.value == t.value))
    };
    diverges(a, b) || diverges(b, a)
}

/// Shared (key, value) pairs between two descriptors.
fn overlap(a: &[ContextTag], b: &[ContextTag]) -> usize {
    a.iter()
        .filter(|t| b.iter().any(|u| u.key == t.key && u.value == t.value))
        .count()
}

// ── Resolution outcomes ──────────────────────────────────────────────────────

/// Where one observation ended up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    /// Evidence absorbed by an existing belief.
    Matched { updated: UpdatedBelief },
    /// Context diverged on a defining key: a new variant split from `parent`.
    Forked { parent: Uuid, updated: UpdatedBelief },
    /// First observation for this pattern key.
    Created { updated: UpdatedBelief },
}

impl Resolution {
    pub fn belief_id(&self) -> Uuid {
        self.updated().id
    }

    pub fn updated(&self) -> &UpdatedBelief {
        match self {
            Resolution::Matched { updated }
            | Resolution::Forked { updated, .. }
            | Resolution::Created { updated } => updated,
        }
    }
}

// ── Resolver ─────────────────────────────────────────────────────────────────

pub struct ContextResolver {
    repo: Arc<BeliefRepository>,
    events: Arc<EventLog>,
    matcher: Box<dyn ContextMatcher>,
}

impl ContextResolver {
    pub fn new(repo: Arc<BeliefRepository>, events: Arc<EventLog>) -> Self {
        Self::with_matcher(repo, events, Box::new(ExactTagMatcher))
    }

    pub fn with_matcher(
        repo: Arc<BeliefRepository>,
        events: Arc<EventLog>,
        matcher: Box<dyn ContextMatcher>,
    ) -> Self {
        ContextResolver {
            repo,
            events,
            matcher,
        }
    }

    /// Land one observation. Id-addressed observations update directly;
    /// key-addressed ones walk the variant set for the key and pick
    /// update / fork / create.
    pub fn resolve(
        &self,
        observation: &Observation,
        profile: &LearningProfile,
    ) -> CoreResult<Resolution> {
        match &observation.target {
            BeliefTarget::Existing { id } => self
                .guarded_update(*id, observation, profile)
                .map(|updated| Resolution::Matched { updated }),
            BeliefTarget::Key { key } => self.resolve_by_key(key, observation, profile),
        }
    }

    fn resolve_by_key(
        &self,
        key: &str,
        observation: &Observation,
        profile: &LearningProfile,
    ) -> CoreResult<Resolution> {
        let variants = self.variants_of(key);
        if variants.is_empty() {
            let updated = self.repo.create(observation, None, profile)?;
            debug!("[belief:resolver] created belief {} for new key '{}'", updated.id, key);
            return Ok(Resolution::Created { updated });
        }

        // Best variant: compatible (no defining divergence) beats divergent,
        // then most shared (key, value) pairs, then longest-lived. A fork can
        // only happen when every variant diverges on a defining key.
        let best = variants
            .iter()
            .max_by_key(|b| {
                (
                    usize::from(!defining_divergence(&observation.context, &b.context_tags)),
                    overlap(&observation.context, &b.context_tags),
                    std::cmp::Reverse(b.created_at),
                )
            })
            .ok_or_else(|| CoreError::config("variant set vanished mid-resolve"))?;

        if self.matcher.matches(&observation.context, &best.context_tags) {
            let updated = self.guarded_update(best.id, observation, profile)?;
            return Ok(Resolution::Matched { updated });
        }

        if defining_divergence(&observation.context, &best.context_tags) {
            let updated = match self.repo.fork(best.id, observation, profile) {
                Ok(updated) => updated,
                Err(e) => {
                    if e.is_update_rejection() {
                        self.events.record_update_failure(best.id, &e);
                    }
                    return Err(e);
                }
            };
            info!(
                "[belief:resolver] forked '{}' into {} on defining context divergence",
                key, updated.id
            );
            return Ok(Resolution::Forked {
                parent: best.id,
                updated,
            });
        }

        // Non-defining variation: same pattern, blended in place.
        let updated = self.guarded_update(best.id, observation, profile)?;
        Ok(Resolution::Matched { updated })
    }

    /// Update with failure-streak bookkeeping: rejections count toward the
    /// belief's needs-attention streak, successes clear it.
    fn guarded_update(
        &self,
        id: Uuid,
        observation: &Observation,
        profile: &LearningProfile,
    ) -> CoreResult<UpdatedBelief> {
        match self.repo.update(id, observation, profile) {
            Ok(updated) => {
                self.events.clear_failure_streak(id);
                Ok(updated)
            }
            Err(e) => {
                if e.is_update_rejection() {
                    self.events.record_update_failure(id, &e);
                }
                Err(e)
            }
        }
    }

    fn variants_of(&self, key: &str) -> Vec<Belief> {
        self.repo
            .find_by_key(key)
            .into_iter()
            .filter_map(|id| self.repo.read(id).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::Evidence;
    use crate::engine::observability::{CoreEvent, ATTENTION_STREAK};

    fn make_resolver() -> (ContextResolver, Arc<BeliefRepository>, Arc<EventLog>) {
        let repo = Arc::new(BeliefRepository::new());
        let events = Arc::new(EventLog::new());
        let resolver = ContextResolver::new(Arc::clone(&repo), Arc::clone(&events));
        (resolver, repo, events)
    }

    fn prod_context() -> Vec<ContextTag> {
        vec![
            ContextTag::defining("env", "prod"),
            ContextTag::new("region", "eu"),
        ]
    }

    #[test]
    fn test_first_observation_creates() {
        let (resolver, repo, _) = make_resolver();
        let profile = LearningProfile::default();
        let resolution = resolver
            .resolve(&Observation::new("deploy/ok", Evidence::success()), &profile)
            .unwrap();
        assert!(matches!(resolution, Resolution::Created { .. }));
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_matching_context_updates_in_place() {
        let (resolver, repo, _) = make_resolver();
        let profile = LearningProfile::default();
        let obs = |evidence| {
            Observation::new("deploy/ok", evidence).with_context(prod_context())
        };

        let first = resolver.resolve(&obs(Evidence::success()), &profile).unwrap();
        let second = resolver.resolve(&obs(Evidence::failure()), &profile).unwrap();

        assert!(matches!(second, Resolution::Matched { .. }));
        assert_eq!(first.belief_id(), second.belief_id());
        assert_eq!(repo.len(), 1);
        assert_eq!(second.updated().observation_count, 2);
    }

    #[test]
    fn test_defining_divergence_forks() {
        let (resolver, repo, _) = make_resolver();
        let profile = LearningProfile::default();

        let prod = Observation::new("deploy/ok", Evidence::success()).with_context(prod_context());
        let parent = resolver.resolve(&prod, &profile).unwrap();

        let staging = Observation::new("deploy/ok", Evidence::failure())
            .with_context(vec![
                ContextTag::defining("env", "staging"),
                ContextTag::new("region", "eu"),
            ]);
        let forked = resolver.resolve(&staging, &profile).unwrap();

        match &forked {
            Resolution::Forked { parent: p, updated } => {
                assert_eq!(*p, parent.belief_id());
                assert_ne!(updated.id, parent.belief_id());
            }
            other => panic!("expected fork, got {:?}", other),
        }
        assert_eq!(repo.len(), 2);
        assert_eq!(
            repo.read(forked.belief_id()).unwrap().parent_id,
            Some(parent.belief_id())
        );

        // Later prod observations still land on the original variant.
        let again = resolver.resolve(&prod, &profile).unwrap();
        assert_eq!(again.belief_id(), parent.belief_id());
    }

    #[test]
    fn test_non_defining_variation_blends() {
        let (resolver, repo, _) = make_resolver();
        let profile = LearningProfile::default();

        let eu = Observation::new("deploy/ok", Evidence::success()).with_context(prod_context());
        let first = resolver.resolve(&eu, &profile).unwrap();

        // Same defining env, different non-defining region: no fork.
        let us = Observation::new("deploy/ok", Evidence::success()).with_context(vec![
            ContextTag::defining("env", "prod"),
            ContextTag::new("region", "us"),
        ]);
        let second = resolver.resolve(&us, &profile).unwrap();

        assert!(matches!(second, Resolution::Matched { .. }));
        assert_eq!(second.belief_id(), first.belief_id());
        assert_eq!(repo.len(), 1);
    }

    #[test]
    fn test_fork_lands_on_closest_variant() {
        let (resolver, repo, _) = make_resolver();
        let profile = LearningProfile::default();

        let prod = Observation::new("deploy/ok", Evidence::success()).with_context(prod_context());
        let prod_id = resolver.resolve(&prod, &profile).unwrap().belief_id();

        let staging = Observation::new("deploy/ok", Evidence::success()).with_context(vec![
            ContextTag::defining("env", "staging"),
            ContextTag::new("region", "eu"),
        ]);
        let staging_id = resolver.resolve(&staging, &profile).unwrap().belief_id();
        assert_eq!(repo.len(), 2);

        // A staging observation with a new non-defining tag should update the
        // staging variant, not fork off prod.
        let staging_us = Observation::new("deploy/ok", Evidence::success()).with_context(vec![
            ContextTag::defining("env", "staging"),
            ContextTag::new("region", "us"),
        ]);
        let landed = resolver.resolve(&staging_us, &profile).unwrap();
        assert_eq!(landed.belief_id(), staging_id);
        assert_ne!(landed.belief_id(), prod_id);
        assert_eq!(repo.len(), 2);
    }

    #[test]
    fn test_repeated_rejections_raise_attention_event() {
        let (resolver, _, events) = make_resolver();
        let profile = LearningProfile::default();

        let created = resolver
            .resolve(&Observation::new("k", Evidence::success()), &profile)
            .unwrap();
        let bad = Observation::for_belief(created.belief_id(), Evidence::value(1.0));

        for _ in 0..ATTENTION_STREAK {
            assert!(resolver.resolve(&bad, &profile).is_err());
        }
        assert!(events
            .recent(16)
            .iter()
            .any(|r| matches!(r.event, CoreEvent::BeliefNeedsAttention { .. })));

        // A good observation ends the streak.
        let good = Observation::for_belief(created.belief_id(), Evidence::success());
        resolver.resolve(&good, &profile).unwrap();
        assert_eq!(events.failure_streak(created.belief_id()), 0);
    }

    #[test]
    fn test_injected_matcher_is_honored() {
        struct AlwaysMatches;
        impl ContextMatcher for AlwaysMatches {
            fn matches(&self, _: &[ContextTag], _: &[ContextTag]) -> bool {
                true
            }
        }

        let repo = Arc::new(BeliefRepository::new());
        let events = Arc::new(EventLog::new());
        let resolver =
            ContextResolver::with_matcher(Arc::clone(&repo), events, Box::new(AlwaysMatches));
        let profile = LearningProfile::default();

        let prod = Observation::new("k", Evidence::success()).with_context(prod_context());
        resolver.resolve(&prod, &profile).unwrap();

        // Even a defining divergence is matched away by the injected policy.
        let staging = Observation::new("k", Evidence::success())
            .with_context(vec![ContextTag::defining("env", "staging")]);
        let resolution = resolver.resolve(&staging, &profile).unwrap();
        assert!(matches!(resolution, Resolution::Matched { .. }));
        assert_eq!(repo.len(), 1);
    }
}
