//! # Credence Core
//!
//! `credence-core` is a belief store with dual-process decision routing.
//! Observations flow through a context resolver into conjugate Bayesian
//! models (Beta-Binomial, Normal-Gamma, Gamma-Poisson); confidence is always
//! derived from evidence mass and staleness, never stored. A tiered
//! scheduler runs maintenance and sleep-time learning under daily budgets,
//! and an escalation router decides when stored beliefs may answer directly
//! versus when a situation must be handed to slower deliberation.

pub mod atoms;
pub mod engine;

pub use atoms::error::{CoreError, CoreResult};
pub use atoms::profile::{
    domain_of, LearningProfile, PriorStrength, ProfileOverride, ProfileStore, SelfTuning,
    TuningBounds,
};
pub use atoms::types::{
    Belief, BeliefEdge, BeliefSnapshot, BeliefTarget, ContextTag, CredibleInterval, EdgeKind,
    Evidence, ExpectedPeriod, ModelKind, ModelParams, Observation, StalenessBand, UpdatedBelief,
};

pub use engine::intake::{
    apply_candidates, drain_job, CandidateIntake, CandidateKind, CandidateOrigin,
    CandidateSubmission, IntakeConfig, IntakeReport,
};
pub use engine::meta::{MetaLearner, ProposalStatus, TuningMetrics, TuningProposal};
pub use engine::models::{
    confidence, credible_interval, discounted_interval, effective_sample_size, mean, variance,
};
pub use engine::observability::{CoreEvent, EventLog, EventRecord};
pub use engine::repository::BeliefRepository;
pub use engine::resolver::{ContextMatcher, ContextResolver, ExactTagMatcher, Resolution};
pub use engine::router::{
    Decision, EscalationReason, EscalationRouter, HeuristicVote, RouteDecision, RouterConfig,
    SituationFingerprint, StakesClass,
};
pub use engine::scheduler::{
    BatchJob, BatchWork, BudgetSnapshot, BudgetState, LoadSample, LoadSampler, PriorityClass,
    RunReport, SchedulerConfig, SliceOutcome, TickReport, Tier, TieredScheduler, YieldFlag,
};
pub use engine::staleness::{run_staleness_sweep, sweep_job, StalenessConfig, SweepReport};
pub use engine::CoreConfig;
