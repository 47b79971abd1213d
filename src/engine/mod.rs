// ── Credence Engine Layer ────────────────────────────────────────────────────
// Stateful machinery over the atoms: locked storage, conjugate math, context
// resolution, decision routing, staleness, scheduling, intake, meta-learning.
// Modules own their locks; no lock is ever held across an await point.

pub mod intake;
pub mod meta;
pub mod models;
pub mod observability;
pub mod repository;
pub mod resolver;
pub mod router;
pub mod scheduler;
pub mod staleness;

use crate::atoms::error::CoreResult;
use serde::{Deserialize, Serialize};

/// Top-level configuration. Every section is optional in serialized form and
/// falls back to its defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub staleness: staleness::StalenessConfig,
    #[serde(default)]
    pub router: router::RouterConfig,
    #[serde(default)]
    pub scheduler: scheduler::SchedulerConfig,
    #[serde(default)]
    pub intake: intake::IntakeConfig,
}

impl CoreConfig {
    pub fn validate(&self) -> CoreResult<()> {
        self.staleness.validate()?;
        self.router.validate()?;
        self.scheduler.validate()?;
        self.intake.validate()?;
        Ok(())
    }
}
