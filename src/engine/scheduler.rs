// ── Tiered Scheduler ─────────────────────────────────────────────────────────
// Online work never routes through here (it is the synchronous caller path);
// this schedules background- and sleep-tier batch jobs under per-day budget
// caps, gates the sleep tier behind idle/load/volume conditions, and preempts
// in-flight slices cooperatively through a shared yield flag.
//
// Split of responsibilities:
//   tick()        — synchronous state machine: day rollover, load sample,
//                   sleep-gate transitions, queued-job cancellation.
//   run_pending() — async dispatch: admission (gating + budget) and slice
//                   execution, at most max_slices_per_tick per round.
// The start() driver alternates the two on a fixed cadence.

use crate::atoms::error::{CoreError, CoreResult};
use crate::engine::observability::{CoreEvent, EventLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

// ── Constants ────────────────────────────────────────────────────────────────

/// Queued batch jobs before submit pushes back.
pub const MAX_QUEUED_JOBS: usize = 64;

/// Seconds in one budget day.
const DAY_SECS: f64 = 86_400.0;

// ── Tiers and priorities ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Synchronous belief reads/updates on the caller's thread. Never queued.
    Online,
    /// Bounded share of cycles during active use. Preemptible.
    Background,
    /// Heavy batch work, only while the sleep gate holds.
    Sleep,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Online => "online",
            Tier::Background => "background",
            Tier::Sleep => "sleep",
        };
        write!(f, "{}", s)
    }
}

/// Competition order when jobs contend: lower variants win. Learning-class
/// work is explicitly the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Realtime,
    Conversational,
    Comfort,
    Background,
    Learning,
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PriorityClass::Realtime => "realtime",
            PriorityClass::Conversational => "conversational",
            PriorityClass::Comfort => "comfort",
            PriorityClass::Background => "background",
            PriorityClass::Learning => "learning",
        };
        write!(f, "{}", s)
    }
}

// ── Cooperative preemption ───────────────────────────────────────────────────

/// Shared flag between the scheduler and in-flight job slices. Jobs check it
/// at their checkpoints and return Yielded without dropping work.
#[derive(Clone)]
pub struct YieldFlag(Arc<AtomicBool>);

impl YieldFlag {
    pub fn new() -> Self {
        YieldFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Default for YieldFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one checkpointed slice of batch work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// All work done. A recurring job re-queues for its next run.
    Completed,
    /// Yielded at a checkpoint with work remaining; the job stays queued.
    Yielded,
}

/// Checkpointed batch work. Implementations must watch the yield flag
/// between work units and return Yielded promptly once it sets.
#[async_trait]
pub trait BatchWork: Send + Sync {
    async fn run_slice(&self, yield_flag: &YieldFlag) -> CoreResult<SliceOutcome>;
}

/// A schedulable unit of background or sleep work.
pub struct BatchJob {
    pub id: Uuid,
    pub name: String,
    pub tier: Tier,
    pub priority: PriorityClass,
    /// Runtime estimate used for budget admission.
    pub estimated_cost_secs: f64,
    /// Re-queue this many seconds after each completion.
    pub recur_secs: Option<u64>,
    /// Earliest dispatch time; None means immediately.
    pub not_before: Option<DateTime<Utc>>,
    pub work: Arc<dyn BatchWork>,
}

impl BatchJob {
    pub fn new(
        name: impl Into<String>,
        tier: Tier,
        priority: PriorityClass,
        estimated_cost_secs: f64,
        work: Arc<dyn BatchWork>,
    ) -> Self {
        BatchJob {
            id: Uuid::new_v4(),
            name: name.into(),
            tier,
            priority,
            estimated_cost_secs,
            recur_secs: None,
            not_before: None,
            work,
        }
    }

    pub fn recurring(mut self, every_secs: u64) -> Self {
        self.recur_secs = Some(every_secs);
        self
    }
}

// ── Budget state ─────────────────────────────────────────────────────────────

/// Per-tier ledger for one UTC day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TierLedger {
    /// Share of the day this tier may consume, in percent.
    pub cap_pct: f64,
    pub consumed_secs: f64,
}

impl TierLedger {
    fn new(cap_pct: f64) -> Self {
        TierLedger {
            cap_pct,
            consumed_secs: 0.0,
        }
    }

    pub fn cap_secs(&self) -> f64 {
        self.cap_pct / 100.0 * DAY_SECS
    }

    pub fn remaining_secs(&self) -> f64 {
        (self.cap_secs() - self.consumed_secs).max(0.0)
    }
}

struct BudgetInner {
    day: String,
    online: TierLedger,
    background: TierLedger,
    sleep: TierLedger,
    idle_secs: f64,
    load: f64,
    pending_volume: u64,
    sleep_active: bool,
    learning_consumed_secs: f64,
    learning_daily_min_secs: f64,
}

/// Read view of the budget state, exported for the router and observers.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub day: String,
    pub online: TierLedger,
    pub background: TierLedger,
    pub sleep: TierLedger,
    pub idle_secs: f64,
    pub load: f64,
    pub pending_volume: u64,
    pub sleep_active: bool,
    pub learning_consumed_secs: f64,
}

struct DayRoll {
    date: String,
    consumed_secs: f64,
    required_secs: f64,
    shortfall: bool,
}

/// Process-wide budget and gating state. Written only by the scheduler;
/// everyone else (the escalation router included) reads snapshots.
pub struct BudgetState {
    inner: Mutex<BudgetInner>,
}

impl BudgetState {
    fn new(cfg: &SchedulerConfig) -> Self {
        BudgetState {
            inner: Mutex::new(BudgetInner {
                day: Utc::now().format("%Y-%m-%d").to_string(),
                online: TierLedger::new(cfg.online_cap_pct),
                background: TierLedger::new(cfg.background_cap_pct),
                sleep: TierLedger::new(cfg.sleep_cap_pct),
                idle_secs: 0.0,
                load: 0.0,
                pending_volume: 0,
                sleep_active: false,
                learning_consumed_secs: 0.0,
                learning_daily_min_secs: cfg.learning_daily_min_secs,
            }),
        }
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let inner = self.inner.lock();
        BudgetSnapshot {
            day: inner.day.clone(),
            online: inner.online,
            background: inner.background,
            sleep: inner.sleep,
            idle_secs: inner.idle_secs,
            load: inner.load,
            pending_volume: inner.pending_volume,
            sleep_active: inner.sleep_active,
            learning_consumed_secs: inner.learning_consumed_secs,
        }
    }

    pub fn sleep_active(&self) -> bool {
        self.inner.lock().sleep_active
    }

    pub fn remaining_secs(&self, tier: Tier) -> f64 {
        let inner = self.inner.lock();
        match tier {
            Tier::Online => inner.online.remaining_secs(),
            Tier::Background => inner.background.remaining_secs(),
            Tier::Sleep => inner.sleep.remaining_secs(),
        }
    }

    fn charge(&self, tier: Tier, secs: f64, learning: bool) {
        let mut inner = self.inner.lock();
        let ledger = match tier {
            Tier::Online => &mut inner.online,
            Tier::Background => &mut inner.background,
            Tier::Sleep => &mut inner.sleep,
        };
        ledger.consumed_secs += secs;
        if learning {
            inner.learning_consumed_secs += secs;
        }
    }

    fn record_sample(&self, sample: &LoadSample) {
        let mut inner = self.inner.lock();
        inner.idle_secs = sample.idle_secs;
        inner.load = sample.load;
        inner.pending_volume = sample.pending_volume;
    }

    fn set_sleep_active(&self, active: bool) {
        self.inner.lock().sleep_active = active;
    }

    /// Reset ledgers when the UTC date changes, reporting the finished day.
    fn roll_day_if_needed(&self, now: DateTime<Utc>) -> Option<DayRoll> {
        let mut inner = self.inner.lock();
        let today = now.format("%Y-%m-%d").to_string();
        if inner.day == today {
            return None;
        }
        let roll = DayRoll {
            date: inner.day.clone(),
            consumed_secs: inner.learning_consumed_secs,
            required_secs: inner.learning_daily_min_secs,
            shortfall: inner.learning_consumed_secs < inner.learning_daily_min_secs,
        };
        inner.day = today;
        inner.online.consumed_secs = 0.0;
        inner.background.consumed_secs = 0.0;
        inner.sleep.consumed_secs = 0.0;
        inner.learning_consumed_secs = 0.0;
        Some(roll)
    }
}

// ── Load sampling ────────────────────────────────────────────────────────────

/// One reading of the conditions the sleep gate cares about. Embedders supply
/// these through a LoadSampler; tests construct them directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub now: DateTime<Utc>,
    /// Continuous idle time so far, seconds.
    pub idle_secs: f64,
    /// Normalized system load, 1.0 = fully busy.
    pub load: f64,
    /// Accumulated unprocessed volume (queued candidates, unmined episodes).
    pub pending_volume: u64,
}

impl LoadSample {
    pub fn new(idle_secs: f64, load: f64, pending_volume: u64) -> Self {
        LoadSample {
            now: Utc::now(),
            idle_secs,
            load,
            pending_volume,
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> LoadSample;
}

// ── Configuration ────────────────────────────────────────────────────────────

/// Scheduler tuning. Tier caps are percentages of wall-clock time per UTC day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Driver cadence, seconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Sleep gate: minimum continuous idle time.
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: f64,
    /// Sleep gate: system load ceiling.
    #[serde(default = "default_load_ceiling")]
    pub load_ceiling: f64,
    /// Sleep gate: minimum accumulated unprocessed volume.
    #[serde(default = "default_min_pending")]
    pub min_pending_volume: u64,
    #[serde(default = "default_online_cap")]
    pub online_cap_pct: f64,
    #[serde(default = "default_background_cap")]
    pub background_cap_pct: f64,
    #[serde(default = "default_sleep_cap")]
    pub sleep_cap_pct: f64,
    /// Best-effort daily minimum of learning-class work. A missed minimum is
    /// logged and surfaced as an event at day rollover, never forced.
    #[serde(default = "default_learning_min")]
    pub learning_daily_min_secs: f64,
    /// Job slices started per dispatch round.
    #[serde(default = "default_max_slices")]
    pub max_slices_per_tick: usize,
}

fn default_tick_interval() -> u64 {
    5
}
fn default_idle_threshold() -> f64 {
    300.0
}
fn default_load_ceiling() -> f64 {
    0.3
}
fn default_min_pending() -> u64 {
    25
}
fn default_online_cap() -> f64 {
    100.0
}
fn default_background_cap() -> f64 {
    10.0
}
fn default_sleep_cap() -> f64 {
    40.0
}
fn default_learning_min() -> f64 {
    600.0
}
fn default_max_slices() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            tick_interval_secs: default_tick_interval(),
            idle_threshold_secs: default_idle_threshold(),
            load_ceiling: default_load_ceiling(),
            min_pending_volume: default_min_pending(),
            online_cap_pct: default_online_cap(),
            background_cap_pct: default_background_cap(),
            sleep_cap_pct: default_sleep_cap(),
            learning_daily_min_secs: default_learning_min(),
            max_slices_per_tick: default_max_slices(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.tick_interval_secs == 0 {
            return Err(CoreError::config("tick_interval_secs must be positive"));
        }
        if self.max_slices_per_tick == 0 {
            return Err(CoreError::config("max_slices_per_tick must be positive"));
        }
        for (name, pct) in [
            ("online_cap_pct", self.online_cap_pct),
            ("background_cap_pct", self.background_cap_pct),
            ("sleep_cap_pct", self.sleep_cap_pct),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(CoreError::config(format!(
                    "{} must be in [0, 100], got {}",
                    name, pct
                )));
            }
        }
        if !(self.idle_threshold_secs.is_finite() && self.idle_threshold_secs >= 0.0) {
            return Err(CoreError::config("idle_threshold_secs must be finite and >= 0"));
        }
        if !(self.load_ceiling.is_finite() && self.load_ceiling >= 0.0) {
            return Err(CoreError::config("load_ceiling must be finite and >= 0"));
        }
        if !(self.learning_daily_min_secs.is_finite() && self.learning_daily_min_secs >= 0.0) {
            return Err(CoreError::config("learning_daily_min_secs must be finite and >= 0"));
        }
        Ok(())
    }
}

// ── Reports ──────────────────────────────────────────────────────────────────

/// What one tick changed.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TickReport {
    pub sleep_active: bool,
    /// Some(new_state) when the gate flipped this tick.
    pub sleep_transition: Option<bool>,
    /// One-shot sleep jobs dropped by a deactivation.
    pub canceled_jobs: usize,
    pub preempt_requested: bool,
    pub day_rolled: bool,
    pub learning_shortfall: bool,
}

/// What one dispatch round did. Gated/deferred reflect the round's end state.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunReport {
    pub started: usize,
    pub completed: usize,
    pub preempted: usize,
    pub failed: usize,
    /// Sleep-tier jobs waiting for the gate.
    pub gated: usize,
    /// Jobs whose estimate exceeds the tier's remaining budget today.
    pub deferred: usize,
}

// ── Scheduler ────────────────────────────────────────────────────────────────

pub struct TieredScheduler {
    cfg: SchedulerConfig,
    budget: Arc<BudgetState>,
    queue: Mutex<Vec<BatchJob>>,
    yield_flag: YieldFlag,
    stop: Arc<AtomicBool>,
    events: Arc<EventLog>,
}

impl TieredScheduler {
    pub fn new(cfg: SchedulerConfig, events: Arc<EventLog>) -> CoreResult<Self> {
        cfg.validate()?;
        let budget = Arc::new(BudgetState::new(&cfg));
        Ok(TieredScheduler {
            cfg,
            budget,
            queue: Mutex::new(Vec::new()),
            yield_flag: YieldFlag::new(),
            stop: Arc::new(AtomicBool::new(false)),
            events,
        })
    }

    /// Shared budget handle for collaborators that read gating state.
    pub fn budget(&self) -> Arc<BudgetState> {
        Arc::clone(&self.budget)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.cfg
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Account synchronous online work against the online ledger.
    pub fn note_online_work(&self, secs: f64) {
        self.budget.charge(Tier::Online, secs, false);
    }

    /// Queue a batch job. Online-tier work is refused; a full queue pushes
    /// back with BudgetExceeded rather than dropping silently.
    pub fn submit(&self, job: BatchJob) -> CoreResult<Uuid> {
        if job.tier == Tier::Online {
            return Err(CoreError::config(
                "online work never queues; run it on the caller's thread",
            ));
        }
        let mut queue = self.queue.lock();
        if queue.len() >= MAX_QUEUED_JOBS {
            return Err(CoreError::budget(
                job.tier.to_string(),
                job.estimated_cost_secs,
                0.0,
            ));
        }
        debug!(
            "[belief:scheduler] queued '{}' ({} tier, {} class)",
            job.name, job.tier, job.priority
        );
        let id = job.id;
        queue.push(job);
        Ok(id)
    }

    /// Synchronous per-tick state machine: day rollover, load sample, sleep
    /// gate. Any single failing gate condition deactivates sleep mode on the
    /// tick that observes it.
    pub fn tick(&self, sample: LoadSample) -> TickReport {
        let mut report = TickReport::default();

        // Roll the day first so gating sees fresh ledgers.
        if let Some(roll) = self.budget.roll_day_if_needed(sample.now) {
            report.day_rolled = true;
            if roll.shortfall {
                report.learning_shortfall = true;
                warn!(
                    "[belief:scheduler] learning minimum missed on {}: {:.0}s of {:.0}s",
                    roll.date, roll.consumed_secs, roll.required_secs
                );
                self.events.record(CoreEvent::LearningBudgetMissed {
                    date: roll.date,
                    consumed_secs: roll.consumed_secs,
                    required_secs: roll.required_secs,
                });
            }
        }

        self.budget.record_sample(&sample);
        let gate_ok = sample.idle_secs >= self.cfg.idle_threshold_secs
            && sample.load <= self.cfg.load_ceiling
            && sample.pending_volume >= self.cfg.min_pending_volume;
        let was_active = self.budget.sleep_active();

        if gate_ok && !was_active {
            self.budget.set_sleep_active(true);
            report.sleep_transition = Some(true);
            info!(
                "[belief:scheduler] sleep mode on (idle {:.0}s, load {:.2}, pending {})",
                sample.idle_secs, sample.load, sample.pending_volume
            );
            self.events.record(CoreEvent::SleepModeChanged { active: true });
        } else if !gate_ok && was_active {
            self.budget.set_sleep_active(false);
            report.sleep_transition = Some(false);
            // Preempt in-flight slices; cancel queued one-shot sleep work.
            // Recurring sleep jobs stay queued and wait for the next window.
            self.yield_flag.request();
            report.preempt_requested = true;
            let canceled = {
                let mut queue = self.queue.lock();
                let before = queue.len();
                queue.retain(|j| j.tier != Tier::Sleep || j.recur_secs.is_some());
                before - queue.len()
            };
            report.canceled_jobs = canceled;
            info!(
                "[belief:scheduler] sleep mode off, {} queued sleep jobs canceled",
                canceled
            );
            self.events.record(CoreEvent::SleepModeChanged { active: false });
        }

        report.sleep_active = self.budget.sleep_active();
        report
    }

    /// Dispatch up to max_slices_per_tick admitted job slices. Admission
    /// re-checks gating and budget per job, so a slice that spends budget can
    /// defer the jobs behind it.
    pub async fn run_pending(&self) -> RunReport {
        let mut report = RunReport::default();
        if self.stop.load(Ordering::SeqCst) {
            return report;
        }
        // A fresh round starts with a clean flag: admission below already
        // reflects the current gating, and prior rounds have returned.
        self.yield_flag.clear();

        for _ in 0..self.cfg.max_slices_per_tick {
            let now = Utc::now();
            let Some(job) = self.pick_runnable(now, &mut report) else {
                break;
            };
            report.started += 1;
            let started_at = Instant::now();
            let outcome = job.work.run_slice(&self.yield_flag).await;
            let elapsed_secs = started_at.elapsed().as_secs_f64();
            self.budget
                .charge(job.tier, elapsed_secs, job.priority == PriorityClass::Learning);

            match outcome {
                Ok(SliceOutcome::Completed) => {
                    report.completed += 1;
                    if let Some(every) = job.recur_secs {
                        let mut next = job;
                        next.not_before = Some(Utc::now() + chrono::Duration::seconds(every as i64));
                        debug!(
                            "[belief:scheduler] '{}' completed in {:.3}s, next run in {}s",
                            next.name, elapsed_secs, every
                        );
                        self.queue.lock().push(next);
                    } else {
                        info!(
                            "[belief:scheduler] job '{}' completed in {:.3}s",
                            job.name, elapsed_secs
                        );
                    }
                }
                Ok(SliceOutcome::Yielded) => {
                    report.preempted += 1;
                    debug!("[belief:scheduler] job '{}' yielded, requeued", job.name);
                    self.queue.lock().insert(0, job);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("[belief:scheduler] job '{}' failed: {}", job.name, e);
                }
            }

            if self.yield_flag.is_requested() || self.stop.load(Ordering::SeqCst) {
                break;
            }
        }
        report
    }

    /// Remove and return the highest-priority admissible job. Gated and
    /// deferred tallies are recomputed per call; the caller keeps the last.
    fn pick_runnable(&self, now: DateTime<Utc>, report: &mut RunReport) -> Option<BatchJob> {
        let sleep_active = self.budget.sleep_active();
        let mut gated = 0usize;
        let mut deferred = 0usize;

        let mut queue = self.queue.lock();
        queue.sort_by_key(|j| j.priority);
        let mut pick: Option<usize> = None;
        for (i, job) in queue.iter().enumerate() {
            if job.not_before.map(|t| t > now).unwrap_or(false) {
                continue;
            }
            if job.tier == Tier::Sleep && !sleep_active {
                gated += 1;
                continue;
            }
            let remaining = self.budget.remaining_secs(job.tier);
            if job.estimated_cost_secs > remaining {
                deferred += 1;
                debug!(
                    "[belief:scheduler] deferred '{}': {}",
                    job.name,
                    CoreError::budget(job.tier.to_string(), job.estimated_cost_secs, remaining)
                );
                continue;
            }
            pick = Some(i);
            break;
        }

        report.gated = gated;
        report.deferred = deferred;
        pick.map(|i| queue.remove(i))
    }

    /// Spawn the driver loop: sample, tick, dispatch, sleep, repeat.
    pub fn start(self: Arc<Self>, sampler: Arc<dyn LoadSampler>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "[belief:scheduler] driver started (tick every {}s)",
                self.cfg.tick_interval_secs
            );
            while !self.stop.load(Ordering::SeqCst) {
                let sample = sampler.sample();
                self.tick(sample);
                self.run_pending().await;
                tokio::time::sleep(std::time::Duration::from_secs(self.cfg.tick_interval_secs))
                    .await;
            }
            info!("[belief:scheduler] driver stopped");
        })
    }

    /// Request a graceful stop: no new slices start, in-flight slices see the
    /// yield flag at their next checkpoint.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.yield_flag.request();
        info!("[belief:scheduler] shutdown requested");
    }
}
