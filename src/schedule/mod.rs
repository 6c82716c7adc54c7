// src/schedule/mod.rs

//! Debounce/reschedule scheduler.
//!
//! For each field at most one generation run is active at a time, and rows
//! marked dirty during a run trigger exactly one follow-up run:
//!
//! - [`trigger`]: delayed, de-duplicated "run this field soon" timers
//! - [`scheduler`]: the lease / reschedule-flag protocol around a run
//! - [`job`]: outcome handlers that write results back
//! - [`phase`]: pure per-field phase tracking
//! - [`runtime`]: the event loop tying timers, runs and the sweep together

use std::time::Duration;

use crate::engine::RunSummary;
use crate::types::{FieldId, RowId};

pub mod job;
pub mod phase;
pub mod runtime;
pub mod scheduler;
pub mod trigger;

pub use job::{AutoUpdateHandler, JobMode, ManualHandler};
pub use phase::{KeyPhase, PhaseTable};
pub use runtime::{RuntimeOptions, SchedulerRuntime};
pub use scheduler::{DirtyOutcome, FieldScheduler, Services, SweepReport};
pub use trigger::{TaskTrigger, TokioTaskTrigger};

/// Scheduler knobs from `[scheduler]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Quiet period before a dirty field runs.
    pub debounce: Duration,
    /// Time after which a run stops dispatching; also the lease TTL, which
    /// is renewed until the rows in flight have drained.
    pub run_time_limit: Duration,
    /// Lifetime of a reschedule flag nobody consumed.
    pub flag_expiry: Duration,
    pub sweep_interval: Duration,
    pub sweep_time_limit: Duration,
    /// Scheduled updates older than this are dropped by the sweep.
    pub retention: Duration,
    /// Failed runs in a row before auto-update is disabled; 0 never disables.
    pub max_consecutive_failures: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(3),
            run_time_limit: Duration::from_secs(30 * 60),
            flag_expiry: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_time_limit: Duration::from_secs(5 * 60),
            retention: Duration::from_secs(72 * 60 * 60),
            max_consecutive_failures: 0,
        }
    }
}

/// Kind of generation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    /// Auto-update run over the field's scheduled rows, under the lease.
    Scheduled,
    /// Explicitly requested run over table rows.
    Manual,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    Completed(RunSummary),
    /// The run failed; carries the message shown to users.
    Failed(String),
    /// Another run holds the field's lease; the reschedule flag was set.
    Contended,
    /// Nothing to do (field gone, auto-update off, or no scheduled rows).
    Skipped,
}

/// What happened to one run attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub field: FieldId,
    pub status: RunStatus,
    /// A follow-up run was requested when this one ended.
    pub rescheduled: bool,
    /// This run hit the consecutive failure limit and disabled auto-update.
    pub disabled: bool,
}

impl RunReport {
    pub fn new(field: FieldId, status: RunStatus) -> Self {
        Self {
            field,
            status,
            rescheduled: false,
            disabled: false,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, RunStatus::Failed(_))
    }
}

/// Events consumed by [`SchedulerRuntime`].
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// Rows of `field` need regeneration.
    Schedule { field: FieldId, rows: Vec<RowId> },
    /// Run a manual generation job.
    Generate { field: FieldId, mode: JobMode },
    /// The debounce timer of `field` elapsed.
    TimerFired { field: FieldId },
    /// A run task ended.
    RunFinished { kind: RunKind, report: RunReport },
    /// Garbage-collect and re-arm forgotten fields now.
    Sweep,
    /// Re-enable auto-update of a field disabled after repeated failures.
    Enable { field: FieldId },
    ShutdownRequested,
}
