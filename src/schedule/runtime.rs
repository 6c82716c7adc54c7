// src/schedule/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::{Id, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, error, info, warn};

use crate::engine::CancelFlag;
use crate::errors::Result;
use crate::schedule::scheduler::{DirtyOutcome, FieldScheduler, describe};
use crate::schedule::{
    JobMode, KeyPhase, PhaseTable, RunKind, RunReport, RunStatus, SchedulerEvent,
};
use crate::types::{FieldId, RowId};

/// How long shutdown waits for a cancelled run to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Options that influence how the runtime behaves.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Exit as soon as no field is armed or running and no job is active.
    /// In interactive mode this should be `false`.
    pub exit_when_idle: bool,
}

struct ActiveRun {
    field: FieldId,
    kind: RunKind,
    cancel: CancelFlag,
}

/// Drives a [`FieldScheduler`] in response to [`SchedulerEvent`]s.
///
/// Runs execute on their own tasks; the loop only tracks phases, starts
/// runs when timers fire, reaps finished runs and sweeps periodically.
pub struct SchedulerRuntime {
    scheduler: Arc<FieldScheduler>,
    phases: PhaseTable,
    options: RuntimeOptions,
    events_rx: mpsc::Receiver<SchedulerEvent>,
    runs: JoinSet<RunReport>,
    active: HashMap<Id, ActiveRun>,
    /// Local scheduled run per field, by task id.
    running: HashMap<FieldId, Id>,
}

impl fmt::Debug for SchedulerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerRuntime")
            .field("phases", &self.phases)
            .field("options", &self.options)
            .field("active_runs", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl SchedulerRuntime {
    pub fn new(
        scheduler: Arc<FieldScheduler>,
        events_rx: mpsc::Receiver<SchedulerEvent>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            scheduler,
            phases: PhaseTable::new(),
            options,
            events_rx,
            runs: JoinSet::new(),
            active: HashMap::new(),
            running: HashMap::new(),
        }
    }

    /// Nothing armed, running, or being generated manually.
    pub fn is_idle(&self) -> bool {
        self.phases.is_idle() && self.active.is_empty()
    }

    pub fn phases(&self) -> &PhaseTable {
        &self.phases
    }

    /// Main event loop.
    ///
    /// - Consumes `SchedulerEvent`s from `events_rx`.
    /// - Reaps finished run tasks as `RunFinished` events.
    /// - Sweeps every `sweep_interval`.
    ///
    /// On exit every active run is cancelled and drained.
    pub async fn run(mut self) -> Result<()> {
        info!("fieldgen runtime started");

        let period = self.scheduler.options().sweep_interval;
        let mut sweep = interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if self.options.exit_when_idle && self.is_idle() && self.events_rx.is_empty() {
                info!("runtime idle and exit_when_idle=true, stopping");
                break;
            }

            let event = tokio::select! {
                maybe = self.events_rx.recv() => match maybe {
                    Some(event) => event,
                    None => {
                        info!("runtime event channel closed; exiting");
                        break;
                    }
                },
                Some(joined) = self.runs.join_next_with_id(), if !self.runs.is_empty() => {
                    match self.reap(joined) {
                        Some(event) => event,
                        None => continue,
                    }
                }
                _ = sweep.tick() => SchedulerEvent::Sweep,
            };

            debug!(?event, "runtime received event");

            if !self.handle(event).await {
                info!("shutdown requested; stopping runtime");
                break;
            }
        }

        self.shutdown().await;
        info!("fieldgen runtime exiting");
        Ok(())
    }

    /// Handle one event; returns `false` when the runtime should stop.
    pub async fn handle(&mut self, event: SchedulerEvent) -> bool {
        match event {
            SchedulerEvent::Schedule { field, rows } => self.handle_schedule(field, &rows).await,
            SchedulerEvent::Generate { field, mode } => self.start_manual(field, mode),
            SchedulerEvent::TimerFired { field } => self.start_scheduled(field),
            SchedulerEvent::RunFinished { kind, report } => self.handle_finished(kind, report),
            SchedulerEvent::Sweep => self.handle_sweep().await,
            SchedulerEvent::Enable { field } => self.handle_enable(field).await,
            SchedulerEvent::ShutdownRequested => return false,
        }
        true
    }

    async fn handle_schedule(&mut self, field: FieldId, rows: &[RowId]) {
        match self.scheduler.schedule_field_generation(field, rows).await {
            Ok(outcome) => self.note_dirty(field, outcome),
            Err(err) => error!(field, error = %err, "could not schedule rows"),
        }
    }

    fn note_dirty(&mut self, field: FieldId, outcome: DirtyOutcome) {
        if outcome == DirtyOutcome::Armed {
            self.phases.arm(field);
        }
    }

    fn start_scheduled(&mut self, field: FieldId) {
        let cancel = CancelFlag::new();
        let scheduler = Arc::clone(&self.scheduler);
        let run_cancel = cancel.clone();
        let handle = self
            .runs
            .spawn(async move { scheduler.run_scheduled_generation(field, run_cancel).await });

        let id = handle.id();
        // A second local attempt while one is running only exercises the
        // lease and ends as contended; it does not own the phase.
        if !self.running.contains_key(&field) {
            self.phases.start(field);
            self.running.insert(field, id);
        }
        self.active.insert(
            id,
            ActiveRun {
                field,
                kind: RunKind::Scheduled,
                cancel,
            },
        );
        debug!(field, "scheduled run started");
    }

    fn start_manual(&mut self, field: FieldId, mode: JobMode) {
        let cancel = CancelFlag::new();
        let scheduler = Arc::clone(&self.scheduler);
        let run_cancel = cancel.clone();
        info!(field, ?mode, "manual generation started");
        let handle = self.runs.spawn(async move {
            scheduler
                .run_manual_generation(field, mode, run_cancel)
                .await
        });
        self.active.insert(
            handle.id(),
            ActiveRun {
                field,
                kind: RunKind::Manual,
                cancel,
            },
        );
    }

    /// Turn a finished run task into a `RunFinished` event.
    fn reap(
        &mut self,
        joined: std::result::Result<(Id, RunReport), tokio::task::JoinError>,
    ) -> Option<SchedulerEvent> {
        let (id, report) = match joined {
            Ok((id, report)) => (id, report),
            Err(err) => {
                let id = err.id();
                let field = self.active.get(&id)?.field;
                error!(field, error = %err, "run task did not finish cleanly");
                let report = RunReport::new(field, RunStatus::Failed(format!("run task failed: {err}")));
                (id, report)
            }
        };

        let run = self.active.remove(&id)?;
        if self.running.get(&run.field) == Some(&id) {
            self.running.remove(&run.field);
            if run.kind == RunKind::Scheduled {
                self.phases
                    .finish(run.field, report.rescheduled, report.disabled);
            }
        }
        Some(SchedulerEvent::RunFinished {
            kind: run.kind,
            report,
        })
    }

    fn handle_finished(&mut self, kind: RunKind, report: RunReport) {
        let field = report.field;
        match &report.status {
            RunStatus::Completed(summary) => {
                info!(field, ?kind, rescheduled = report.rescheduled, "run completed: {}", describe(summary))
            }
            RunStatus::Failed(message) => {
                warn!(field, ?kind, disabled = report.disabled, error = %message, "run failed")
            }
            RunStatus::Contended => debug!(field, "run contended; left to the lease holder"),
            RunStatus::Skipped => debug!(field, "run skipped"),
        }
    }

    async fn handle_sweep(&mut self) {
        let phases = self.phases.clone();
        let limit = self.scheduler.options().sweep_time_limit;
        let sweep = self
            .scheduler
            .sweep(SystemTime::now(), move |field| phases.phase(field) == KeyPhase::Idle);

        match timeout(limit, sweep).await {
            Ok(Ok(report)) => {
                for field in report.rearmed {
                    self.phases.arm(field);
                }
            }
            Ok(Err(err)) => warn!(error = %err, "sweep failed"),
            Err(_) => warn!(limit_s = limit.as_secs(), "sweep exceeded its time limit"),
        }
    }

    async fn handle_enable(&mut self, field: FieldId) {
        match self.scheduler.enable_field(field).await {
            Ok(true) => {
                self.phases.enable(field);
            }
            Ok(false) => warn!(field, "cannot enable unknown field"),
            Err(err) => error!(field, error = %err, "could not enable field"),
        }
    }

    /// Cancel every active run and wait for it to drain.
    async fn shutdown(&mut self) {
        if self.runs.is_empty() {
            return;
        }
        info!(active = self.active.len(), "cancelling active runs");
        for run in self.active.values() {
            run.cancel.cancel();
        }

        while let Ok(Some(joined)) = timeout(SHUTDOWN_GRACE, self.runs.join_next_with_id()).await {
            if let Some(SchedulerEvent::RunFinished { kind, report }) = self.reap(joined) {
                self.handle_finished(kind, report);
            }
        }
        if !self.runs.is_empty() {
            warn!(remaining = self.runs.len(), "runs still busy after grace period; aborting");
            self.runs.abort_all();
        }
    }
}
