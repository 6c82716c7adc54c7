// src/schedule/scheduler.rs

//! Per-field singleton runs with a reschedule flag.
//!
//! The protocol, for one field:
//!
//! - `mark_dirty` while a run holds the lease only sets the reschedule flag.
//!   Otherwise it arms the debounce timer; if a timer is already pending the
//!   trigger refuses and the flag is set instead, so bursts collapse into
//!   one run.
//! - A run first acquires the lease. If it cannot, it sets the flag and
//!   leaves; the holder will pick the flag up when it ends.
//! - Holding the lease, the run clears the flag and processes the rows that
//!   are scheduled at that moment. The lease is renewed until the last row
//!   in flight has drained, even past the run time limit.
//! - On the way out the run releases its own lease and, if the flag was set
//!   meanwhile, the field is marked dirty once more.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::backend::BackendRegistry;
use crate::engine::{
    CancelFlag, EngineOptions, FieldSpec, Generator, OutcomeHandler, PagedCursor, RowSource,
    RunSummary,
};
use crate::errors::{GenerationError, StoreError, TriggerError};
use crate::schedule::job::{AutoUpdateHandler, JobMode, ManualHandler};
use crate::schedule::trigger::TaskTrigger;
use crate::schedule::{RunReport, RunStatus, SchedulerOptions};
use crate::store::{
    ErrorSink, FieldCatalog, FlagStore, LeaseStore, LeaseToken, RowFilter, ScheduledRowSource,
    ScheduledUpdateStore, TableRowSource, TableStore, flag_key, lease_key, lock,
};
use crate::types::{FieldId, RowId};

/// The external services a [`FieldScheduler`] coordinates.
#[derive(Clone)]
pub struct Services {
    pub registry: Arc<BackendRegistry>,
    pub catalog: Arc<dyn FieldCatalog>,
    pub updates: Arc<dyn ScheduledUpdateStore>,
    pub table: Arc<dyn TableStore>,
    pub leases: Arc<dyn LeaseStore>,
    pub flags: Arc<dyn FlagStore>,
    pub trigger: Arc<dyn TaskTrigger>,
    pub errors: Arc<dyn ErrorSink>,
}

/// Result of [`FieldScheduler::mark_dirty`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyOutcome {
    /// A new debounce timer was armed.
    Armed,
    /// A run or timer is already on its way; the reschedule flag was set.
    Flagged,
    /// Auto-update is disabled after repeated failures.
    Blocked,
    /// The trigger is shut down.
    Dropped,
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records older than the retention cutoff.
    pub expired: usize,
    /// Records of fields that are gone or no longer auto-update.
    pub orphaned: usize,
    /// Idle fields with pending records that got a new timer.
    pub rearmed: Vec<FieldId>,
}

pub struct FieldScheduler {
    services: Services,
    engine: EngineOptions,
    options: SchedulerOptions,
    failures: Mutex<HashMap<FieldId, u32>>,
    blocked: Mutex<HashSet<FieldId>>,
}

impl std::fmt::Debug for FieldScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldScheduler")
            .field("engine", &self.engine)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl FieldScheduler {
    pub fn new(services: Services, engine: EngineOptions, options: SchedulerOptions) -> Self {
        Self {
            services,
            engine,
            options,
            failures: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
        }
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Record `rows` as needing regeneration and mark the field dirty.
    ///
    /// The field is marked dirty even when every row was already scheduled.
    pub async fn schedule_field_generation(
        &self,
        field: FieldId,
        rows: &[RowId],
    ) -> Result<DirtyOutcome, StoreError> {
        if !rows.is_empty() {
            self.services
                .updates
                .upsert(field, rows, SystemTime::now())
                .await?;
        }
        info!(field, rows = rows.len(), "generation scheduled");
        Ok(self.mark_dirty(field).await)
    }

    /// Make sure one more run of `field` happens after the debounce period.
    pub async fn mark_dirty(&self, field: FieldId) -> DirtyOutcome {
        if self.is_blocked(field) {
            debug!(field, "auto-update disabled; not arming");
            return DirtyOutcome::Blocked;
        }

        if self.lease_held(field).await {
            debug!(field, "run in progress; flagging for reschedule");
            self.set_flag(field).await;
            // The holder reads the flag after releasing the lease. If the
            // lease is still held now, it will see the flag.
            if self.lease_held(field).await {
                return DirtyOutcome::Flagged;
            }
            debug!(field, "run ended while flagging; arming instead");
        }

        match self.services.trigger.schedule(field, self.options.debounce) {
            Ok(()) => DirtyOutcome::Armed,
            Err(TriggerError::Duplicate(_)) => {
                debug!(field, "timer already pending; flagging for reschedule");
                self.set_flag(field).await;
                DirtyOutcome::Flagged
            }
            Err(err @ TriggerError::Closed) => {
                warn!(field, error = %err, "cannot arm generation timer");
                DirtyOutcome::Dropped
            }
        }
    }

    /// Body of the debounced task: run auto-update for `field` under its lease.
    pub async fn run_scheduled_generation(&self, field: FieldId, cancel: CancelFlag) -> RunReport {
        let lease = lease_key(field);
        let token = match self
            .services
            .leases
            .acquire(&lease, self.options.run_time_limit)
            .await
        {
            Ok(Some(token)) => token,
            Ok(None) => {
                info!(field, "generation already running; flagging for reschedule");
                self.set_flag(field).await;
                return RunReport::new(field, RunStatus::Contended);
            }
            Err(err) => {
                warn!(field, error = %err, "could not acquire lease");
                return RunReport::new(field, RunStatus::Failed(err.to_string()));
            }
        };

        // Anything flagged before this point is covered by this run.
        if let Err(err) = self.services.flags.test_and_clear(&flag_key(field)).await {
            warn!(field, error = %err, "could not clear reschedule flag");
        }

        let keeper = self.keep_lease(field, token, cancel.clone());
        let (status, stale_rows) = self.run_locked(field, cancel).await;
        keeper.abort();

        match self.services.leases.release(&lease, token).await {
            Ok(true) => {}
            Ok(false) => warn!(field, "lease was lost before the run ended"),
            Err(err) => warn!(field, error = %err, "could not release lease; it will expire"),
        }

        let mut report = RunReport::new(field, status);
        report.disabled = self.track_failures(&report).await;

        let flagged = match self.services.flags.test_and_clear(&flag_key(field)).await {
            Ok(flagged) => flagged,
            Err(err) => {
                warn!(field, error = %err, "could not read reschedule flag");
                false
            }
        };
        if (flagged || stale_rows) && !report.disabled {
            debug!(field, flagged, stale_rows, "rescheduling after run");
            report.rescheduled = matches!(
                self.mark_dirty(field).await,
                DirtyOutcome::Armed | DirtyOutcome::Flagged
            );
        }
        report
    }

    async fn run_locked(&self, field: FieldId, cancel: CancelFlag) -> (RunStatus, bool) {
        let spec = match self.services.catalog.field(field).await {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                info!(field, "field no longer exists; skipping run");
                return (RunStatus::Skipped, false);
            }
            Err(err) => return (RunStatus::Failed(err.to_string()), false),
        };

        if !spec.auto_update {
            match self.services.updates.delete_for_field(field).await {
                Ok(deleted) => info!(field, deleted, "auto-update disabled; dropped scheduled rows"),
                Err(err) => warn!(field, error = %err, "could not drop scheduled rows"),
            }
            return (RunStatus::Skipped, false);
        }

        match self.services.updates.has_pending(field).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(field, "no scheduled rows; skipping run");
                return (RunStatus::Skipped, false);
            }
            Err(err) => return (RunStatus::Failed(err.to_string()), false),
        }

        let source = ScheduledRowSource::new(
            Arc::clone(&self.services.updates),
            Arc::clone(&self.services.table),
            field,
        );
        let mut handler = AutoUpdateHandler::new(
            field,
            Arc::clone(&self.services.updates),
            Arc::clone(&self.services.table),
            Arc::clone(&self.services.errors),
        );

        let status = self.drive(&spec, source, &mut handler, cancel).await;
        (status, handler.needs_reschedule())
    }

    /// Run a manual job over table rows, without the lease or scheduled updates.
    pub async fn run_manual_generation(
        &self,
        field: FieldId,
        mode: JobMode,
        cancel: CancelFlag,
    ) -> RunReport {
        let spec = match self.services.catalog.field(field).await {
            Ok(Some(spec)) => spec,
            Ok(None) => {
                let message = format!("field {field} not found");
                warn!(field, "{message}");
                return RunReport::new(field, RunStatus::Failed(message));
            }
            Err(err) => return RunReport::new(field, RunStatus::Failed(err.to_string())),
        };

        let filter = match mode {
            JobMode::Rows(ids) => RowFilter::rows(ids),
            JobMode::Table { only_empty } => RowFilter::all().only_empty(only_empty),
        };
        let source = TableRowSource::new(Arc::clone(&self.services.table), field, filter);
        let mut handler = ManualHandler::new(
            field,
            Arc::clone(&self.services.table),
            Arc::clone(&self.services.errors),
        );

        let status = self.drive(&spec, source, &mut handler, cancel).await;
        RunReport::new(field, status)
    }

    /// Prepare a generator for `spec` and process `source` under the run
    /// time limit.
    async fn drive<S, H>(
        &self,
        spec: &FieldSpec,
        source: S,
        handler: &mut H,
        cancel: CancelFlag,
    ) -> RunStatus
    where
        S: RowSource,
        H: OutcomeHandler,
    {
        let generator = match Generator::prepare(
            spec,
            &self.services.registry,
            self.services.errors.as_ref(),
            self.engine,
        ) {
            Ok(generator) => generator.with_cancel(cancel.clone()),
            Err(err) => return RunStatus::Failed(err.to_string()),
        };

        let limit = self.options.run_time_limit;
        let field = spec.id;
        let watchdog = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            warn!(field, limit_s = limit.as_secs(), "run time limit reached; cancelling");
            cancel.cancel();
        });

        let mut cursor = PagedCursor::new(source, self.engine.page_size);
        let result = generator.process(&mut cursor, handler).await;
        watchdog.abort();

        match result {
            Ok(summary) => RunStatus::Completed(summary),
            Err(err) => {
                log_failure(field, &err);
                RunStatus::Failed(err.to_string())
            }
        }
    }

    /// Update the consecutive failure counter; returns `true` if this report
    /// disabled auto-update.
    async fn track_failures(&self, report: &RunReport) -> bool {
        let field = report.field;
        let count = match report.status {
            RunStatus::Failed(_) => {
                let mut failures = lock(&self.failures);
                let count = failures.entry(field).or_insert(0);
                *count += 1;
                *count
            }
            RunStatus::Completed(_) => {
                lock(&self.failures).remove(&field);
                return false;
            }
            RunStatus::Contended | RunStatus::Skipped => return false,
        };

        let limit = self.options.max_consecutive_failures;
        if limit == 0 || count < limit {
            return false;
        }

        warn!(field, failures = count, "too many consecutive failures; disabling auto-update");
        lock(&self.blocked).insert(field);
        if let Err(err) = self.services.catalog.set_auto_update(field, false).await {
            warn!(field, error = %err, "could not disable auto-update in catalog");
        }
        self.services.errors.report(
            field,
            &[],
            &format!("auto-update disabled after {count} consecutive failed runs"),
        );
        true
    }

    /// Turn auto-update back on for a field; returns `false` if it is unknown.
    pub async fn enable_field(&self, field: FieldId) -> Result<bool, StoreError> {
        let found = self.services.catalog.set_auto_update(field, true).await?;
        lock(&self.blocked).remove(&field);
        lock(&self.failures).remove(&field);
        info!(field, found, "auto-update enabled");
        Ok(found)
    }

    pub fn is_blocked(&self, field: FieldId) -> bool {
        lock(&self.blocked).contains(&field)
    }

    pub fn consecutive_failures(&self, field: FieldId) -> u32 {
        lock(&self.failures).get(&field).copied().unwrap_or(0)
    }

    /// Drop stale and orphaned scheduled updates, then re-arm every field
    /// for which `is_idle` holds and that still has scheduled rows.
    ///
    /// This is the recovery path for timers lost to a crash.
    pub async fn sweep<F>(&self, now: SystemTime, is_idle: F) -> Result<SweepReport, StoreError>
    where
        F: Fn(FieldId) -> bool + Send + Sync,
    {
        let updates = &self.services.updates;
        let cutoff = now
            .checked_sub(self.options.retention)
            .unwrap_or(UNIX_EPOCH);

        let mut report = SweepReport {
            expired: updates.delete_older_than(cutoff).await?,
            ..SweepReport::default()
        };

        let auto_update: HashMap<FieldId, bool> = self
            .services
            .catalog
            .fields()
            .await?
            .into_iter()
            .map(|f| (f.id, f.auto_update))
            .collect();

        for field in updates.pending_fields().await? {
            if auto_update.get(&field).copied().unwrap_or(false) {
                continue;
            }
            report.orphaned += updates.delete_for_field(field).await?;
        }

        for field in updates.pending_fields().await? {
            if !is_idle(field) {
                continue;
            }
            if self.mark_dirty(field).await == DirtyOutcome::Armed {
                report.rearmed.push(field);
            }
        }

        info!(
            expired = report.expired,
            orphaned = report.orphaned,
            rearmed = report.rearmed.len(),
            "scheduled updates swept"
        );
        Ok(report)
    }

    /// Renew the run's lease every third of its TTL until aborted.
    ///
    /// Losing the lease cancels the run so it stops dispatching.
    fn keep_lease(&self, field: FieldId, token: LeaseToken, cancel: CancelFlag) -> JoinHandle<()> {
        let leases = Arc::clone(&self.services.leases);
        let ttl = self.options.run_time_limit;
        let period = (ttl / 3).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let key = lease_key(field);
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                match leases.renew(&key, token, ttl).await {
                    Ok(true) => trace!(field, "lease renewed"),
                    Ok(false) => {
                        warn!(field, "lease lost; cancelling run");
                        cancel.cancel();
                        return;
                    }
                    Err(err) => warn!(field, error = %err, "could not renew lease"),
                }
            }
        })
    }

    async fn lease_held(&self, field: FieldId) -> bool {
        match self.services.leases.is_held(&lease_key(field)).await {
            Ok(held) => held,
            Err(err) => {
                warn!(field, error = %err, "could not check lease; arming anyway");
                false
            }
        }
    }

    async fn set_flag(&self, field: FieldId) {
        if let Err(err) = self
            .services
            .flags
            .set(&flag_key(field), self.options.flag_expiry)
            .await
        {
            warn!(field, error = %err, "could not set reschedule flag");
        }
    }
}

fn log_failure(field: FieldId, err: &GenerationError) {
    if err.is_configuration() {
        warn!(field, error = %err, "generation backend unusable");
    } else {
        warn!(field, error = %err, "generation run failed");
    }
}

/// Summary line for logs and the CLI.
pub fn describe(summary: &RunSummary) -> String {
    format!(
        "{} finished, {} failed, {} skipped",
        summary.finished, summary.failed, summary.skipped
    )
}
