// src/schedule/job.rs

//! Outcome handlers of the generation jobs.

use std::sync::Arc;

use tracing::debug;

use crate::engine::{GenerationOutcome, OutcomeHandler};
use crate::errors::ApplyError;
use crate::store::{ErrorSink, ScheduledUpdateStore, TableStore};
use crate::types::{BoxFuture, FieldId, RowId};

/// Rows a manual job generates values for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobMode {
    /// These rows only.
    Rows(Vec<RowId>),
    /// Every row of the table, optionally only those without a value yet.
    Table { only_empty: bool },
}

/// Applies results of an auto-update run.
///
/// A row's value is written only if its scheduled update was not touched
/// after the row's generation started; otherwise the value is already
/// stale, so it is dropped and a follow-up run is requested.
pub struct AutoUpdateHandler {
    field: FieldId,
    updates: Arc<dyn ScheduledUpdateStore>,
    table: Arc<dyn TableStore>,
    errors: Arc<dyn ErrorSink>,
    needs_reschedule: bool,
    applied: usize,
}

impl AutoUpdateHandler {
    pub fn new(
        field: FieldId,
        updates: Arc<dyn ScheduledUpdateStore>,
        table: Arc<dyn TableStore>,
        errors: Arc<dyn ErrorSink>,
    ) -> Self {
        Self {
            field,
            updates,
            table,
            errors,
            needs_reschedule: false,
            applied: 0,
        }
    }

    /// Some row was re-scheduled while this run was generating it.
    pub fn needs_reschedule(&self) -> bool {
        self.needs_reschedule
    }

    pub fn applied(&self) -> usize {
        self.applied
    }
}

impl OutcomeHandler for AutoUpdateHandler {
    fn handle<'a>(
        &'a mut self,
        outcome: &'a GenerationOutcome,
    ) -> BoxFuture<'a, Result<(), ApplyError>> {
        Box::pin(async move {
            let value = match &outcome.result {
                Ok(value) => value,
                Err(message) => {
                    self.errors.report(self.field, &[outcome.row_id], message);
                    return Ok(());
                }
            };

            let removed = self
                .updates
                .remove_if_untouched(self.field, outcome.row_id, outcome.started_at)
                .await
                .map_err(|e| ApplyError::Store(e.to_string()))?;
            if !removed {
                debug!(
                    field = self.field,
                    row = outcome.row_id,
                    "row re-scheduled during generation; dropping stale value"
                );
                self.needs_reschedule = true;
                return Ok(());
            }

            self.table
                .update_value(self.field, outcome.row_id, value)
                .await?;
            self.applied += 1;
            Ok(())
        })
    }
}

/// Applies results of a manual job straight to the table.
pub struct ManualHandler {
    field: FieldId,
    table: Arc<dyn TableStore>,
    errors: Arc<dyn ErrorSink>,
    applied: usize,
}

impl ManualHandler {
    pub fn new(field: FieldId, table: Arc<dyn TableStore>, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            field,
            table,
            errors,
            applied: 0,
        }
    }

    pub fn applied(&self) -> usize {
        self.applied
    }
}

impl OutcomeHandler for ManualHandler {
    fn handle<'a>(
        &'a mut self,
        outcome: &'a GenerationOutcome,
    ) -> BoxFuture<'a, Result<(), ApplyError>> {
        Box::pin(async move {
            match &outcome.result {
                Ok(value) => {
                    self.table
                        .update_value(self.field, outcome.row_id, value)
                        .await?;
                    self.applied += 1;
                }
                Err(message) => self.errors.report(self.field, &[outcome.row_id], message),
            }
            Ok(())
        })
    }
}
