// src/engine/generator.rs

//! Async orchestrator of one generation run.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendRegistry, GenerationBackend};
use crate::engine::prompt::render_prompt;
use crate::engine::state::EngineState;
use crate::engine::{
    CancelFlag, EngineOptions, FieldSpec, GenerationOutcome, GenerationRequest, OutcomeHandler,
    RowCursor, RunSummary,
};
use crate::errors::{ApplyError, GenerationError, StoreError};
use crate::store::ErrorSink;
use crate::types::FieldId;

/// Generates values for the rows of one field with bounded parallelism.
///
/// A `Generator` only exists once [`Generator::prepare`] has validated the
/// field against its backend, so `process` can never run unprepared.
///
/// Each row is generated on its own worker task; at most `max_concurrency`
/// rows are in flight and the outcome channel has the same capacity, so a
/// slow consumer backpressures the workers. The task calling `process` is
/// the only one that touches [`EngineState`] or the [`OutcomeHandler`].
pub struct Generator {
    field_id: FieldId,
    model: Arc<str>,
    template: Arc<str>,
    temperature: Option<f32>,
    backend: Arc<dyn GenerationBackend>,
    options: EngineOptions,
    max_concurrency: usize,
    cancel: CancelFlag,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator")
            .field("field_id", &self.field_id)
            .field("model", &self.model)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl Generator {
    /// Resolve the field's backend and check that its model is enabled.
    ///
    /// On failure the error is also reported to `errors` (with no rows), so
    /// the UI learns about it even though no row was processed.
    pub fn prepare(
        field: &FieldSpec,
        registry: &BackendRegistry,
        errors: &dyn ErrorSink,
        options: EngineOptions,
    ) -> Result<Self, GenerationError> {
        let backend = match resolve_backend(field, registry) {
            Ok(backend) => backend,
            Err(err) => {
                warn!(field = field.id, error = %err, "generator preparation failed");
                errors.report(field.id, &[], &err.to_string());
                return Err(err);
            }
        };

        let max_concurrency = field
            .max_concurrency
            .unwrap_or(options.max_concurrency)
            .max(1);

        Ok(Self {
            field_id: field.id,
            model: Arc::from(field.model.as_str()),
            template: Arc::from(field.prompt.as_str()),
            temperature: field.temperature,
            backend,
            options,
            max_concurrency,
            cancel: CancelFlag::new(),
        })
    }

    /// Use `cancel` as this generator's stop signal.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Generate values for every row yielded by `rows`.
    ///
    /// The loop alternates between dispatching rows into free worker slots
    /// and draining outcomes (waiting at most `poll_interval` for one).
    /// After the first row error, a row-source failure, an apply failure or
    /// cancellation, nothing new is dispatched but everything in flight is
    /// still drained and handed to `handler`.
    ///
    /// Returns [`GenerationError::Aggregate`] once drained if any row failed.
    pub async fn process<C, H>(
        &self,
        rows: &mut C,
        handler: &mut H,
    ) -> Result<RunSummary, GenerationError>
    where
        C: RowCursor + ?Sized,
        H: OutcomeHandler + ?Sized,
    {
        let mut state = EngineState::new(self.max_concurrency, self.options.error_policy);
        let (tx, mut rx) = mpsc::channel::<GenerationOutcome>(state.max_concurrency());
        let mut workers: JoinSet<()> = JoinSet::new();
        let mut source_error: Option<StoreError> = None;

        info!(
            field = self.field_id,
            max_concurrency = self.max_concurrency,
            "generation run started"
        );

        loop {
            while state.can_dispatch() {
                if self.cancel.is_cancelled() {
                    info!(field = self.field_id, "run cancelled; draining rows in flight");
                    state.stop_accepting();
                    break;
                }

                match rows.next_request().await {
                    Ok(Some(request)) => {
                        if state.record_dispatch(request.row_id) {
                            self.spawn_worker(&mut workers, request, tx.clone());
                        } else {
                            state.record_skip();
                        }
                    }
                    Ok(None) => {
                        debug!(field = self.field_id, "row source exhausted");
                        state.stop_accepting();
                    }
                    Err(err) => {
                        error!(field = self.field_id, error = %err, "row source failed");
                        source_error = Some(err);
                        state.stop_accepting();
                    }
                }
            }

            if state.is_finished() {
                break;
            }

            match timeout(self.options.poll_interval, rx.recv()).await {
                Ok(Some(outcome)) => self.drain_one(&mut state, handler, outcome).await,
                Ok(None) => {
                    // We hold a sender, so the channel cannot close under us.
                    error!(field = self.field_id, "outcome channel closed unexpectedly");
                    break;
                }
                Err(_elapsed) => {}
            }

            if state.is_finished() {
                break;
            }
        }

        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(field = self.field_id, error = %err, "worker task did not finish cleanly");
            }
        }

        let summary = state.summary();
        info!(
            field = self.field_id,
            dispatched = summary.dispatched,
            finished = summary.finished,
            failed = summary.failed,
            skipped = summary.skipped,
            "generation run finished"
        );

        if let Some(err) = source_error {
            return Err(GenerationError::RowSource(err));
        }
        if let Some(message) = state.error_message() {
            return Err(GenerationError::Aggregate(message));
        }
        Ok(summary)
    }

    async fn drain_one<H: OutcomeHandler + ?Sized>(
        &self,
        state: &mut EngineState,
        handler: &mut H,
        outcome: GenerationOutcome,
    ) {
        if !state.record_outcome(&outcome) {
            return;
        }

        match handler.handle(&outcome).await {
            Ok(()) => {}
            Err(ApplyError::RowGone(row)) => {
                debug!(field = self.field_id, row, "row vanished before apply; skipping");
                state.record_skip();
            }
            Err(err) => {
                warn!(
                    field = self.field_id,
                    row = outcome.row_id,
                    error = %err,
                    "could not apply outcome; no new rows will be dispatched"
                );
                state.record_skip();
                state.stop_accepting();
            }
        }
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<()>,
        request: GenerationRequest,
        tx: mpsc::Sender<GenerationOutcome>,
    ) {
        let field_id = self.field_id;
        let backend = Arc::clone(&self.backend);
        let model = Arc::clone(&self.model);
        let template = Arc::clone(&self.template);
        let temperature = self.temperature;

        workers.spawn(async move {
            let GenerationRequest { row_id, snapshot } = request;
            let started_at = SystemTime::now();
            let prompt = render_prompt(&template, &snapshot);

            // The call runs on its own task so a panicking backend becomes a
            // failed outcome for this row instead of a run that never drains.
            let call = tokio::spawn(async move {
                backend
                    .prompt(&model, &prompt, temperature)
                    .await
                    .map_err(|e| e.to_string())
            });
            let result = match call.await {
                Ok(result) => result,
                Err(join_err) => Err(format!("generation task failed: {join_err}")),
            };

            if let Err(message) = &result {
                warn!(field = field_id, row = row_id, error = %message, "value generation failed");
            }

            let outcome = GenerationOutcome {
                row_id,
                result,
                started_at,
                finished_at: SystemTime::now(),
            };
            if tx.send(outcome).await.is_err() {
                debug!(field = field_id, row = row_id, "orchestrator gone; dropping outcome");
            }
        });
    }
}

fn resolve_backend(
    field: &FieldSpec,
    registry: &BackendRegistry,
) -> Result<Arc<dyn GenerationBackend>, GenerationError> {
    let backend = registry
        .get(&field.backend)
        .ok_or_else(|| GenerationError::UnknownBackend(field.backend.clone()))?;

    if !backend.enabled_models().iter().any(|m| m == &field.model) {
        return Err(GenerationError::ModelUnavailable {
            backend: field.backend.clone(),
            model: field.model.clone(),
        });
    }
    Ok(backend)
}
