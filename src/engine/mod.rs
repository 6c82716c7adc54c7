// src/engine/mod.rs

//! Bounded-concurrency value generation engine.
//!
//! This module ties together:
//! - the pure run state machine ([`state`]) that owns all counters
//! - the async orchestrator ([`generator`]) that pulls rows from a cursor,
//!   fans them out to worker tasks and drains their outcomes
//! - row cursors ([`cursor`]) that lazily feed requests into a run
//! - prompt rendering ([`prompt`]) done inside each worker
//!
//! Workers never touch shared state: they only send immutable
//! [`GenerationOutcome`]s back over a bounded channel. Every mutation of
//! storage happens on the orchestrating task through an [`OutcomeHandler`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use crate::errors::ApplyError;
use crate::types::{BoxFuture, ErrorPolicy, FieldId, RowId, RowSnapshot};

pub mod cursor;
pub mod generator;
pub mod prompt;
pub mod state;

pub use cursor::{IterCursor, Page, PagedCursor, RowCursor, RowSource};
pub use generator::Generator;
pub use state::EngineState;

/// Generation settings of one field, as known to the catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub id: FieldId,
    pub name: String,
    /// Key into the [`BackendRegistry`](crate::backend::BackendRegistry).
    pub backend: String,
    pub model: String,
    pub prompt: String,
    pub temperature: Option<f32>,
    /// Per-field override of [`EngineOptions::max_concurrency`].
    pub max_concurrency: Option<usize>,
    pub auto_update: bool,
}

/// Engine-wide knobs from `[engine]`.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub error_policy: ErrorPolicy,
    pub page_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            poll_interval: Duration::from_millis(10),
            error_policy: ErrorPolicy::First,
            page_size: 200,
        }
    }
}

/// One row needing a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub row_id: RowId,
    pub snapshot: RowSnapshot,
}

impl GenerationRequest {
    pub fn new(row_id: RowId, snapshot: RowSnapshot) -> Self {
        Self { row_id, snapshot }
    }
}

/// Result of processing one request. Exactly one of value / error is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub row_id: RowId,
    pub result: Result<String, String>,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
}

impl GenerationOutcome {
    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}

/// Counters reported by a run that did not fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: usize,
    pub finished: usize,
    pub failed: usize,
    /// Rows that were yielded but not applied: duplicates of a row still in
    /// flight, soft skips and apply errors.
    pub skipped: usize,
}

/// Consumer of outcomes, called only on the orchestrating task.
///
/// Returning [`ApplyError::RowGone`] marks a soft skip. Any other error stops
/// dispatching new rows but does not fail the run.
pub trait OutcomeHandler: Send {
    fn handle<'a>(&'a mut self, outcome: &'a GenerationOutcome)
    -> BoxFuture<'a, Result<(), ApplyError>>;
}

/// Cooperative stop signal checked at every dispatch opportunity.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
