// src/engine/state.rs

//! Pure per-run state of the generation engine.
//!
//! This is the single source of truth for a run's counters. It has no
//! channels, no Tokio types, and performs no IO, so the invariants can be
//! tested (and property tested) without spawning anything:
//!
//! - `0 < in_process.len() <= max_concurrency` while dispatching
//! - a row id is in `in_process` at most once
//! - `accepting_more` only ever goes from `true` to `false`
//! - the run is finished iff nothing is in process and nothing more is accepted

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::engine::{GenerationOutcome, RunSummary};
use crate::types::{ErrorPolicy, RowId};

#[derive(Debug)]
pub struct EngineState {
    max_concurrency: usize,
    in_process: HashSet<RowId>,
    accepting_more: bool,
    error_policy: ErrorPolicy,
    errors: Vec<String>,
    dispatched: usize,
    finished: usize,
    failed: usize,
    skipped: usize,
    peak_in_process: usize,
}

impl EngineState {
    /// `max_concurrency` is clamped to at least 1.
    pub fn new(max_concurrency: usize, error_policy: ErrorPolicy) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            in_process: HashSet::new(),
            accepting_more: true,
            error_policy,
            errors: Vec::new(),
            dispatched: 0,
            finished: 0,
            failed: 0,
            skipped: 0,
            peak_in_process: 0,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// True if a free slot exists and the run still accepts rows.
    pub fn can_dispatch(&self) -> bool {
        self.accepting_more && self.in_process.len() < self.max_concurrency
    }

    /// Record that `row_id` was handed to a worker.
    ///
    /// Returns `false` (and records nothing) when there is no free slot or
    /// the row is already in process.
    pub fn record_dispatch(&mut self, row_id: RowId) -> bool {
        if !self.can_dispatch() {
            return false;
        }
        if !self.in_process.insert(row_id) {
            warn!(row = row_id, "row already in process; not dispatching twice");
            return false;
        }

        self.dispatched += 1;
        self.peak_in_process = self.peak_in_process.max(self.in_process.len());
        true
    }

    /// Account for a drained outcome.
    ///
    /// A failed outcome stops further dispatch and keeps its message
    /// according to the error policy. Returns `false` for an outcome whose
    /// row was not in process.
    pub fn record_outcome(&mut self, outcome: &GenerationOutcome) -> bool {
        if !self.in_process.remove(&outcome.row_id) {
            warn!(row = outcome.row_id, "outcome for a row that is not in process");
            return false;
        }

        self.finished += 1;

        if let Err(message) = &outcome.result {
            self.failed += 1;
            self.record_error(message.clone());
            self.stop_accepting();
        }
        true
    }

    /// Count an outcome the handler could not apply.
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    fn record_error(&mut self, message: String) {
        match self.error_policy {
            ErrorPolicy::First if !self.errors.is_empty() => {
                debug!(error = %message, "additional row error; keeping first message");
            }
            _ => self.errors.push(message),
        }
    }

    /// Stop producing new dispatches. One-way.
    pub fn stop_accepting(&mut self) {
        if self.accepting_more {
            debug!(in_process = self.in_process.len(), "engine stopped accepting rows");
        }
        self.accepting_more = false;
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting_more
    }

    pub fn is_finished(&self) -> bool {
        self.in_process.is_empty() && !self.accepting_more
    }

    pub fn is_in_process(&self, row_id: RowId) -> bool {
        self.in_process.contains(&row_id)
    }

    pub fn in_process_len(&self) -> usize {
        self.in_process.len()
    }

    /// Largest number of rows that were in process at the same time.
    pub fn peak_in_process(&self) -> usize {
        self.peak_in_process
    }

    pub fn finished_count(&self) -> usize {
        self.finished
    }

    /// The aggregate error message, if any row failed.
    pub fn error_message(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(self.errors.join("; "))
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            dispatched: self.dispatched,
            finished: self.finished,
            failed: self.failed,
            skipped: self.skipped,
        }
    }
}
