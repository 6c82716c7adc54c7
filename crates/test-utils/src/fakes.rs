use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fieldgen::backend::GenerationBackend;
use fieldgen::engine::{GenerationOutcome, OutcomeHandler};
use fieldgen::errors::{ApplyError, BackendError, StoreError, TriggerError};
use fieldgen::schedule::TaskTrigger;
use fieldgen::store::{ErrorSink, LeaseStore, LeaseToken, MemoryKv};
use fieldgen::types::{BoxFuture, FieldId, RowId};
use tokio::sync::Semaphore;

/// Scriptable backend that answers `"value for <prompt>"`.
///
/// It fails or panics for chosen prompts, can sleep per call, can block
/// every call until the test hands out permits, and tracks how many calls
/// were in flight at once.
pub struct ScriptedBackend {
    models: Vec<String>,
    fail: HashSet<String>,
    panic: HashSet<String>,
    slow: HashMap<String, Duration>,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(models: &[&str]) -> Self {
        Self {
            models: models.iter().map(|m| m.to_string()).collect(),
            fail: HashSet::new(),
            panic: HashSet::new(),
            slow: HashMap::new(),
            delay: Duration::ZERO,
            gate: None,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the call whose prompt is exactly `prompt`.
    pub fn failing_on(mut self, prompt: &str) -> Self {
        self.fail.insert(prompt.to_string());
        self
    }

    pub fn panicking_on(mut self, prompt: &str) -> Self {
        self.panic.insert(prompt.to_string());
        self
    }

    /// Sleep `delay` in the call for `prompt` instead of the default delay.
    pub fn slow_on(mut self, prompt: &str, delay: Duration) -> Self {
        self.slow.insert(prompt.to_string(), delay);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block every call until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Most calls that were in flight at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Prompts in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GenerationBackend for ScriptedBackend {
    fn enabled_models(&self) -> Vec<String> {
        self.models.clone()
    }

    fn prompt<'a>(
        &'a self,
        _model: &'a str,
        prompt: &'a str,
        _temperature: Option<f32>,
    ) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(prompt.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            let delay = self.slow.get(prompt).copied().unwrap_or(self.delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.panic.contains(prompt) {
                panic!("scripted panic for '{prompt}'");
            }
            if self.fail.contains(prompt) {
                return Err(BackendError::Failed(format!("scripted failure for '{prompt}'")));
            }
            Ok(format!("value for {prompt}"))
        })
    }
}

/// One call of [`ErrorSink::report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub field: FieldId,
    pub rows: Vec<RowId>,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<Report>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap().clone()
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, field: FieldId, rows: &[RowId], message: &str) {
        self.reports.lock().unwrap().push(Report {
            field,
            rows: rows.to_vec(),
            message: message.to_string(),
        });
    }
}

/// Handler that records every outcome it sees and applies successful ones.
///
/// Rows in `gone` answer [`ApplyError::RowGone`]; rows in `broken` answer
/// [`ApplyError::Store`].
#[derive(Default)]
pub struct RecordingHandler {
    pub outcomes: Vec<GenerationOutcome>,
    pub applied: HashMap<RowId, String>,
    pub gone: HashSet<RowId>,
    pub broken: HashSet<RowId>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gone(mut self, row: RowId) -> Self {
        self.gone.insert(row);
        self
    }

    pub fn with_broken(mut self, row: RowId) -> Self {
        self.broken.insert(row);
        self
    }

    pub fn seen_rows(&self) -> Vec<RowId> {
        let mut rows: Vec<RowId> = self.outcomes.iter().map(|o| o.row_id).collect();
        rows.sort_unstable();
        rows
    }
}

impl OutcomeHandler for RecordingHandler {
    fn handle<'a>(
        &'a mut self,
        outcome: &'a GenerationOutcome,
    ) -> BoxFuture<'a, Result<(), ApplyError>> {
        self.outcomes.push(outcome.clone());
        let result = match &outcome.result {
            Err(_) => Ok(()),
            Ok(_) if self.gone.contains(&outcome.row_id) => Err(ApplyError::RowGone(outcome.row_id)),
            Ok(_) if self.broken.contains(&outcome.row_id) => {
                Err(ApplyError::Store("scripted apply failure".to_string()))
            }
            Ok(value) => {
                self.applied.insert(outcome.row_id, value.clone());
                Ok(())
            }
        };
        Box::pin(std::future::ready(result))
    }
}

/// Trigger that only records calls. Timers never fire on their own; a test
/// fires one with [`ManualTrigger::fire`].
#[derive(Default)]
pub struct ManualTrigger {
    pending: Mutex<HashSet<FieldId>>,
    calls: Mutex<Vec<(FieldId, Duration)>>,
}

impl ManualTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `schedule` call, including rejected duplicates.
    pub fn calls(&self) -> Vec<(FieldId, Duration)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_pending(&self, field: FieldId) -> bool {
        self.pending.lock().unwrap().contains(&field)
    }

    /// Let the pending timer of `field` elapse; `false` if none was pending.
    pub fn fire(&self, field: FieldId) -> bool {
        self.pending.lock().unwrap().remove(&field)
    }
}

impl TaskTrigger for ManualTrigger {
    fn schedule(&self, field: FieldId, delay: Duration) -> Result<(), TriggerError> {
        self.calls.lock().unwrap().push((field, delay));
        if !self.pending.lock().unwrap().insert(field) {
            return Err(TriggerError::Duplicate(field));
        }
        Ok(())
    }
}

/// Lease store over a [`MemoryKv`] whose `is_held` answer is read at call
/// time but only returned once the test adds a permit to the gate.
///
/// Lets a test change the lease between the moment a caller looks at it and
/// the moment the caller acts on the answer.
pub struct LaggingLeases {
    inner: Arc<MemoryKv>,
    gate: Arc<Semaphore>,
    waiting: AtomicUsize,
}

impl LaggingLeases {
    pub fn new(inner: Arc<MemoryKv>, gate: Arc<Semaphore>) -> Self {
        Self {
            inner,
            gate,
            waiting: AtomicUsize::new(0),
        }
    }

    /// `is_held` calls currently held at the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

impl LeaseStore for LaggingLeases {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<Option<LeaseToken>, StoreError>> {
        self.inner.acquire(key, ttl)
    }

    fn renew<'a>(
        &'a self,
        key: &'a str,
        token: LeaseToken,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        self.inner.renew(key, token, ttl)
    }

    fn release<'a>(
        &'a self,
        key: &'a str,
        token: LeaseToken,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        self.inner.release(key, token)
    }

    fn is_held<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, StoreError>> {
        let answer = self.inner.is_held(key);
        Box::pin(async move {
            let held = answer.await?;
            self.waiting.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.expect("gate closed").forget();
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            Ok(held)
        })
    }
}
