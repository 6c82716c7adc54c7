// src/schedule/trigger.rs

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::TriggerError;
use crate::schedule::SchedulerEvent;
use crate::store::lock;
use crate::types::FieldId;

/// Delayed task dispatcher with at most one pending task per field.
pub trait TaskTrigger: Send + Sync {
    /// Run the field's generation after `delay`.
    ///
    /// Fails with [`TriggerError::Duplicate`] while a task for `field` is
    /// still pending; the pending timer is not reset.
    fn schedule(&self, field: FieldId, delay: Duration) -> Result<(), TriggerError>;
}

/// Sleeps on the Tokio runtime, then sends [`SchedulerEvent::TimerFired`].
#[derive(Debug, Clone)]
pub struct TokioTaskTrigger {
    pending: Arc<Mutex<HashSet<FieldId>>>,
    events: mpsc::Sender<SchedulerEvent>,
}

impl TokioTaskTrigger {
    pub fn new(events: mpsc::Sender<SchedulerEvent>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashSet::new())),
            events,
        }
    }

    pub fn is_pending(&self, field: FieldId) -> bool {
        lock(&self.pending).contains(&field)
    }
}

impl TaskTrigger for TokioTaskTrigger {
    fn schedule(&self, field: FieldId, delay: Duration) -> Result<(), TriggerError> {
        if self.events.is_closed() {
            return Err(TriggerError::Closed);
        }
        let handle = Handle::try_current().map_err(|_| TriggerError::Closed)?;

        if !lock(&self.pending).insert(field) {
            return Err(TriggerError::Duplicate(field));
        }
        debug!(field, delay_ms = delay.as_millis() as u64, "generation timer armed");

        let pending = Arc::clone(&self.pending);
        let events = self.events.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&pending).remove(&field);
            if events
                .send(SchedulerEvent::TimerFired { field })
                .await
                .is_err()
            {
                debug!(field, "runtime gone; dropping timer");
            }
        });
        Ok(())
    }
}
