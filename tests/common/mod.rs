#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fieldgen::backend::BackendRegistry;
use fieldgen::engine::EngineOptions;
use fieldgen::schedule::{FieldScheduler, SchedulerOptions, Services};
use fieldgen::store::{
    LeaseStore, MemoryCatalog, MemoryKv, MemoryScheduledUpdates, MemoryTable,
};
use fieldgen::types::{ErrorPolicy, FieldId};
use fieldgen_test_utils::builders::{field_spec, id_snapshot};
use fieldgen_test_utils::fakes::{ManualTrigger, RecordingSink, ScriptedBackend};

pub use fieldgen_test_utils::{init_tracing, wait_until, with_timeout};

/// Field every harness knows about, served by the scripted backend.
pub const FIELD: FieldId = 1;

/// Model the scripted backend enables.
pub const MODEL: &str = "scripted-model";

/// Engine options tuned for tests: 3 workers and a 1ms poll.
pub fn engine_options() -> EngineOptions {
    EngineOptions {
        max_concurrency: 3,
        poll_interval: Duration::from_millis(1),
        error_policy: ErrorPolicy::First,
        page_size: 4,
    }
}

pub fn registry_with(backend: Arc<ScriptedBackend>) -> BackendRegistry {
    let mut registry = BackendRegistry::with_builtin();
    registry.register("scripted", backend);
    registry
}

/// A `FieldScheduler` over in-memory stores and a manually fired trigger.
///
/// The table holds rows 1..=10, each with an `id` column.
pub struct Harness {
    pub scheduler: Arc<FieldScheduler>,
    pub backend: Arc<ScriptedBackend>,
    pub catalog: Arc<MemoryCatalog>,
    pub updates: Arc<MemoryScheduledUpdates>,
    pub table: Arc<MemoryTable>,
    pub kv: Arc<MemoryKv>,
    pub trigger: Arc<ManualTrigger>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    pub fn new(backend: ScriptedBackend) -> Self {
        Self::with_options(backend, SchedulerOptions::default())
    }

    pub fn with_options(backend: ScriptedBackend, options: SchedulerOptions) -> Self {
        Self::with_leases(backend, options, |kv| kv as Arc<dyn LeaseStore>)
    }

    /// Like [`Harness::with_options`], with the lease store built from the
    /// harness' `MemoryKv`.
    pub fn with_leases(
        backend: ScriptedBackend,
        options: SchedulerOptions,
        leases: impl FnOnce(Arc<MemoryKv>) -> Arc<dyn LeaseStore>,
    ) -> Self {
        init_tracing();

        let backend = Arc::new(backend);
        let catalog = Arc::new(MemoryCatalog::new([field_spec(FIELD, "scripted", MODEL)]));
        let updates = Arc::new(MemoryScheduledUpdates::new());
        let table = Arc::new(MemoryTable::from_rows(
            (1..=10).map(|id| (id, id_snapshot(id))),
        ));
        let kv = Arc::new(MemoryKv::new());
        let trigger = Arc::new(ManualTrigger::new());
        let sink = Arc::new(RecordingSink::new());

        let services = Services {
            registry: Arc::new(registry_with(backend.clone())),
            catalog: catalog.clone(),
            updates: updates.clone(),
            table: table.clone(),
            leases: leases(kv.clone()),
            flags: kv.clone(),
            trigger: trigger.clone(),
            errors: sink.clone(),
        };
        let scheduler = Arc::new(FieldScheduler::new(services, engine_options(), options));

        Self {
            scheduler,
            backend,
            catalog,
            updates,
            table,
            kv,
            trigger,
            sink,
        }
    }
}
