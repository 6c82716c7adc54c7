// src/store/mod.rs

//! External collaborators of the engine and scheduler.
//!
//! Every durable or shared service is an object-safe trait so a networked
//! implementation can be plugged in. The in-memory implementations here
//! back the binary and the tests:
//!
//! - [`scheduled`]: rows waiting for regeneration, per field
//! - [`kv`]: lease and reschedule-flag key-value store with expiry
//! - [`table`]: the rows themselves and the generated values
//! - [`catalog`]: generation settings of each field
//! - [`sink`]: fire-and-forget error reporting

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod catalog;
pub mod kv;
pub mod scheduled;
pub mod sink;
pub mod table;

pub use catalog::{FieldCatalog, MemoryCatalog};
pub use kv::{FlagStore, LeaseStore, LeaseToken, MemoryKv, flag_key, lease_key};
pub use scheduled::{MemoryScheduledUpdates, ScheduledRowSource, ScheduledUpdateStore};
pub use sink::{ErrorSink, LogErrorSink};
pub use table::{MemoryTable, RowFilter, TableRowSource, TableStore};

/// Lock `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
