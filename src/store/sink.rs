// src/store/sink.rs

use tracing::warn;

use crate::types::{FieldId, RowId};

/// Receives generation failures for the UI / notification layer.
///
/// Fire-and-forget: implementations must not fail the caller.
pub trait ErrorSink: Send + Sync {
    /// `rows` is empty for failures that are not tied to a row (e.g. an
    /// unusable backend).
    fn report(&self, field: FieldId, rows: &[RowId], message: &str);
}

/// Logs every report at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, field: FieldId, rows: &[RowId], message: &str) {
        warn!(field, ?rows, error = %message, "value generation error reported");
    }
}
