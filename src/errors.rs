// src/errors.rs

//! Crate-wide error types and aliases.

use thiserror::Error;

use crate::types::{FieldId, RowId};

/// Failures of a single backend call for one row.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("{0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure to persist a generated value.
///
/// `RowGone` is the soft case: the row vanished between dispatch and apply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("row {0} no longer exists")]
    RowGone(RowId),

    #[error("could not apply value: {0}")]
    Store(String),
}

/// Failures of an external store (scheduled updates, tables, key-value).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Rejection from the delayed task trigger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("a generation task for field {0} is already pending")]
    Duplicate(FieldId),

    #[error("task trigger is shut down")]
    Closed,
}

/// Errors surfaced by the generation engine.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("unknown generation backend '{0}'")]
    UnknownBackend(String),

    #[error("model '{model}' is not available for backend '{backend}'")]
    ModelUnavailable { backend: String, model: String },

    #[error("AI model responded with errors: {0}")]
    Aggregate(String),

    #[error("row source failed: {0}")]
    RowSource(#[from] StoreError),
}

impl GenerationError {
    /// True for errors raised by `prepare` before any row is processed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GenerationError::UnknownBackend(_) | GenerationError::ModelUnavailable { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum FieldgenError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, FieldgenError>;
