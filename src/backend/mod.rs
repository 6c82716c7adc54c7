// src/backend/mod.rs

//! Pluggable generation backend abstraction.
//!
//! The engine talks to a `GenerationBackend` instead of a concrete model
//! client. Backends are looked up by name in an explicit [`BackendRegistry`]
//! that is built once from config and injected into the engine.
//!
//! - [`EchoBackend`] is built in and returns the rendered prompt as-is.
//! - [`CommandBackend`](command::CommandBackend) runs a shell command per
//!   row, feeding the prompt on stdin.
//! - Tests provide their own implementations (failing rows, slow rows, ...).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{BackendKind, ConfigFile};
use crate::errors::BackendError;
use crate::types::BoxFuture;

pub mod command;

pub use command::CommandBackend;

/// Name and sole model of the built-in [`EchoBackend`].
pub const ECHO_BACKEND: &str = "echo";

/// A model provider able to answer one prompt at a time.
///
/// Implementations must be safe to call concurrently for distinct rows.
pub trait GenerationBackend: Send + Sync {
    /// Models that fields may use with this backend.
    fn enabled_models(&self) -> Vec<String>;

    /// Send `prompt` to `model` and return its answer.
    fn prompt<'a>(
        &'a self,
        model: &'a str,
        prompt: &'a str,
        temperature: Option<f32>,
    ) -> BoxFuture<'a, Result<String, BackendError>>;
}

/// Returns the prompt it was given.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoBackend;

impl GenerationBackend for EchoBackend {
    fn enabled_models(&self) -> Vec<String> {
        vec![ECHO_BACKEND.to_string()]
    }

    fn prompt<'a>(
        &'a self,
        _model: &'a str,
        prompt: &'a str,
        _temperature: Option<f32>,
    ) -> BoxFuture<'a, Result<String, BackendError>> {
        Box::pin(std::future::ready(Ok(prompt.to_string())))
    }
}

/// Explicit name -> backend mapping.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn GenerationBackend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendRegistry {
    /// Empty registry; see [`BackendRegistry::with_builtin`] for the default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry containing only the built-in `echo` backend.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ECHO_BACKEND, Arc::new(EchoBackend));
        registry
    }

    /// Built-in backends plus every `[backend.<name>]` from config.
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let mut registry = Self::with_builtin();
        for (name, bc) in cfg.backend.iter() {
            let backend: Arc<dyn GenerationBackend> = match bc.kind {
                BackendKind::Command => {
                    Arc::new(CommandBackend::new(bc.cmd.clone(), bc.models.clone()))
                }
            };
            registry.register(name, backend);
        }
        registry
    }

    /// Register (or replace) a backend under `name`.
    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn GenerationBackend>) {
        self.backends.insert(name.into(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(|s| s.as_str())
    }
}
