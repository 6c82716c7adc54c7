// src/config/model.rs

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::engine::{EngineOptions, FieldSpec};
use crate::schedule::SchedulerOptions;
use crate::types::{ErrorPolicy, FieldId, RowId};

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [engine]
/// max_concurrency = 5
/// error_policy = "first"
///
/// [scheduler]
/// debounce = "3s"
///
/// [backend.shout]
/// kind = "command"
/// cmd = "tr a-z A-Z"
/// models = ["upper"]
///
/// [field.summary]
/// id = 1
/// backend = "echo"
/// model = "echo"
/// prompt = "Summarise {title}"
///
/// [[row]]
/// id = 1
/// values = { title = "hello" }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub scheduler: SchedulerSection,

    /// Named generation backends from `[backend.<name>]`.
    #[serde(default)]
    pub backend: BTreeMap<String, BackendConfig>,

    /// Generated fields from `[field.<name>]`.
    #[serde(default)]
    pub field: BTreeMap<String, FieldConfig>,

    /// Seed rows for the in-memory table from `[[row]]`.
    #[serde(default)]
    pub row: Vec<RowConfig>,
}

/// `[engine]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// Default number of rows generated concurrently per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How long the orchestrator waits for an outcome before dispatching again.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default)]
    pub error_policy: ErrorPolicy,

    /// Rows fetched per page from a row source.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_poll_interval() -> String {
    "10ms".to_string()
}

fn default_page_size() -> usize {
    200
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            poll_interval: default_poll_interval(),
            error_policy: ErrorPolicy::default(),
            page_size: default_page_size(),
        }
    }
}

/// `[scheduler]` section. All durations use the `<n><ms|s|m|h>` syntax.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    /// Quiet period between the first dirty mark and the generation run.
    #[serde(default = "default_debounce")]
    pub debounce: String,

    /// Hard limit for one field run; also the lease expiry.
    #[serde(default = "default_run_time_limit")]
    pub run_time_limit: String,

    /// Expiry of the reschedule flag.
    #[serde(default = "default_flag_expiry")]
    pub flag_expiry: String,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,

    #[serde(default = "default_sweep_time_limit")]
    pub sweep_time_limit: String,

    /// Scheduled updates older than this are garbage collected by the sweep.
    #[serde(default = "default_retention")]
    pub retention: String,

    /// Disable auto-update after this many failed runs in a row (0 = never).
    #[serde(default)]
    pub max_consecutive_failures: u32,
}

fn default_debounce() -> String {
    "3s".to_string()
}

fn default_run_time_limit() -> String {
    "30m".to_string()
}

fn default_flag_expiry() -> String {
    "60m".to_string()
}

fn default_sweep_interval() -> String {
    "5m".to_string()
}

fn default_sweep_time_limit() -> String {
    "5m".to_string()
}

fn default_retention() -> String {
    "72h".to_string()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            run_time_limit: default_run_time_limit(),
            flag_expiry: default_flag_expiry(),
            sweep_interval: default_sweep_interval(),
            sweep_time_limit: default_sweep_time_limit(),
            retention: default_retention(),
            max_consecutive_failures: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Run a shell command per row; the prompt is written to stdin.
    Command,
}

/// `[backend.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,

    pub cmd: String,

    /// Models this backend accepts. A field naming any other model fails
    /// to prepare.
    #[serde(default)]
    pub models: Vec<String>,
}

/// `[field.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    pub id: FieldId,

    /// Name of a `[backend.<name>]` entry or the built-in `echo`.
    pub backend: String,

    pub model: String,

    /// Prompt template; `{column}` is replaced with the row's value.
    pub prompt: String,

    #[serde(default)]
    pub temperature: Option<f32>,

    /// Overrides `[engine].max_concurrency` for this field.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default = "default_auto_update")]
    pub auto_update: bool,
}

fn default_auto_update() -> bool {
    true
}

impl FieldConfig {
    pub fn to_spec(&self, name: &str) -> FieldSpec {
        FieldSpec {
            id: self.id,
            name: name.to_string(),
            backend: self.backend.clone(),
            model: self.model.clone(),
            prompt: self.prompt.clone(),
            temperature: self.temperature,
            max_concurrency: self.max_concurrency,
            auto_update: self.auto_update,
        }
    }
}

/// `[[row]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RowConfig {
    pub id: RowId,

    #[serde(default)]
    pub values: BTreeMap<String, String>,
}

/// Validated configuration.
///
/// Only constructed through `TryFrom<RawConfigFile>`, so durations are
/// already parsed and cross references are known to resolve.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineOptions,
    pub scheduler: SchedulerOptions,
    pub backend: BTreeMap<String, BackendConfig>,
    pub field: BTreeMap<String, FieldConfig>,
    pub row: Vec<RowConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        engine: EngineOptions,
        scheduler: SchedulerOptions,
        backend: BTreeMap<String, BackendConfig>,
        field: BTreeMap<String, FieldConfig>,
        row: Vec<RowConfig>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            backend,
            field,
            row,
        }
    }

    /// Field specs in config order (sorted by field name).
    pub fn field_specs(&self) -> Vec<FieldSpec> {
        self.field
            .iter()
            .map(|(name, fc)| fc.to_spec(name))
            .collect()
    }
}
