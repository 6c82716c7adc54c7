use std::collections::BTreeMap;

use fieldgen::config::{
    BackendConfig, BackendKind, ConfigFile, EngineSection, FieldConfig, RawConfigFile, RowConfig,
    SchedulerSection,
};
use fieldgen::engine::{FieldSpec, GenerationRequest};
use fieldgen::types::{FieldId, RowId, RowSnapshot};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                engine: EngineSection::default(),
                scheduler: SchedulerSection::default(),
                backend: BTreeMap::new(),
                field: BTreeMap::new(),
                row: Vec::new(),
            },
        }
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.config.engine.max_concurrency = n;
        self
    }

    pub fn with_debounce(mut self, d: &str) -> Self {
        self.config.scheduler.debounce = d.to_string();
        self
    }

    pub fn with_command_backend(mut self, name: &str, cmd: &str, models: &[&str]) -> Self {
        self.config.backend.insert(
            name.to_string(),
            BackendConfig {
                kind: BackendKind::Command,
                cmd: cmd.to_string(),
                models: models.iter().map(|m| m.to_string()).collect(),
            },
        );
        self
    }

    pub fn with_field(mut self, name: &str, field: FieldConfig) -> Self {
        self.config.field.insert(name.to_string(), field);
        self
    }

    pub fn with_row(mut self, id: RowId, values: &[(&str, &str)]) -> Self {
        self.config.row.push(RowConfig {
            id,
            values: snapshot(values),
        });
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn try_build(self) -> anyhow::Result<ConfigFile> {
        Ok(ConfigFile::try_from(self.config)?)
    }

    pub fn build(self) -> ConfigFile {
        self.try_build()
            .expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `FieldConfig`; defaults to the built-in echo backend.
pub struct FieldConfigBuilder {
    field: FieldConfig,
}

impl FieldConfigBuilder {
    pub fn new(id: FieldId, prompt: &str) -> Self {
        Self {
            field: FieldConfig {
                id,
                backend: "echo".to_string(),
                model: "echo".to_string(),
                prompt: prompt.to_string(),
                temperature: None,
                max_concurrency: None,
                auto_update: true,
            },
        }
    }

    pub fn backend(mut self, backend: &str, model: &str) -> Self {
        self.field.backend = backend.to_string();
        self.field.model = model.to_string();
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.field.max_concurrency = Some(n);
        self
    }

    pub fn auto_update(mut self, enabled: bool) -> Self {
        self.field.auto_update = enabled;
        self
    }

    pub fn build(self) -> FieldConfig {
        self.field
    }
}

/// Field spec using `backend`/`model` whose prompt is `"row {id}"`.
pub fn field_spec(id: FieldId, backend: &str, model: &str) -> FieldSpec {
    FieldSpec {
        id,
        name: format!("field_{id}"),
        backend: backend.to_string(),
        model: model.to_string(),
        prompt: "row {id}".to_string(),
        temperature: None,
        max_concurrency: None,
        auto_update: true,
    }
}

pub fn snapshot(values: &[(&str, &str)]) -> RowSnapshot {
    values
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Snapshot with a single `id` column, matching [`field_spec`]'s prompt.
pub fn id_snapshot(row: RowId) -> RowSnapshot {
    snapshot(&[("id", &row.to_string())])
}

/// Requests for `ids`, each with an [`id_snapshot`].
pub fn requests(ids: impl IntoIterator<Item = RowId>) -> Vec<GenerationRequest> {
    ids.into_iter()
        .map(|id| GenerationRequest::new(id, id_snapshot(id)))
        .collect()
}
