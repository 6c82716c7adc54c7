// src/config/mod.rs

//! Configuration loading and validation for fieldgen.
//!
//! - [`model`] is the TOML-backed data model (raw and validated forms).
//! - [`loader`] reads a config file from disk.
//! - [`validate`] turns a `RawConfigFile` into a `ConfigFile`.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{
    BackendConfig, BackendKind, ConfigFile, EngineSection, FieldConfig, RawConfigFile,
    RowConfig, SchedulerSection,
};
