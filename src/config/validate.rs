// src/config/validate.rs

use std::collections::HashSet;
use std::time::Duration;

use crate::backend::ECHO_BACKEND;
use crate::config::model::{ConfigFile, RawConfigFile};
use crate::engine::EngineOptions;
use crate::errors::{FieldgenError, Result};
use crate::schedule::SchedulerOptions;
use crate::types::parse_duration;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::FieldgenError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        let engine = engine_options(&raw)?;
        let scheduler = scheduler_options(&raw)?;
        Ok(ConfigFile::new_unchecked(
            engine,
            scheduler,
            raw.backend,
            raw.field,
            raw.row,
        ))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_engine(cfg)?;
    validate_backends(cfg)?;
    validate_fields(cfg)?;
    validate_rows(cfg)?;
    Ok(())
}

fn validate_engine(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.max_concurrency == 0 {
        return Err(FieldgenError::ConfigError(
            "[engine].max_concurrency must be >= 1 (got 0)".to_string(),
        ));
    }
    if cfg.engine.page_size == 0 {
        return Err(FieldgenError::ConfigError(
            "[engine].page_size must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_backends(cfg: &RawConfigFile) -> Result<()> {
    for (name, backend) in cfg.backend.iter() {
        if name == ECHO_BACKEND {
            return Err(FieldgenError::ConfigError(format!(
                "backend name '{}' is reserved for the built-in backend",
                name
            )));
        }
        if backend.cmd.trim().is_empty() {
            return Err(FieldgenError::ConfigError(format!(
                "backend '{}' has an empty `cmd`",
                name
            )));
        }
    }
    Ok(())
}

fn validate_fields(cfg: &RawConfigFile) -> Result<()> {
    let mut seen_ids = HashSet::new();

    for (name, field) in cfg.field.iter() {
        if !seen_ids.insert(field.id) {
            return Err(FieldgenError::ConfigError(format!(
                "field '{}' reuses id {} already taken by another field",
                name, field.id
            )));
        }
        if field.backend != ECHO_BACKEND && !cfg.backend.contains_key(&field.backend) {
            return Err(FieldgenError::ConfigError(format!(
                "field '{}' has unknown backend '{}'",
                name, field.backend
            )));
        }
        if field.max_concurrency == Some(0) {
            return Err(FieldgenError::ConfigError(format!(
                "field '{}' has max_concurrency = 0; it must be >= 1",
                name
            )));
        }
    }
    Ok(())
}

fn validate_rows(cfg: &RawConfigFile) -> Result<()> {
    let mut seen = HashSet::new();
    for row in cfg.row.iter() {
        if !seen.insert(row.id) {
            return Err(FieldgenError::ConfigError(format!(
                "row id {} appears more than once",
                row.id
            )));
        }
    }
    Ok(())
}

fn duration(section: &str, key: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| {
        FieldgenError::ConfigError(format!("[{}].{}: {}", section, key, e))
    })
}

fn non_zero(section: &str, key: &str, value: &str) -> Result<Duration> {
    let d = duration(section, key, value)?;
    if d.is_zero() {
        return Err(FieldgenError::ConfigError(format!(
            "[{}].{} must be greater than zero",
            section, key
        )));
    }
    Ok(d)
}

fn engine_options(cfg: &RawConfigFile) -> Result<EngineOptions> {
    let e = &cfg.engine;
    Ok(EngineOptions {
        max_concurrency: e.max_concurrency,
        poll_interval: non_zero("engine", "poll_interval", &e.poll_interval)?,
        error_policy: e.error_policy,
        page_size: e.page_size,
    })
}

fn scheduler_options(cfg: &RawConfigFile) -> Result<SchedulerOptions> {
    let s = &cfg.scheduler;
    Ok(SchedulerOptions {
        debounce: duration("scheduler", "debounce", &s.debounce)?,
        run_time_limit: non_zero("scheduler", "run_time_limit", &s.run_time_limit)?,
        flag_expiry: non_zero("scheduler", "flag_expiry", &s.flag_expiry)?,
        sweep_interval: non_zero("scheduler", "sweep_interval", &s.sweep_interval)?,
        sweep_time_limit: non_zero("scheduler", "sweep_time_limit", &s.sweep_time_limit)?,
        retention: non_zero("scheduler", "retention", &s.retention)?,
        max_consecutive_failures: s.max_consecutive_failures,
    })
}
