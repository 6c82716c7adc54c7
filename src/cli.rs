// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::default_config_path;
use crate::types::{FieldId, RowId};

/// Command-line arguments for `fieldgen`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "fieldgen",
    version,
    about = "Generate field values for table rows with debounced, bounded-concurrency runs.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Fieldgen.toml` in the current working directory.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Schedule every row of every auto-update field, run until idle, print
    /// the table and exit.
    #[arg(long)]
    pub once: bool,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FIELDGEN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the configuration, but don't generate anything.
    #[arg(long)]
    pub dry_run: bool,
}

impl CliArgs {
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

/// One line typed on stdin in interactive mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// `schedule <field> <row>...`
    Schedule { field: FieldId, rows: Vec<RowId> },
    /// `generate <field> [row...]`; no rows means the whole table.
    Generate { field: FieldId, rows: Vec<RowId> },
    /// `generate-empty <field>`: table rows without a value yet.
    GenerateEmpty { field: FieldId },
    /// `enable <field>`
    Enable { field: FieldId },
    Sweep,
    Print,
    Quit,
}

/// Parse one console line; `Ok(None)` for blank lines.
pub fn parse_console_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match verb {
        "schedule" => {
            let (field, rows) = field_and_rows(&args)?;
            if rows.is_empty() {
                return Err("usage: schedule <field> <row>...".to_string());
            }
            ConsoleCommand::Schedule { field, rows }
        }
        "generate" => {
            let (field, rows) = field_and_rows(&args)?;
            ConsoleCommand::Generate { field, rows }
        }
        "generate-empty" => ConsoleCommand::GenerateEmpty {
            field: single_field(&args)?,
        },
        "enable" => ConsoleCommand::Enable {
            field: single_field(&args)?,
        },
        "sweep" => ConsoleCommand::Sweep,
        "print" => ConsoleCommand::Print,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

fn field_and_rows(args: &[&str]) -> Result<(FieldId, Vec<RowId>), String> {
    let (first, rest) = args
        .split_first()
        .ok_or_else(|| "missing field id".to_string())?;
    let field = parse_id(first)?;
    let rows = rest.iter().map(|s| parse_id(s)).collect::<Result<_, _>>()?;
    Ok((field, rows))
}

fn single_field(args: &[&str]) -> Result<FieldId, String> {
    match args {
        [field] => parse_id(field),
        _ => Err("expected exactly one field id".to_string()),
    }
}

fn parse_id(s: &str) -> Result<u64, String> {
    s.parse().map_err(|_| format!("invalid id '{s}'"))
}
