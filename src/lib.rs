// src/lib.rs

pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod schedule;
pub mod store;
pub mod types;

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::BackendRegistry;
use crate::cli::{CliArgs, ConsoleCommand, parse_console_line};
use crate::config::{ConfigFile, load_and_validate};
use crate::engine::FieldSpec;
use crate::engine::prompt::referenced_columns;
use crate::schedule::{
    FieldScheduler, JobMode, RuntimeOptions, SchedulerEvent, SchedulerRuntime, Services,
    TokioTaskTrigger,
};
use crate::store::{
    LogErrorSink, MemoryCatalog, MemoryKv, MemoryScheduledUpdates, MemoryTable, TableStore,
};

/// Capacity of the runtime event channel.
const EVENT_BUFFER: usize = 64;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - in-memory stores seeded from `[[row]]`
/// - the backend registry, scheduler and runtime
/// - the stdin console (disabled in `--once` mode)
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config_path = args.config_path();
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(());
    }

    let (events_tx, events_rx) = mpsc::channel::<SchedulerEvent>(EVENT_BUFFER);
    let (services, table) = in_memory_services(&cfg, events_tx.clone());
    let scheduler = Arc::new(FieldScheduler::new(services, cfg.engine, cfg.scheduler));
    let fields = cfg.field_specs();

    // Ctrl-C -> graceful shutdown.
    {
        let tx = events_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            let _ = tx.send(SchedulerEvent::ShutdownRequested).await;
        });
    }

    if args.once {
        let rows = table.row_ids().await?;
        for field in fields.iter().filter(|f| f.auto_update) {
            info!(field = field.id, rows = rows.len(), "scheduling every row");
            events_tx
                .send(SchedulerEvent::Schedule {
                    field: field.id,
                    rows: rows.clone(),
                })
                .await?;
        }
    } else {
        spawn_console(events_tx.clone(), Arc::clone(&table), fields.clone());
    }

    let options = RuntimeOptions {
        exit_when_idle: args.once,
    };
    let runtime = SchedulerRuntime::new(scheduler, events_rx, options);
    runtime.run().await?;

    if args.once {
        print!("{}", render_table(&table, &fields));
    }
    Ok(())
}

/// Services backed by in-memory stores, seeded from the config.
///
/// Timers fire into `events_tx`. The table is returned separately so callers
/// can print it.
pub fn in_memory_services(
    cfg: &ConfigFile,
    events_tx: mpsc::Sender<SchedulerEvent>,
) -> (Services, Arc<MemoryTable>) {
    let table = Arc::new(MemoryTable::from_rows(
        cfg.row.iter().map(|r| (r.id, r.values.clone())),
    ));
    let kv = Arc::new(MemoryKv::new());

    let services = Services {
        registry: Arc::new(BackendRegistry::from_config(cfg)),
        catalog: Arc::new(MemoryCatalog::new(cfg.field_specs())),
        updates: Arc::new(MemoryScheduledUpdates::new()),
        table: table.clone(),
        leases: kv.clone(),
        flags: kv,
        trigger: Arc::new(TokioTaskTrigger::new(events_tx)),
        errors: Arc::new(LogErrorSink),
    };
    (services, table)
}

/// Read console commands from stdin and forward them to the runtime.
fn spawn_console(
    events_tx: mpsc::Sender<SchedulerEvent>,
    table: Arc<MemoryTable>,
    fields: Vec<FieldSpec>,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("stdin closed; press Ctrl-C to exit");
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "failed to read stdin");
                    return;
                }
            };

            let command = match parse_console_line(&line) {
                Ok(Some(command)) => command,
                Ok(None) => continue,
                Err(message) => {
                    eprintln!("{message}");
                    continue;
                }
            };
            debug!(?command, "console command");

            let event = match command {
                ConsoleCommand::Schedule { field, rows } => SchedulerEvent::Schedule { field, rows },
                ConsoleCommand::Generate { field, rows } if rows.is_empty() => {
                    SchedulerEvent::Generate {
                        field,
                        mode: JobMode::Table { only_empty: false },
                    }
                }
                ConsoleCommand::Generate { field, rows } => SchedulerEvent::Generate {
                    field,
                    mode: JobMode::Rows(rows),
                },
                ConsoleCommand::GenerateEmpty { field } => SchedulerEvent::Generate {
                    field,
                    mode: JobMode::Table { only_empty: true },
                },
                ConsoleCommand::Enable { field } => SchedulerEvent::Enable { field },
                ConsoleCommand::Sweep => SchedulerEvent::Sweep,
                ConsoleCommand::Print => {
                    print!("{}", render_table(&table, &fields));
                    continue;
                }
                ConsoleCommand::Quit => SchedulerEvent::ShutdownRequested,
            };

            let quit = event == SchedulerEvent::ShutdownRequested;
            if events_tx.send(event).await.is_err() || quit {
                return;
            }
        }
    });
}

/// Human-readable dump of every row with its input and generated values.
pub fn render_table(table: &MemoryTable, fields: &[FieldSpec]) -> String {
    let mut out = String::new();
    for row in table.dump() {
        let _ = writeln!(out, "row {}", row.id);
        for (column, value) in &row.values {
            let _ = writeln!(out, "  {column}: {value}");
        }
        for field in fields {
            let value = row.generated.get(&field.id).map(String::as_str).unwrap_or("");
            let _ = writeln!(out, "  {} (generated): {}", field.name, value);
        }
    }
    out
}

/// Simple dry-run output: print engine settings, backends and fields.
fn print_dry_run(cfg: &ConfigFile) {
    println!("fieldgen dry-run");
    println!("  engine.max_concurrency = {}", cfg.engine.max_concurrency);
    println!("  engine.poll_interval = {:?}", cfg.engine.poll_interval);
    println!("  engine.error_policy = {:?}", cfg.engine.error_policy);
    println!("  engine.page_size = {}", cfg.engine.page_size);
    println!("  scheduler.debounce = {:?}", cfg.scheduler.debounce);
    println!("  scheduler.run_time_limit = {:?}", cfg.scheduler.run_time_limit);
    println!("  scheduler.sweep_interval = {:?}", cfg.scheduler.sweep_interval);
    println!("  scheduler.retention = {:?}", cfg.scheduler.retention);
    println!(
        "  scheduler.max_consecutive_failures = {}",
        cfg.scheduler.max_consecutive_failures
    );
    println!();

    println!("backends ({}):", cfg.backend.len());
    for (name, backend) in cfg.backend.iter() {
        println!("  - {name}");
        println!("      kind: {:?}", backend.kind);
        println!("      cmd: {}", backend.cmd);
        println!("      models: {:?}", backend.models);
    }
    println!();

    println!("fields ({}):", cfg.field.len());
    for field in cfg.field_specs() {
        println!("  - {} (id {})", field.name, field.id);
        println!("      backend: {} / model: {}", field.backend, field.model);
        println!("      prompt: {}", field.prompt);
        println!("      columns: {:?}", referenced_columns(&field.prompt));
        if let Some(t) = field.temperature {
            println!("      temperature: {t}");
        }
        if let Some(n) = field.max_concurrency {
            println!("      max_concurrency: {n}");
        }
        if !field.auto_update {
            println!("      auto_update: false");
        }
    }
    println!();
    println!("rows: {}", cfg.row.len());

    debug!("dry-run complete (no generation)");
}
