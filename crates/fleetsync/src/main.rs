//! `fleetsync` - CLI for the fleetsync telemetry daemon
//!
//! This binary runs the daemon and provides maintenance commands for the
//! local buffer and configuration.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;

use fleetsync::cli::{BufferCommand, Cli, Command, ConfigCommand, SyncCommand};
use fleetsync::connectivity::ConnectivityMonitor;
use fleetsync::orchestrator::{Components, Orchestrator, OrchestratorSettings, ShutdownReason};
use fleetsync::{init_logging, BufferStore, Config, Error, SyncEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // These work without (or despite) a loadable configuration
    if let Command::Config(ConfigCommand::Path) = &cli.command {
        println!("{}", Config::default_config_path().display());
        return Ok(());
    }
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        let path = file
            .clone()
            .or_else(|| cli.config.clone())
            .unwrap_or_else(Config::default_config_path);
        println!("Validating configuration: {}", path.display());
        match Config::load_from(Some(path)) {
            Ok(_) => println!("Configuration is valid."),
            Err(e) => bail!("configuration error: {e}"),
        }
        return Ok(());
    }

    // Load configuration
    let config = Config::load_from(cli.config.clone()).context("loading configuration")?;

    // Initialize logging based on verbosity
    let _log_guard = init_logging(cli.verbosity(), config.logging.directory.as_deref())?;

    // Execute the command
    match cli.command {
        Command::Run => handle_run(&config).await,
        Command::Status(status_cmd) => handle_status(&config, status_cmd.json),
        Command::Sync(sync_cmd) => handle_sync(&config, &sync_cmd).await,
        Command::Buffer(buffer_cmd) => handle_buffer(&config, &buffer_cmd),
        Command::Config(config_cmd) => handle_config(&config, &config_cmd),
    }
}

async fn handle_run(config: &Config) -> anyhow::Result<()> {
    let components = Components::from_config(config).context("starting components")?;
    let orchestrator = Orchestrator::new(OrchestratorSettings::from_config(config), components);

    match orchestrator.run().await? {
        ShutdownReason::ComponentFailed {
            component,
            restarts,
        } => Err(Error::ComponentFailed {
            component,
            restarts,
        }
        .into()),
        _ => Ok(()),
    }
}

fn open_buffer(config: &Config) -> anyhow::Result<BufferStore> {
    let path = config.database_path();
    BufferStore::open(&path, config.buffer_options())
        .with_context(|| format!("opening buffer at {}", path.display()))
}

/// Open the buffer for commands that only read it.
fn inspect_buffer(config: &Config) -> anyhow::Result<BufferStore> {
    let path = config.database_path();
    BufferStore::open_read_only(&path, config.buffer_options())
        .with_context(|| format!("opening buffer read-only at {}", path.display()))
}

fn handle_status(config: &Config, json: bool) -> anyhow::Result<()> {
    let buffer = inspect_buffer(config)?;
    let stats = buffer.stats()?;

    if json {
        let status = serde_json::json!({
            "device_id": config.device.id,
            "database_path": config.database_path(),
            "buffer": stats,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("fleetsync status");
        println!("----------------");
        println!("Device:        {}", config.device.id);
        println!("Database:      {}", config.database_path().display());
        println!(
            "Stored:        {} / {} bytes ({} on disk)",
            stats.stored_bytes, stats.max_size_bytes, stats.db_size_bytes
        );
        println!();
        println!("Pending:       {}", stats.pending);
        println!("In flight:     {}", stats.in_flight);
        println!("Synced:        {}", stats.synced);
        println!("Failed:        {}", stats.failed);
        println!();
        println!("Last sequence: {}", stats.last_sequence);
        println!("Sync cursor:   {}", stats.sync_cursor);
        println!("Total synced:  {}", stats.total_synced);
        println!("Evicted:       {} (unsynced)", stats.evicted_unsynced);
        println!("Exhausted:     {}", stats.retry_exhausted);
        if let (Some(oldest), Some(newest)) = (stats.oldest_entry, stats.newest_entry) {
            println!("Entries span:  {oldest} .. {newest}");
        }
    }
    Ok(())
}

async fn handle_sync(config: &Config, cmd: &SyncCommand) -> anyhow::Result<()> {
    let components = Components::from_config(config)?;

    let monitor = ConnectivityMonitor::new();
    let reachable = tokio::time::timeout(config.probe_timeout(), components.probe.probe())
        .await
        .unwrap_or(false);
    monitor.observe(reachable);

    let engine = SyncEngine::new(
        Arc::clone(&components.buffer),
        Arc::clone(&components.remote),
        config.sync.compression.compressor(),
        monitor.subscribe(),
        config.sync_options(),
    );
    let result = if cmd.flush {
        engine.flush(config.shutdown_grace()).await?
    } else {
        engine.run_cycle().await?
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Connectivity:  {}", monitor.state());
        println!("Outcome:       {:?}", result.outcome);
        println!("Sent:          {}", result.sent_count);
        println!("Failed:        {}", result.failed_count);
        println!("Bytes sent:    {}", result.bytes_sent);
    }
    Ok(())
}

fn handle_buffer(config: &Config, cmd: &BufferCommand) -> anyhow::Result<()> {
    match cmd {
        BufferCommand::Evict => {
            let buffer = open_buffer(config)?;
            let evicted = buffer.evict_expired()?;
            println!(
                "Evicted {evicted} entries older than {} days.",
                config.buffer.retention_days
            );
        }
        BufferCommand::Failed { limit, json } => {
            let entries = inspect_buffer(config)?.failed_entries(*limit)?;
            if *json {
                let rows: Vec<_> = entries
                    .iter()
                    .map(|e| {
                        serde_json::json!({
                            "sequence_id": e.sequence_id,
                            "priority": e.priority,
                            "retry_count": e.retry_count,
                            "created_at": e.created_at,
                            "record": e.record,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if entries.is_empty() {
                println!("No failed entries.");
            } else {
                println!(
                    "{:>10}  {:<16}  {:<25}  {:>7}  {:<8}",
                    "SEQUENCE", "DEVICE", "RECORDED", "RETRIES", "PRIORITY"
                );
                for e in &entries {
                    println!(
                        "{:>10}  {:<16}  {:<25}  {:>7}  {:<8}",
                        e.sequence_id,
                        e.record.device_id,
                        e.record.timestamp.to_rfc3339(),
                        e.retry_count,
                        e.priority.to_string()
                    );
                }
            }
        }
        BufferCommand::Check => {
            let buffer = inspect_buffer(config)?;
            buffer.check_integrity()?;
            println!("Buffer integrity OK: {}", buffer.path().display());
        }
    }
    Ok(())
}

fn handle_config(config: &Config, cmd: &ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let shown = config.redacted();
            if *json {
                println!("{}", serde_json::to_string_pretty(&shown)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Device]");
                println!("  Id:                 {}", shown.device.id);
                println!();
                println!("[Buffer]");
                println!("  Database path:      {}", shown.database_path().display());
                println!("  Retention (days):   {}", shown.buffer.retention_days);
                println!("  Max size (bytes):   {}", shown.buffer.max_size_bytes);
                println!("  Capacity policy:    {}", shown.buffer.capacity_policy);
                println!();
                println!("[Sync]");
                println!("  Interval (s):       {}", shown.sync.interval_seconds);
                println!(
                    "  Batch:              {} entries / {} bytes",
                    shown.sync.batch_max_count, shown.sync.batch_max_bytes
                );
                println!("  Compression:        {}", shown.sync.compression);
                println!(
                    "  Endpoint:           {}",
                    shown.remote.endpoint.as_deref().unwrap_or("(not set)")
                );
                println!();
                println!("[Power]");
                println!("  Enabled:            {}", shown.power.enabled);
                println!(
                    "  Low / critical (%): {} / {}",
                    shown.power.low_threshold_percent, shown.power.critical_threshold_percent
                );
                println!();
                println!("[Acquisition]");
                println!("  Kind:               {}", shown.acquisition.kind);
                println!("  Path:               {}", shown.acquisition.path.display());
            }
        }
        // handled before configuration is loaded
        ConfigCommand::Path | ConfigCommand::Validate { .. } => {}
    }
    Ok(())
}
