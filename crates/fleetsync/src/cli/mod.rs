//! Command-line interface for fleetsync.
//!
//! This module provides the CLI structure for the `fleetsync` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{BufferCommand, ConfigCommand, StatusCommand, SyncCommand};

/// fleetsync - Offline-tolerant telemetry sync for fleet units
///
/// Buffers GPS telemetry durably on the vehicle and uploads it in batches
/// whenever the cellular link allows.
#[derive(Debug, Parser)]
#[command(name = "fleetsync")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the daemon in the foreground
    Run,

    /// Show buffer statistics
    Status(StatusCommand),

    /// Run one sync cycle against the configured remote
    Sync(SyncCommand),

    /// Inspect and maintain the buffer
    #[command(subcommand)]
    Buffer(BufferCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
