//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Sync command arguments.
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Keep sending until nothing is eligible (bounded by the shutdown grace period)
    #[arg(short, long)]
    pub flush: bool,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Buffer maintenance commands.
#[derive(Debug, Subcommand)]
pub enum BufferCommand {
    /// Evict entries older than the retention period (refused while the daemon runs)
    Evict,

    /// List entries that exhausted their retries
    Failed {
        /// Maximum number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Run an integrity check on the buffer database
    Check,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration file
    Validate {
        /// Path to config file to validate (default: standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
