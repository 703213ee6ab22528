//! `fleetsync` - Offline-tolerant telemetry buffering and sync
//!
//! This library provides the core of a vehicle tracking unit: every GPS fix
//! is stored durably in a local buffer first, then uploaded in batches to a
//! remote store whenever connectivity allows.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod acquisition;
pub mod backoff;
pub mod buffer;
pub mod cli;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod power;
pub mod record;
pub mod remote;
pub mod sync;

pub use buffer::{BufferStats, BufferStore, CapacityPolicy};
pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use orchestrator::{Orchestrator, ShutdownReason};
pub use record::{Observation, Priority, TelemetryRecord};
pub use sync::{SyncEngine, SyncOutcome, SyncResult};
