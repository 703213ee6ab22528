//! Error types for fleetsync.
//!
//! This module defines all error types used throughout the fleetsync crate.
//! Variants are grouped by how they are handled: rejected input, buffer
//! pressure, sync failures, storage faults, and supervision.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for fleetsync operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Input Errors ===
    /// A telemetry record failed validation and was not stored.
    #[error("invalid telemetry record: {field}: {message}")]
    Validation {
        /// The offending field.
        field: &'static str,
        /// Description of the violation.
        message: String,
    },

    // === Buffer Errors ===
    /// The buffer is full and eviction could not make room.
    #[error("buffer full: {required} bytes required, limit is {limit} bytes")]
    Capacity {
        /// Bytes the new record needs.
        required: u64,
        /// Configured buffer limit.
        limit: u64,
    },

    /// The on-disk buffer failed its integrity check.
    #[error("buffer storage at {path} is corrupt: {details}")]
    StorageCorruption {
        /// Path to the database file.
        path: PathBuf,
        /// Integrity check output.
        details: String,
    },

    /// Another process holds the buffer open for writing.
    #[error("buffer at {path} is locked by another process (is the daemon running?)")]
    BufferLocked {
        /// Path to the database file.
        path: PathBuf,
    },

    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Sync Errors ===
    /// A network-class failure; retried with backoff.
    #[error("transient sync failure: {0}")]
    TransientSync(String),

    /// An auth or configuration failure that retrying cannot fix.
    #[error("fatal sync failure: {0}")]
    FatalSync(String),

    /// Encoding or compressing a batch payload failed.
    #[error("payload codec error: {0}")]
    Codec(String),

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Component Errors ===
    /// An acquisition source failed.
    #[error("acquisition source '{source_name}' failed: {message}")]
    Acquisition {
        /// Name of the acquisition source.
        source_name: &'static str,
        /// Description of what went wrong.
        message: String,
    },

    /// A supervised component kept failing after bounded restarts.
    #[error("component '{component}' failed after {restarts} restarts")]
    ComponentFailed {
        /// Name of the component.
        component: &'static str,
        /// Restarts attempted before giving up.
        restarts: u32,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for fleetsync operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a validation error for `field`.
    #[must_use]
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    /// Create an acquisition error.
    #[must_use]
    pub fn acquisition(source_name: &'static str, message: impl Into<String>) -> Self {
        Self::Acquisition {
            source_name,
            message: message.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a payload codec error.
    #[must_use]
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Check if this error rejected a single record without affecting the store.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Check if this error is a buffer capacity failure.
    #[must_use]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }

    /// Check if restarting the component that hit this error cannot help.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalSync(_)
                | Self::StorageCorruption { .. }
                | Self::ComponentFailed { .. }
                | Self::ConfigLoad(_)
                | Self::ConfigValidation { .. }
        )
    }
}
