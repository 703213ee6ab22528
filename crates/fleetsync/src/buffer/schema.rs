//! `SQLite` schema definitions for the telemetry buffer.
//!
//! Times are stored as Unix milliseconds so that eligibility and retention
//! comparisons are plain integer comparisons.

/// SQL statement to create the telemetry buffer table.
pub const CREATE_BUFFER_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS telemetry_buffer (
    sequence_id INTEGER PRIMARY KEY,
    device_id TEXT NOT NULL,
    recorded_at_ms INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    sync_state TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    next_attempt_ms INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    payload TEXT NOT NULL,
    payload_bytes INTEGER NOT NULL
)
";

/// Index serving batch selection: pending entries by priority, then sequence.
pub const CREATE_STATE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_buffer_state_priority
ON telemetry_buffer(sync_state, priority DESC, sequence_id)
";

/// Index serving retention sweeps.
pub const CREATE_CREATED_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_buffer_created ON telemetry_buffer(created_at_ms)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_BUFFER_TABLE,
    CREATE_STATE_INDEX,
    CREATE_CREATED_INDEX,
    CREATE_METADATA_TABLE,
];

/// Metadata key: highest sequence id ever assigned.
pub const KEY_LAST_SEQUENCE: &str = "last_sequence";
/// Metadata key: highest sequence id confirmed by the remote.
pub const KEY_SYNC_CURSOR: &str = "sync_cursor";
/// Metadata key: lifetime count of entries marked synced.
pub const KEY_TOTAL_SYNCED: &str = "total_synced";
/// Metadata key: lifetime count of unsynced entries removed by eviction.
pub const KEY_EVICTED_UNSYNCED: &str = "evicted_unsynced";
/// Metadata key: lifetime count of entries that exhausted their retries.
pub const KEY_RETRY_EXHAUSTED: &str = "retry_exhausted";
