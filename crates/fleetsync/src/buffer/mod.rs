//! Durable telemetry buffer for fleetsync.
//!
//! Every validated record lands here before anything else happens to it.
//! The buffer is a single `SQLite` database in WAL mode with full
//! synchronous commits, so an `append` that returned `Ok` survives a crash
//! or power cut. The sync engine drains it through [`BufferStore::peek_batch`]
//! and the `mark_*` transitions; a retention sweep trims it from the other end.

pub mod migrations;
pub mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::codec;
use crate::error::{Error, Result};
use crate::record::{Priority, TelemetryRecord};

use schema::{
    KEY_EVICTED_UNSYNCED, KEY_LAST_SEQUENCE, KEY_RETRY_EXHAUSTED, KEY_SYNC_CURSOR,
    KEY_TOTAL_SYNCED,
};

const MEMORY_PATH: &str = ":memory:";

/// How long an open waits for another connection's lock.
const LOCK_WAIT: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    ReadWrite,
    ReadOnly,
}

/// Sync state of a buffered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Waiting to be sent (possibly backing off).
    Pending,
    /// Part of a batch currently being written.
    InFlight,
    /// Confirmed by the remote store.
    Synced,
    /// Retries exhausted; kept for diagnostics until retention expiry.
    Failed,
}

impl SyncState {
    /// Column value stored in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a new record does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityPolicy {
    /// Evict synced entries, then the oldest entries in any state.
    #[default]
    DropOldest,
    /// Evict synced entries only, then refuse the new record.
    RejectNew,
}

impl std::fmt::Display for CapacityPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DropOldest => write!(f, "drop_oldest"),
            Self::RejectNew => write!(f, "reject_new"),
        }
    }
}

/// Tuning for a [`BufferStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct BufferOptions {
    /// Upper bound on the sum of stored payload sizes.
    pub max_size_bytes: u64,
    /// Largest single encoded record accepted.
    pub max_record_bytes: u64,
    /// Behaviour when full.
    pub capacity_policy: CapacityPolicy,
    /// Failures after which an entry is marked permanently failed.
    pub max_retry_count: u32,
    /// Per-entry retry delay schedule.
    pub backoff: Backoff,
    /// Maximum age of an entry regardless of state.
    pub retention: Duration,
    /// How far past the local clock a record timestamp may lie.
    pub max_future_skew: std::time::Duration,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            max_size_bytes: 100 * 1024 * 1024,
            max_record_bytes: 64 * 1024,
            capacity_policy: CapacityPolicy::DropOldest,
            max_retry_count: 5,
            backoff: Backoff::default(),
            retention: Duration::days(7),
            max_future_skew: std::time::Duration::from_secs(600),
        }
    }
}

/// A record together with its buffer bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferEntry {
    /// Gapless, strictly increasing id assigned at insertion.
    pub sequence_id: u64,
    /// Sync priority.
    pub priority: Priority,
    /// Current sync state.
    pub sync_state: SyncState,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Earliest time the entry may be sent again.
    pub next_attempt_at: DateTime<Utc>,
    /// When the entry was buffered.
    pub created_at: DateTime<Utc>,
    /// Size of the stored record encoding.
    pub payload_bytes: u64,
    /// The record.
    pub record: TelemetryRecord,
}

/// Outcome of [`BufferStore::mark_failed`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport {
    /// Entries returned to pending with a backoff delay.
    pub retrying: usize,
    /// Entries that reached the retry ceiling and are now failed.
    pub exhausted: Vec<u64>,
}

/// Statistics about the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Entries waiting to be sent.
    pub pending: u64,
    /// Entries in a batch being written.
    pub in_flight: u64,
    /// Entries confirmed by the remote and not yet evicted.
    pub synced: u64,
    /// Entries that exhausted their retries.
    pub failed: u64,
    /// Sum of stored payload sizes.
    pub stored_bytes: u64,
    /// Configured bound on `stored_bytes`.
    pub max_size_bytes: u64,
    /// Highest sequence id ever assigned.
    pub last_sequence: u64,
    /// Highest sequence id confirmed by the remote.
    pub sync_cursor: u64,
    /// Lifetime count of entries marked synced.
    pub total_synced: u64,
    /// Lifetime count of unsynced entries removed by eviction.
    pub evicted_unsynced: u64,
    /// Lifetime count of entries that exhausted their retries.
    pub retry_exhausted: u64,
    /// Size of the database files on disk.
    pub db_size_bytes: u64,
    /// Creation time of the oldest entry.
    pub oldest_entry: Option<DateTime<Utc>>,
    /// Creation time of the newest entry.
    pub newest_entry: Option<DateTime<Utc>>,
}

impl BufferStats {
    /// Entries not yet delivered and still eligible for delivery.
    #[must_use]
    pub fn unsynced(&self) -> u64 {
        self.pending + self.in_flight
    }
}

#[derive(Debug)]
struct Inner {
    conn: Connection,
    last_sequence: u64,
    stored_bytes: u64,
    last_timestamp: HashMap<String, DateTime<Utc>>,
}

/// Durable, bounded queue of telemetry awaiting upload.
///
/// All operations are individually atomic and safe to call from several
/// tasks; the connection lock is held for one local transaction at a time.
#[derive(Debug)]
pub struct BufferStore {
    /// Path to the database file.
    path: PathBuf,
    options: BufferOptions,
    inner: Mutex<Inner>,
}

impl BufferStore {
    /// Open or create a buffer database at the given path.
    ///
    /// Creates the parent directories if needed, takes an exclusive lock on
    /// the file for the life of the store, verifies integrity, and repairs
    /// state left by an unclean shutdown: in-flight entries go back to
    /// pending and the sequence counter is restored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferLocked`] if another process has the buffer
    /// open, [`Error::StorageCorruption`] if the file fails its integrity
    /// check, or another error if it cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>, options: BufferOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening buffer at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| open_error(source, &path))?;
        conn.busy_timeout(LOCK_WAIT)
            .map_err(|source| open_error(source, &path))?;
        // held from the first read until the connection closes
        conn.execute_batch("PRAGMA locking_mode=EXCLUSIVE;")
            .map_err(|source| open_error(source, &path))?;

        let store = Self::from_connection(conn, path, options, Access::ReadWrite)?;
        info!("Buffer opened at {}", store.path.display());
        Ok(store)
    }

    /// Open an existing buffer for inspection without changing it.
    ///
    /// Nothing is repaired or migrated, so in-flight entries stay in flight.
    /// Writes through the returned store fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferLocked`] while another process has the buffer
    /// open, [`Error::StorageCorruption`] if the file fails its integrity
    /// check, or another error if it does not exist or cannot be read.
    pub fn open_read_only(path: impl AsRef<Path>, options: BufferOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        debug!("Opening buffer read-only at {}", path.display());
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| open_error(source, &path))?;
        conn.busy_timeout(LOCK_WAIT)
            .map_err(|source| open_error(source, &path))?;

        Self::from_connection(conn, path, options, Access::ReadOnly)
    }

    /// Create an in-memory buffer for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory(options: BufferOptions) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(MEMORY_PATH),
            source,
        })?;
        Self::from_connection(conn, PathBuf::from(MEMORY_PATH), options, Access::ReadWrite)
    }

    fn from_connection(
        conn: Connection,
        path: PathBuf,
        options: BufferOptions,
        access: Access,
    ) -> Result<Self> {
        quick_check(&conn).map_err(|e| storage_error(e, &path))?;

        if access == Access::ReadWrite {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
                .map_err(|e| storage_error(e.into(), &path))?;
            migrations::initialize_schema(&conn)?;

            let reverted = reset_in_flight(&conn)?;
            if reverted > 0 {
                info!(count = reverted, "Reverted in-flight entries left by unclean shutdown");
            }
        }

        let max_row: Option<i64> =
            conn.query_row("SELECT MAX(sequence_id) FROM telemetry_buffer", [], |row| {
                row.get(0)
            })?;
        let last_sequence = read_counter(&conn, KEY_LAST_SEQUENCE)?
            .max(max_row.map_or(0, |v| u64::try_from(v).unwrap_or(0)));
        if access == Access::ReadWrite {
            set_counter(&conn, KEY_LAST_SEQUENCE, last_sequence)?;
        }

        let stored: i64 = conn.query_row(
            "SELECT COALESCE(SUM(payload_bytes), 0) FROM telemetry_buffer",
            [],
            |row| row.get(0),
        )?;

        // rows stamped beyond the skew window must not hold back later fixes
        let latest_ms = chrono::Duration::from_std(options.max_future_skew)
            .ok()
            .and_then(|skew| Utc::now().checked_add_signed(skew))
            .map_or(i64::MAX, |latest| latest.timestamp_millis());
        let mut last_timestamp = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT device_id, MAX(recorded_at_ms) FROM telemetry_buffer
                 WHERE recorded_at_ms <= ?1 GROUP BY device_id",
            )?;
            let rows = stmt.query_map([latest_ms], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (device, ms) = row?;
                last_timestamp.insert(device, from_millis(ms));
            }
        }

        debug!(last_sequence, stored_bytes = stored, ?access, "Buffer state restored");

        Ok(Self {
            path,
            options,
            inner: Mutex::new(Inner {
                conn,
                last_sequence,
                stored_bytes: u64::try_from(stored).unwrap_or(0),
                last_timestamp,
            }),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the options this buffer was opened with.
    #[must_use]
    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::internal("buffer lock poisoned"))
    }

    /// Append a record with normal priority.
    ///
    /// # Errors
    ///
    /// See [`BufferStore::append_with_priority`].
    pub fn append(&self, record: &TelemetryRecord) -> Result<u64> {
        self.append_with_priority(record, Priority::Normal)
    }

    /// Validate and durably store a record, returning its sequence id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for out-of-range fields, a timestamp
    /// ahead of the local clock by more than the configured skew or older
    /// than the device's last buffered record, or an oversized record.
    /// Returns [`Error::Capacity`] if the capacity policy cannot make room.
    pub fn append_with_priority(&self, record: &TelemetryRecord, priority: Priority) -> Result<u64> {
        record.validate_at(Utc::now(), self.options.max_future_skew)?;

        let payload = serde_json::to_string(record)?;
        let payload_bytes = payload.len() as u64;
        if payload_bytes > self.options.max_record_bytes {
            return Err(Error::validation(
                "size",
                format!(
                    "encoded record is {payload_bytes} bytes, limit is {}",
                    self.options.max_record_bytes
                ),
            ));
        }

        let mut guard = self.lock()?;
        let inner = &mut *guard;

        if let Some(last) = inner.last_timestamp.get(&record.device_id) {
            if record.timestamp < *last {
                return Err(Error::validation(
                    "timestamp",
                    format!(
                        "{} is earlier than the last buffered record for {} ({last})",
                        record.timestamp, record.device_id
                    ),
                ));
            }
        }

        let sequence_id = inner.last_sequence + 1;
        let now = Utc::now();

        let tx = inner.conn.transaction()?;
        let freed = make_room(
            &tx,
            &self.options,
            inner.stored_bytes,
            payload_bytes,
        )?;
        tx.execute(
            r"
            INSERT INTO telemetry_buffer
                (sequence_id, device_id, recorded_at_ms, priority, sync_state,
                 retry_count, next_attempt_ms, created_at_ms, payload, payload_bytes)
            VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5, ?6, ?7)
            ",
            params![
                to_sql_id(sequence_id)?,
                record.device_id,
                record.timestamp.timestamp_millis(),
                priority.rank(),
                now.timestamp_millis(),
                payload,
                to_sql_id(payload_bytes)?,
            ],
        )?;
        set_counter(&tx, KEY_LAST_SEQUENCE, sequence_id)?;
        tx.commit()?;

        inner.last_sequence = sequence_id;
        inner.stored_bytes = inner.stored_bytes.saturating_sub(freed) + payload_bytes;
        inner
            .last_timestamp
            .insert(record.device_id.clone(), record.timestamp);

        debug!(sequence_id, %priority, bytes = payload_bytes, "Buffered record");
        Ok(sequence_id)
    }

    /// Next batch to send, as of now.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn peek_batch(&self, max_count: usize, max_bytes: usize) -> Result<Vec<BufferEntry>> {
        self.peek_batch_at(max_count, max_bytes, Utc::now())
    }

    /// Pending entries eligible at `now`, highest priority first and then by
    /// ascending sequence id.
    ///
    /// Stops before the first entry whose encoded line would push the batch
    /// past `max_bytes`. Does not change any state.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a stored record
    /// cannot be decoded.
    pub fn peek_batch_at(
        &self,
        max_count: usize,
        max_bytes: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<BufferEntry>> {
        if max_count == 0 || max_bytes == 0 {
            return Ok(Vec::new());
        }

        let guard = self.lock()?;
        let mut stmt = guard.conn.prepare(&format!(
            "{SELECT_ENTRY} WHERE sync_state = 'pending' AND next_attempt_ms <= ?1
             ORDER BY priority DESC, sequence_id ASC LIMIT ?2"
        ))?;
        let limit = i64::try_from(max_count).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![now.timestamp_millis(), limit], RawEntry::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(guard);

        let mut batch = Vec::with_capacity(rows.len());
        let mut total = 0usize;
        for raw in rows {
            let entry = raw.into_entry()?;
            let len = codec::wire_len(&entry)?;
            if total + len > max_bytes {
                break;
            }
            total += len;
            batch.push(entry);
        }
        Ok(batch)
    }

    /// Fetch one entry by sequence id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn get(&self, sequence_id: u64) -> Result<Option<BufferEntry>> {
        let guard = self.lock()?;
        let raw = guard
            .conn
            .query_row(
                &format!("{SELECT_ENTRY} WHERE sequence_id = ?1"),
                [to_sql_id(sequence_id)?],
                RawEntry::from_row,
            )
            .optional()?;
        drop(guard);
        raw.map(RawEntry::into_entry).transpose()
    }

    /// Move pending entries to in-flight. Returns how many moved.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn mark_in_flight(&self, sequence_ids: &[u64]) -> Result<usize> {
        self.transition(sequence_ids, "pending", "in_flight")
    }

    /// Return in-flight entries to pending without a retry penalty.
    ///
    /// Used when a batch is abandoned rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn revert_in_flight(&self, sequence_ids: &[u64]) -> Result<usize> {
        self.transition(sequence_ids, "in_flight", "pending")
    }

    /// Return every in-flight entry to pending without a retry penalty.
    ///
    /// Only correct while no batch is being written, e.g. before the sync
    /// loop starts or after it has stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn revert_all_in_flight(&self) -> Result<usize> {
        let guard = self.lock()?;
        reset_in_flight(&guard.conn)
    }

    fn transition(&self, sequence_ids: &[u64], from: &str, to: &str) -> Result<usize> {
        if sequence_ids.is_empty() {
            return Ok(0);
        }
        let mut guard = self.lock()?;
        let tx = guard.conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE telemetry_buffer SET sync_state = ?1 WHERE sequence_id = ?2 AND sync_state = ?3",
            )?;
            for id in sequence_ids {
                changed += stmt.execute(params![to, to_sql_id(*id)?, from])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Mark entries as confirmed by the remote store.
    ///
    /// Returns how many entries were newly synced; repeating the call for
    /// the same ids returns 0 and leaves the lifetime totals unchanged.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn mark_synced(&self, sequence_ids: &[u64]) -> Result<usize> {
        if sequence_ids.is_empty() {
            return Ok(0);
        }
        let mut guard = self.lock()?;
        let tx = guard.conn.transaction()?;
        let mut changed = 0usize;
        let mut cursor = 0u64;
        {
            let mut stmt = tx.prepare(
                "UPDATE telemetry_buffer SET sync_state = 'synced'
                 WHERE sequence_id = ?1 AND sync_state IN ('pending', 'in_flight')",
            )?;
            for id in sequence_ids {
                if stmt.execute([to_sql_id(*id)?])? > 0 {
                    changed += 1;
                    cursor = cursor.max(*id);
                }
            }
        }
        if changed > 0 {
            add_counter(&tx, KEY_TOTAL_SYNCED, changed as u64)?;
            tx.execute(
                "UPDATE metadata SET value = CAST(MAX(CAST(value AS INTEGER), ?2) AS TEXT) WHERE key = ?1",
                params![KEY_SYNC_CURSOR, to_sql_id(cursor)?],
            )?;
        }
        tx.commit()?;

        if changed > 0 {
            debug!(count = changed, cursor, "Marked entries synced");
        }
        Ok(changed)
    }

    /// Record a failed delivery attempt, as of now.
    ///
    /// # Errors
    ///
    /// See [`BufferStore::mark_failed_at`].
    pub fn mark_failed(&self, sequence_ids: &[u64]) -> Result<FailureReport> {
        self.mark_failed_at(sequence_ids, Utc::now())
    }

    /// Record a failed delivery attempt at `now`.
    ///
    /// Each entry's retry count goes up by one. Entries that reach the retry
    /// ceiling become permanently failed; the rest go back to pending and
    /// become eligible after their own backoff delay.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn mark_failed_at(&self, sequence_ids: &[u64], now: DateTime<Utc>) -> Result<FailureReport> {
        let mut report = FailureReport::default();
        if sequence_ids.is_empty() {
            return Ok(report);
        }

        let mut guard = self.lock()?;
        let tx = guard.conn.transaction()?;
        for id in sequence_ids {
            let sql_id = to_sql_id(*id)?;
            let retries: Option<i64> = tx
                .query_row(
                    "SELECT retry_count FROM telemetry_buffer
                     WHERE sequence_id = ?1 AND sync_state IN ('pending', 'in_flight')",
                    [sql_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(retries) = retries else { continue };

            let retry_count = u32::try_from(retries).unwrap_or(u32::MAX).saturating_add(1);
            if retry_count >= self.options.max_retry_count {
                tx.execute(
                    "UPDATE telemetry_buffer SET sync_state = 'failed', retry_count = ?2
                     WHERE sequence_id = ?1",
                    params![sql_id, retry_count],
                )?;
                report.exhausted.push(*id);
            } else {
                let delay = Duration::from_std(self.options.backoff.delay(retry_count))
                    .unwrap_or(Duration::MAX);
                let next = now
                    .checked_add_signed(delay)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                tx.execute(
                    "UPDATE telemetry_buffer SET sync_state = 'pending', retry_count = ?2,
                     next_attempt_ms = ?3 WHERE sequence_id = ?1",
                    params![sql_id, retry_count, next.timestamp_millis()],
                )?;
                report.retrying += 1;
            }
        }
        if !report.exhausted.is_empty() {
            add_counter(&tx, KEY_RETRY_EXHAUSTED, report.exhausted.len() as u64)?;
        }
        tx.commit()?;

        if !report.exhausted.is_empty() {
            warn!(
                count = report.exhausted.len(),
                first = report.exhausted[0],
                "Data loss: entries exhausted their retries and will not be synced"
            );
        }
        Ok(report)
    }

    /// Remove entries older than the retention horizon.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn evict_expired(&self) -> Result<usize> {
        let cutoff = Utc::now()
            .checked_sub_signed(self.options.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.evict_older_than(cutoff)
    }

    /// Remove entries created before `cutoff`, whatever their state.
    ///
    /// Unsynced losses are logged and counted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database update fails.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff_ms = cutoff.timestamp_millis();
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let tx = inner.conn.transaction()?;

        let (unsynced, freed): (i64, i64) = tx.query_row(
            "SELECT COALESCE(SUM(sync_state != 'synced'), 0), COALESCE(SUM(payload_bytes), 0)
             FROM telemetry_buffer WHERE created_at_ms < ?1",
            [cutoff_ms],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let removed = tx.execute(
            "DELETE FROM telemetry_buffer WHERE created_at_ms < ?1",
            [cutoff_ms],
        )?;
        let unsynced = u64::try_from(unsynced).unwrap_or(0);
        if unsynced > 0 {
            add_counter(&tx, KEY_EVICTED_UNSYNCED, unsynced)?;
        }
        tx.commit()?;

        inner.stored_bytes = inner
            .stored_bytes
            .saturating_sub(u64::try_from(freed).unwrap_or(0));

        if unsynced > 0 {
            warn!(
                count = unsynced,
                "Data loss: retention sweep removed entries that were never synced"
            );
        }
        if removed > 0 {
            info!(count = removed, "Evicted expired entries");
        }
        Ok(removed)
    }

    /// Permanently failed entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub fn failed_entries(&self, limit: usize) -> Result<Vec<BufferEntry>> {
        let guard = self.lock()?;
        let mut stmt = guard.conn.prepare(&format!(
            "{SELECT_ENTRY} WHERE sync_state = 'failed' ORDER BY sequence_id DESC LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], RawEntry::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(guard);
        rows.into_iter().map(RawEntry::into_entry).collect()
    }

    /// Run `SQLite`'s quick integrity check.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageCorruption`] if the check reports problems.
    pub fn check_integrity(&self) -> Result<()> {
        let guard = self.lock()?;
        quick_check(&guard.conn).map_err(|e| storage_error(e, &self.path))
    }

    /// Get buffer statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<BufferStats> {
        let guard = self.lock()?;
        let conn = &guard.conn;

        let mut counts: HashMap<SyncState, u64> = HashMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT sync_state, COUNT(*) FROM telemetry_buffer GROUP BY sync_state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                if let Some(state) = SyncState::parse(&state) {
                    counts.insert(state, u64::try_from(count).unwrap_or(0));
                }
            }
        }

        let (oldest, newest): (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(created_at_ms), MAX(created_at_ms) FROM telemetry_buffer",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let db_size_bytes = if self.path.as_os_str() == MEMORY_PATH {
            0
        } else {
            let wal = PathBuf::from(format!("{}-wal", self.path.display()));
            [self.path.as_path(), wal.as_path()]
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum()
        };

        let count = |state: SyncState| counts.get(&state).copied().unwrap_or(0);
        Ok(BufferStats {
            pending: count(SyncState::Pending),
            in_flight: count(SyncState::InFlight),
            synced: count(SyncState::Synced),
            failed: count(SyncState::Failed),
            stored_bytes: guard.stored_bytes,
            max_size_bytes: self.options.max_size_bytes,
            last_sequence: guard.last_sequence,
            sync_cursor: read_counter(conn, KEY_SYNC_CURSOR)?,
            total_synced: read_counter(conn, KEY_TOTAL_SYNCED)?,
            evicted_unsynced: read_counter(conn, KEY_EVICTED_UNSYNCED)?,
            retry_exhausted: read_counter(conn, KEY_RETRY_EXHAUSTED)?,
            db_size_bytes,
            oldest_entry: oldest.map(from_millis),
            newest_entry: newest.map(from_millis),
        })
    }
}

/// Evict entries until `incoming` more bytes fit. Returns the bytes freed.
fn make_room(
    tx: &Transaction<'_>,
    options: &BufferOptions,
    stored: u64,
    incoming: u64,
) -> Result<u64> {
    let limit = options.max_size_bytes;
    if incoming > limit {
        return Err(Error::Capacity {
            required: incoming,
            limit,
        });
    }
    if stored + incoming <= limit {
        return Ok(0);
    }

    let need = stored + incoming - limit;
    let mut freed = evict_oldest(tx, "WHERE sync_state = 'synced'", need)?.bytes;
    if freed >= need {
        return Ok(freed);
    }

    match options.capacity_policy {
        CapacityPolicy::RejectNew => Err(Error::Capacity {
            required: stored - freed + incoming,
            limit,
        }),
        CapacityPolicy::DropOldest => {
            let evicted = evict_oldest(tx, "", need - freed)?;
            freed += evicted.bytes;
            if evicted.unsynced > 0 {
                add_counter(tx, KEY_EVICTED_UNSYNCED, evicted.unsynced)?;
                warn!(
                    count = evicted.unsynced,
                    "Data loss: buffer full, evicted oldest unsynced entries"
                );
            }
            if freed < need {
                return Err(Error::Capacity {
                    required: stored - freed + incoming,
                    limit,
                });
            }
            Ok(freed)
        }
    }
}

struct Evicted {
    bytes: u64,
    unsynced: u64,
}

/// Delete the oldest rows matching `filter` until at least `need` bytes are freed.
fn evict_oldest(tx: &Transaction<'_>, filter: &str, need: u64) -> Result<Evicted> {
    let mut victims = Vec::new();
    let mut evicted = Evicted {
        bytes: 0,
        unsynced: 0,
    };
    {
        let mut stmt = tx.prepare(&format!(
            "SELECT sequence_id, payload_bytes, sync_state FROM telemetry_buffer {filter}
             ORDER BY sequence_id ASC"
        ))?;
        let mut rows = stmt.query([])?;
        while evicted.bytes < need {
            let Some(row) = rows.next()? else { break };
            let id: i64 = row.get(0)?;
            let bytes: i64 = row.get(1)?;
            let state: String = row.get(2)?;
            victims.push(id);
            evicted.bytes += u64::try_from(bytes).unwrap_or(0);
            if state != SyncState::Synced.as_str() {
                evicted.unsynced += 1;
            }
        }
    }
    let mut stmt = tx.prepare("DELETE FROM telemetry_buffer WHERE sequence_id = ?1")?;
    for id in &victims {
        stmt.execute([id])?;
    }
    if !victims.is_empty() {
        debug!(count = victims.len(), bytes = evicted.bytes, "Evicted entries for space");
    }
    Ok(evicted)
}

const SELECT_ENTRY: &str = "SELECT sequence_id, priority, sync_state, retry_count, \
     next_attempt_ms, created_at_ms, payload_bytes, payload FROM telemetry_buffer";

/// A row as stored, before the payload is decoded.
struct RawEntry {
    sequence_id: i64,
    priority: i64,
    sync_state: String,
    retry_count: i64,
    next_attempt_ms: i64,
    created_at_ms: i64,
    payload_bytes: i64,
    payload: String,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            sequence_id: row.get(0)?,
            priority: row.get(1)?,
            sync_state: row.get(2)?,
            retry_count: row.get(3)?,
            next_attempt_ms: row.get(4)?,
            created_at_ms: row.get(5)?,
            payload_bytes: row.get(6)?,
            payload: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<BufferEntry> {
        let sync_state = SyncState::parse(&self.sync_state).ok_or_else(|| {
            Error::internal(format!(
                "entry {} has unknown sync state '{}'",
                self.sequence_id, self.sync_state
            ))
        })?;
        Ok(BufferEntry {
            sequence_id: u64::try_from(self.sequence_id).unwrap_or(0),
            priority: Priority::from_rank(self.priority),
            sync_state,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
            next_attempt_at: from_millis(self.next_attempt_ms),
            created_at: from_millis(self.created_at_ms),
            payload_bytes: u64::try_from(self.payload_bytes).unwrap_or(0),
            record: serde_json::from_str(&self.payload)?,
        })
    }
}

fn quick_check(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA quick_check")?;
    let problems = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if problems.len() == 1 && problems[0] == "ok" {
        return Ok(());
    }
    Err(Error::StorageCorruption {
        path: PathBuf::new(),
        details: problems.join("; "),
    })
}

fn open_error(source: rusqlite::Error, path: &Path) -> Error {
    storage_error(
        Error::DatabaseOpen {
            path: path.to_path_buf(),
            source,
        },
        path,
    )
}

/// Re-label `SQLite` corruption and lock codes (and failed checks) against `path`.
fn storage_error(err: Error, path: &Path) -> Error {
    match err {
        Error::StorageCorruption { details, .. } => Error::StorageCorruption {
            path: path.to_path_buf(),
            details,
        },
        Error::DatabaseQuery(e) | Error::DatabaseOpen { source: e, .. }
            if matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt)
            ) =>
        {
            Error::StorageCorruption {
                path: path.to_path_buf(),
                details: e.to_string(),
            }
        }
        Error::DatabaseQuery(e) | Error::DatabaseOpen { source: e, .. }
            if matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ) =>
        {
            Error::BufferLocked {
                path: path.to_path_buf(),
            }
        }
        other => other,
    }
}

fn reset_in_flight(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE telemetry_buffer SET sync_state = 'pending' WHERE sync_state = 'in_flight'",
        [],
    )?)
}

fn read_counter(conn: &Connection, key: &str) -> Result<u64> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?;
    match value {
        None => Ok(0),
        Some(v) => v.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid value for {key}: {v}"),
        }),
    }
}

fn set_counter(conn: &Connection, key: &str, value: u64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        (key, value.to_string()),
    )?;
    Ok(())
}

fn add_counter(conn: &Connection, key: &str, delta: u64) -> Result<()> {
    conn.execute(
        "UPDATE metadata SET value = CAST(CAST(value AS INTEGER) + ?2 AS TEXT) WHERE key = ?1",
        params![key, to_sql_id(delta)?],
    )?;
    Ok(())
}

fn to_sql_id(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::internal(format!("{value} exceeds SQLite integer range")))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Position;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn record_at(secs: i64) -> TelemetryRecord {
        let mut record = TelemetryRecord::new(
            "fleet-001",
            base_time() + Duration::seconds(secs),
            Position {
                latitude: 52.5200,
                longitude: 13.4050,
            },
        );
        record.speed = Some(42.0);
        record
    }

    fn payload_len(record: &TelemetryRecord) -> u64 {
        serde_json::to_string(record).unwrap().len() as u64
    }

    fn create_test_buffer() -> BufferStore {
        BufferStore::open_in_memory(BufferOptions::default()).expect("failed to create test buffer")
    }

    fn ids(entries: &[BufferEntry]) -> Vec<u64> {
        entries.iter().map(|e| e.sequence_id).collect()
    }

    #[test]
    fn test_open_in_memory() {
        let buffer = BufferStore::open_in_memory(BufferOptions::default());
        assert!(buffer.is_ok());
        assert_eq!(buffer.unwrap().path().to_string_lossy(), ":memory:");
    }

    #[test]
    fn test_append_assigns_gapless_sequence() {
        let buffer = create_test_buffer();
        let seqs: Vec<u64> = (0..5).map(|i| buffer.append(&record_at(i)).unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        let entry = buffer.get(3).unwrap().unwrap();
        assert_eq!(entry.sync_state, SyncState::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.record, record_at(2));
    }

    #[test]
    fn test_invalid_record_not_stored() {
        let buffer = create_test_buffer();
        let mut record = record_at(0);
        record.position.latitude = 90.000_000_1;

        let err = buffer.append(&record).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(buffer.stats().unwrap().pending, 0);

        record.position.latitude = 90.0;
        assert_eq!(buffer.append(&record).unwrap(), 1);
    }

    #[test]
    fn test_timestamp_regression_rejected() {
        let buffer = create_test_buffer();
        buffer.append(&record_at(10)).unwrap();
        buffer.append(&record_at(10)).unwrap();

        let err = buffer.append(&record_at(9)).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                field: "timestamp",
                ..
            }
        ));

        let mut other = record_at(0);
        other.device_id = "fleet-002".to_string();
        assert!(buffer.append(&other).is_ok());
    }

    #[test]
    fn test_future_timestamp_does_not_block_later_records() {
        let buffer = create_test_buffer();
        buffer.append(&record_at(0)).unwrap();

        let mut runaway = record_at(0);
        runaway.timestamp = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();
        let err = buffer.append(&runaway).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation {
                field: "timestamp",
                ..
            }
        ));

        assert_eq!(buffer.append(&record_at(1)).unwrap(), 2);
        let mut current = record_at(0);
        current.timestamp = Utc::now();
        assert_eq!(buffer.append(&current).unwrap(), 3);
    }

    #[test]
    fn test_coordinates_stored_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");
        let mut record = record_at(0);
        record.position.latitude = 10.938_711_676_632_721;
        record.position.longitude = 0.1 + 0.2;
        record.altitude = Some(-0.000_123_456_789_012_345_67);

        {
            let buffer = BufferStore::open(&path, BufferOptions::default()).unwrap();
            let seq = buffer.append(&record).unwrap();
            let stored = buffer.get(seq).unwrap().unwrap().record;
            assert_eq!(stored, record);
            assert_eq!(
                stored.position.latitude.to_bits(),
                record.position.latitude.to_bits()
            );
        }

        let buffer = BufferStore::open(&path, BufferOptions::default()).unwrap();
        let stored = buffer.get(1).unwrap().unwrap().record;
        assert_eq!(stored, record);
        assert_eq!(
            stored.position.longitude.to_bits(),
            record.position.longitude.to_bits()
        );
    }

    #[test]
    fn test_oversized_record_rejected() {
        let options = BufferOptions {
            max_record_bytes: 200,
            ..BufferOptions::default()
        };
        let buffer = BufferStore::open_in_memory(options).unwrap();
        let mut record = record_at(0);
        record
            .metadata
            .insert("note".to_string(), "x".repeat(300).as_str().into());

        let err = buffer.append(&record).unwrap_err();
        assert!(err.to_string().contains("size"));
        assert_eq!(buffer.stats().unwrap().last_sequence, 0);
    }

    #[test]
    fn test_scenario_a_peek_returns_all_in_order() {
        let buffer = create_test_buffer();
        for i in 0..10 {
            buffer.append(&record_at(i)).unwrap();
        }

        let batch = buffer.peek_batch(100, usize::MAX).unwrap();
        assert_eq!(ids(&batch), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_scenario_b_priority_tiers() {
        let buffer = create_test_buffer();
        let mut critical = Vec::new();
        for i in 0..13 {
            let priority = if i % 4 == 1 {
                Priority::Critical
            } else {
                Priority::Normal
            };
            let seq = buffer.append_with_priority(&record_at(i), priority).unwrap();
            if priority == Priority::Critical {
                critical.push(seq);
            }
        }
        assert_eq!(critical, vec![2, 6, 10]);

        let batch = buffer.peek_batch(5, usize::MAX).unwrap();
        assert_eq!(ids(&batch), vec![2, 6, 10, 1, 3]);
        assert!(batch[..3].iter().all(|e| e.priority == Priority::Critical));
        assert!(batch[3..].iter().all(|e| e.priority == Priority::Normal));
    }

    #[test]
    fn test_peek_is_read_only() {
        let buffer = create_test_buffer();
        for i in 0..3 {
            buffer.append(&record_at(i)).unwrap();
        }
        let first = buffer.peek_batch(10, usize::MAX).unwrap();
        let second = buffer.peek_batch(10, usize::MAX).unwrap();
        assert_eq!(first, second);
        assert_eq!(buffer.stats().unwrap().pending, 3);
    }

    #[test]
    fn test_peek_never_returns_synced_or_in_flight() {
        let buffer = create_test_buffer();
        for i in 0..6 {
            buffer.append(&record_at(i)).unwrap();
        }
        buffer.mark_synced(&[1, 3]).unwrap();
        buffer.mark_in_flight(&[5]).unwrap();

        let batch = buffer.peek_batch(100, usize::MAX).unwrap();
        assert_eq!(ids(&batch), vec![2, 4, 6]);
        assert!(batch.iter().all(|e| e.sync_state == SyncState::Pending));
    }

    #[test]
    fn test_peek_respects_byte_bound() {
        let buffer = create_test_buffer();
        for i in 0..10 {
            buffer.append(&record_at(i)).unwrap();
        }
        let all = buffer.peek_batch(100, usize::MAX).unwrap();
        let line = codec::wire_len(&all[0]).unwrap();

        let max_bytes = line * 3 + line / 2;
        let batch = buffer.peek_batch(100, max_bytes).unwrap();
        assert_eq!(batch.len(), 3);

        let encoded = codec::encode_batch(&batch).unwrap();
        assert!(encoded.len() <= max_bytes);

        assert!(buffer.peek_batch(100, line - 1).unwrap().is_empty());
        assert_eq!(buffer.peek_batch(100, line).unwrap().len(), 1);
    }

    #[test]
    fn test_peek_zero_limits() {
        let buffer = create_test_buffer();
        buffer.append(&record_at(0)).unwrap();
        assert!(buffer.peek_batch(0, usize::MAX).unwrap().is_empty());
        assert!(buffer.peek_batch(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_mark_synced_idempotent() {
        let buffer = create_test_buffer();
        for i in 0..4 {
            buffer.append(&record_at(i)).unwrap();
        }
        buffer.mark_in_flight(&[1, 2, 3]).unwrap();

        assert_eq!(buffer.mark_synced(&[1, 2, 3]).unwrap(), 3);
        let stats = buffer.stats().unwrap();
        assert_eq!(stats.total_synced, 3);
        assert_eq!(stats.sync_cursor, 3);

        assert_eq!(buffer.mark_synced(&[1, 2, 3]).unwrap(), 0);
        let stats = buffer.stats().unwrap();
        assert_eq!(stats.total_synced, 3);
        assert_eq!(stats.synced, 3);
        assert_eq!(stats.pending, 1);
    }

    #[test]
    fn test_sync_cursor_never_moves_back() {
        let buffer = create_test_buffer();
        for i in 0..5 {
            buffer.append(&record_at(i)).unwrap();
        }
        buffer.mark_synced(&[5]).unwrap();
        buffer.mark_synced(&[2]).unwrap();
        assert_eq!(buffer.stats().unwrap().sync_cursor, 5);
    }

    #[test]
    fn test_mark_in_flight_and_revert() {
        let buffer = create_test_buffer();
        for i in 0..3 {
            buffer.append(&record_at(i)).unwrap();
        }
        assert_eq!(buffer.mark_in_flight(&[1, 2]).unwrap(), 2);
        assert_eq!(buffer.mark_in_flight(&[1]).unwrap(), 0);
        assert_eq!(buffer.stats().unwrap().in_flight, 2);

        assert_eq!(buffer.revert_in_flight(&[1, 2, 3]).unwrap(), 2);
        let entry = buffer.get(1).unwrap().unwrap();
        assert_eq!(entry.sync_state, SyncState::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(buffer.peek_batch(10, usize::MAX).unwrap().len(), 3);
    }

    #[test]
    fn test_revert_all_in_flight() {
        let buffer = create_test_buffer();
        for i in 0..4 {
            buffer.append(&record_at(i)).unwrap();
        }
        buffer.mark_in_flight(&[1, 3]).unwrap();
        buffer.mark_synced(&[2]).unwrap();

        assert_eq!(buffer.revert_all_in_flight().unwrap(), 2);
        assert_eq!(buffer.revert_all_in_flight().unwrap(), 0);
        let stats = buffer.stats().unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.synced, 1);
        assert_eq!(buffer.get(3).unwrap().unwrap().retry_count, 0);
    }

    #[test]
    fn test_mark_failed_applies_per_entry_backoff() {
        let buffer = create_test_buffer();
        for i in 0..3 {
            buffer.append(&record_at(i)).unwrap();
        }
        let now = Utc::now();
        buffer.mark_in_flight(&[1]).unwrap();
        let report = buffer.mark_failed_at(&[1], now).unwrap();
        assert_eq!(report.retrying, 1);
        assert!(report.exhausted.is_empty());

        let entry = buffer.get(1).unwrap().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.sync_state, SyncState::Pending);

        // fresh entries are unaffected by entry 1's backoff
        let batch = buffer.peek_batch_at(10, usize::MAX, now).unwrap();
        assert_eq!(ids(&batch), vec![2, 3]);

        let later = now + Duration::seconds(5);
        let batch = buffer.peek_batch_at(10, usize::MAX, later).unwrap();
        assert_eq!(ids(&batch), vec![1, 2, 3]);

        buffer.mark_failed_at(&[1], later).unwrap();
        let entry = buffer.get(1).unwrap().unwrap();
        assert_eq!(entry.retry_count, 2);
        assert!(entry.next_attempt_at >= later + Duration::seconds(9));
    }

    #[test]
    fn test_retry_exhaustion_marks_failed() {
        let options = BufferOptions {
            max_retry_count: 3,
            ..BufferOptions::default()
        };
        let buffer = BufferStore::open_in_memory(options).unwrap();
        buffer.append(&record_at(0)).unwrap();
        buffer.append(&record_at(1)).unwrap();

        let far = Utc::now() + Duration::days(1);
        buffer.mark_failed_at(&[1], far).unwrap();
        buffer.mark_failed_at(&[1], far).unwrap();
        let report = buffer.mark_failed_at(&[1], far).unwrap();
        assert_eq!(report.exhausted, vec![1]);
        assert_eq!(report.retrying, 0);

        let stats = buffer.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retry_exhausted, 1);

        let failed = buffer.failed_entries(10).unwrap();
        assert_eq!(ids(&failed), vec![1]);
        assert_eq!(failed[0].retry_count, 3);

        let batch = buffer.peek_batch_at(10, usize::MAX, far + Duration::days(30)).unwrap();
        assert_eq!(ids(&batch), vec![2]);

        // failed is terminal
        assert_eq!(buffer.mark_synced(&[1]).unwrap(), 0);
        assert_eq!(buffer.mark_failed(&[1]).unwrap(), FailureReport::default());
    }

    #[test]
    fn test_scenario_e_drop_oldest_evicts_synced_first() {
        let size = payload_len(&record_at(0));
        let options = BufferOptions {
            max_size_bytes: size * 5,
            ..BufferOptions::default()
        };
        let buffer = BufferStore::open_in_memory(options).unwrap();
        for i in 0..5 {
            buffer.append(&record_at(i)).unwrap();
        }
        buffer.mark_synced(&[2, 4]).unwrap();

        buffer.append(&record_at(5)).unwrap();
        assert!(buffer.get(2).unwrap().is_none());
        assert!(buffer.get(1).unwrap().is_some());

        buffer.append(&record_at(6)).unwrap();
        assert!(buffer.get(4).unwrap().is_none());
        assert!(buffer.get(1).unwrap().is_some());
        assert_eq!(buffer.stats().unwrap().evicted_unsynced, 0);

        // no synced entries left: the oldest pending one goes
        buffer.append(&record_at(7)).unwrap();
        assert!(buffer.get(1).unwrap().is_none());
        assert!(buffer.get(3).unwrap().is_some());

        let stats = buffer.stats().unwrap();
        assert_eq!(stats.evicted_unsynced, 1);
        assert_eq!(stats.stored_bytes, size * 5);
        assert_eq!(stats.pending, 5);
    }

    #[test]
    fn test_reject_new_policy() {
        let size = payload_len(&record_at(0));
        let options = BufferOptions {
            max_size_bytes: size * 3,
            capacity_policy: CapacityPolicy::RejectNew,
            ..BufferOptions::default()
        };
        let buffer = BufferStore::open_in_memory(options).unwrap();
        for i in 0..3 {
            buffer.append(&record_at(i)).unwrap();
        }

        let err = buffer.append(&record_at(3)).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(buffer.stats().unwrap().pending, 3);

        buffer.mark_synced(&[1]).unwrap();
        assert_eq!(buffer.append(&record_at(3)).unwrap(), 4);
        assert!(buffer.get(1).unwrap().is_none());
    }

    #[test]
    fn test_evict_older_than() {
        let buffer = create_test_buffer();
        for i in 0..4 {
            buffer.append(&record_at(i)).unwrap();
        }
        buffer.mark_synced(&[1]).unwrap();

        assert_eq!(buffer.evict_older_than(Utc::now() - Duration::hours(1)).unwrap(), 0);

        let removed = buffer.evict_older_than(Utc::now() + Duration::seconds(1)).unwrap();
        assert_eq!(removed, 4);
        let stats = buffer.stats().unwrap();
        assert_eq!(stats.evicted_unsynced, 3);
        assert_eq!(stats.stored_bytes, 0);
        assert_eq!(stats.last_sequence, 4);
    }

    #[test]
    fn test_evict_expired_keeps_recent() {
        let buffer = create_test_buffer();
        buffer.append(&record_at(0)).unwrap();
        assert_eq!(buffer.evict_expired().unwrap(), 0);
        assert_eq!(buffer.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_stats_empty() {
        let buffer = create_test_buffer();
        let stats = buffer.stats().unwrap();

        assert_eq!(stats.unsynced(), 0);
        assert_eq!(stats.last_sequence, 0);
        assert!(stats.oldest_entry.is_none());
        assert!(stats.newest_entry.is_none());
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_stats_with_data() {
        let buffer = create_test_buffer();
        buffer.append(&record_at(0)).unwrap();
        buffer.append(&record_at(1)).unwrap();

        let stats = buffer.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.stored_bytes, payload_len(&record_at(0)) * 2);
        assert!(stats.oldest_entry.is_some());
        assert!(stats.oldest_entry <= stats.newest_entry);
    }

    #[test]
    fn test_check_integrity_ok() {
        let buffer = create_test_buffer();
        assert!(buffer.check_integrity().is_ok());
    }

    #[test]
    fn test_crash_restart_durability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("buffer.db");

        {
            let buffer = BufferStore::open(&path, BufferOptions::default()).unwrap();
            for i in 0..5 {
                buffer.append(&record_at(i)).unwrap();
            }
            buffer.mark_synced(&[1]).unwrap();
            buffer.mark_in_flight(&[2, 3]).unwrap();
            // dropped without any shutdown step
        }

        let buffer = BufferStore::open(&path, BufferOptions::default()).unwrap();
        let entry = buffer.get(4).unwrap().unwrap();
        assert_eq!(entry.record, record_at(3));
        assert_eq!(entry.sync_state, SyncState::Pending);

        let stats = buffer.stats().unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 4);
        assert_eq!(stats.synced, 1);
        assert_eq!(stats.sync_cursor, 1);
        assert!(stats.db_size_bytes > 0);

        assert_eq!(buffer.append(&record_at(5)).unwrap(), 6);
        assert!(buffer.append(&record_at(2)).unwrap_err().is_validation());
    }

    #[test]
    fn test_open_buffer_is_locked_against_other_processes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");

        let daemon = BufferStore::open(&path, BufferOptions::default()).unwrap();
        for i in 0..3 {
            daemon.append(&record_at(i)).unwrap();
        }
        daemon.mark_in_flight(&[1, 2]).unwrap();

        let err = BufferStore::open(&path, BufferOptions::default()).unwrap_err();
        assert!(matches!(err, Error::BufferLocked { .. }), "{err}");
        let err = BufferStore::open_read_only(&path, BufferOptions::default()).unwrap_err();
        assert!(matches!(err, Error::BufferLocked { .. }), "{err}");

        // the daemon's batch is untouched by the refused opens
        assert_eq!(daemon.stats().unwrap().in_flight, 2);
        assert_eq!(daemon.append(&record_at(3)).unwrap(), 4);
    }

    #[test]
    fn test_read_only_open_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");

        {
            let buffer = BufferStore::open(&path, BufferOptions::default()).unwrap();
            for i in 0..3 {
                buffer.append(&record_at(i)).unwrap();
            }
            buffer.mark_in_flight(&[2]).unwrap();
        }

        {
            let inspector = BufferStore::open_read_only(&path, BufferOptions::default()).unwrap();
            let stats = inspector.stats().unwrap();
            assert_eq!(stats.in_flight, 1);
            assert_eq!(stats.pending, 2);
            assert!(inspector.check_integrity().is_ok());
            assert!(inspector.append(&record_at(5)).is_err());
            assert!(inspector.revert_all_in_flight().is_err());
        }

        let buffer = BufferStore::open(&path, BufferOptions::default()).unwrap();
        assert_eq!(buffer.stats().unwrap().in_flight, 0);
        assert_eq!(buffer.append(&record_at(5)).unwrap(), 4);
    }

    #[test]
    fn test_read_only_open_of_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");

        assert!(BufferStore::open_read_only(&path, BufferOptions::default()).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_sequence_not_reused_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");

        {
            let buffer = BufferStore::open(&path, BufferOptions::default()).unwrap();
            for i in 0..3 {
                buffer.append(&record_at(i)).unwrap();
            }
            buffer.evict_older_than(Utc::now() + Duration::seconds(1)).unwrap();
        }

        let buffer = BufferStore::open(&path, BufferOptions::default()).unwrap();
        assert_eq!(buffer.append(&record_at(10)).unwrap(), 4);
    }

    #[test]
    fn test_corrupt_file_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");
        std::fs::write(&path, vec![0x5a; 4096]).unwrap();

        let err = BufferStore::open(&path, BufferOptions::default()).unwrap_err();
        assert!(matches!(err, Error::StorageCorruption { .. }), "{err}");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_sync_state_round_trip() {
        for state in [
            SyncState::Pending,
            SyncState::InFlight,
            SyncState::Synced,
            SyncState::Failed,
        ] {
            assert_eq!(SyncState::parse(state.as_str()), Some(state));
        }
        assert_eq!(SyncState::parse("lost"), None);
        assert_eq!(SyncState::InFlight.to_string(), "in_flight");
    }

    #[test]
    fn test_capacity_policy_serde() {
        let policy: CapacityPolicy = serde_json::from_str("\"reject_new\"").unwrap();
        assert_eq!(policy, CapacityPolicy::RejectNew);
        assert_eq!(CapacityPolicy::DropOldest.to_string(), "drop_oldest");
    }

    #[test]
    fn test_buffer_stats_clone() {
        let buffer = create_test_buffer();
        let stats = buffer.stats().unwrap();
        let cloned = stats.clone();
        assert_eq!(stats, cloned);
        let debug_str = format!("{stats:?}");
        assert!(debug_str.contains("sync_cursor"));
    }
}
