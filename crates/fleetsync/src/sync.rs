//! Sync engine.
//!
//! Drains the buffer to the remote store in batches. One cycle at a time:
//! peek a batch, mark it in flight, encode and compress it, write it under
//! a timeout, then settle every entry according to the outcome.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferEntry, BufferStore};
use crate::codec::{BatchPayload, Compressor};
use crate::connectivity::{ConnectivitySignal, ConnectivityState};
use crate::error::{Error, Result};
use crate::remote::{RemoteStore, WriteOutcome};

/// Batch limits and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Most entries per batch.
    pub batch_max_count: usize,
    /// Most uncompressed bytes per batch.
    pub batch_max_bytes: usize,
    /// Bound on a single remote write.
    pub attempt_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_max_count: 250,
            batch_max_bytes: 512 * 1024,
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// A batch was written and marked synced.
    Sent,
    /// Nothing was eligible to send.
    Idle,
    /// The write failed and the batch will be retried after backoff.
    Retrying,
    /// Connectivity dropped during the write; the batch went back to pending.
    Aborted,
    /// Skipped: connectivity is offline.
    Offline,
    /// Skipped: another cycle is running.
    Busy,
    /// Skipped: a fatal remote error suspended syncing.
    Suspended,
}

/// Result of [`SyncEngine::run_cycle`] or [`SyncEngine::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// Entries newly marked synced.
    pub sent_count: usize,
    /// Entries marked failed (retrying or exhausted).
    pub failed_count: usize,
    /// Compressed bytes successfully written.
    pub bytes_sent: usize,
    /// How the (last) cycle ended.
    pub outcome: SyncOutcome,
}

impl SyncResult {
    fn skipped(outcome: SyncOutcome) -> Self {
        Self {
            sent_count: 0,
            failed_count: 0,
            bytes_sent: 0,
            outcome,
        }
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Cycles that looked at the buffer.
    pub cycles: u64,
    /// Batches written successfully.
    pub batches_sent: u64,
    /// Entries written successfully.
    pub entries_sent: u64,
    /// Entries whose write failed.
    pub entries_failed: u64,
    /// Compressed bytes written successfully.
    pub bytes_sent: u64,
    /// Time of the last successful write.
    pub last_success: Option<DateTime<Utc>>,
    /// Last failure reason.
    pub last_error: Option<String>,
}

enum Attempt {
    Done(WriteOutcome),
    TimedOut,
    ConnectivityLost,
}

/// Moves buffered entries to the remote store.
#[derive(Debug)]
pub struct SyncEngine {
    buffer: Arc<BufferStore>,
    remote: Arc<dyn RemoteStore>,
    compressor: Box<dyn Compressor>,
    connectivity: watch::Receiver<ConnectivityState>,
    options: SyncOptions,
    cycle: tokio::sync::Mutex<()>,
    suspended: Mutex<Option<String>>,
    stats: Mutex<SyncStats>,
}

impl SyncEngine {
    /// Create an engine draining `buffer` into `remote`.
    #[must_use]
    pub fn new(
        buffer: Arc<BufferStore>,
        remote: Arc<dyn RemoteStore>,
        compressor: Box<dyn Compressor>,
        connectivity: watch::Receiver<ConnectivityState>,
        options: SyncOptions,
    ) -> Self {
        Self {
            buffer,
            remote,
            compressor,
            connectivity,
            options,
            cycle: tokio::sync::Mutex::new(()),
            suspended: Mutex::new(None),
            stats: Mutex::new(SyncStats::default()),
        }
    }

    /// Whether a fatal error has suspended syncing.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspension().is_some()
    }

    /// Reason for the current suspension, if any.
    #[must_use]
    pub fn suspension(&self) -> Option<String> {
        self.suspended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Clear a fatal suspension once credentials have been refreshed.
    pub fn resume(&self) {
        if let Some(reason) = self
            .suspended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            info!(previous = %reason, "Sync resumed");
        }
    }

    /// Snapshot of the lifetime counters.
    #[must_use]
    pub fn stats(&self) -> SyncStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Run one sync cycle.
    ///
    /// Returns immediately when offline, suspended, or when another cycle is
    /// already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FatalSync`] when the remote rejects the credentials
    /// or configuration; syncing stays suspended until [`SyncEngine::resume`].
    /// Returns buffer errors as they occur.
    pub async fn run_cycle(&self) -> Result<SyncResult> {
        self.run_cycle_within(self.options.attempt_timeout).await
    }

    async fn run_cycle_within(&self, attempt_timeout: Duration) -> Result<SyncResult> {
        if self.is_suspended() {
            return Ok(SyncResult::skipped(SyncOutcome::Suspended));
        }
        if *self.connectivity.borrow() == ConnectivityState::Offline {
            return Ok(SyncResult::skipped(SyncOutcome::Offline));
        }
        let Ok(_cycle) = self.cycle.try_lock() else {
            return Ok(SyncResult::skipped(SyncOutcome::Busy));
        };

        self.update_stats(|s| s.cycles += 1);
        let batch = self
            .buffer
            .peek_batch(self.options.batch_max_count, self.options.batch_max_bytes)?;
        if batch.is_empty() {
            return Ok(SyncResult::skipped(SyncOutcome::Idle));
        }
        self.send(batch, attempt_timeout).await
    }

    async fn send(&self, mut batch: Vec<BufferEntry>, attempt_timeout: Duration) -> Result<SyncResult> {
        let mut shrunk = false;
        loop {
            let ids: Vec<u64> = batch.iter().map(|e| e.sequence_id).collect();
            self.buffer.mark_in_flight(&ids)?;

            let payload = match BatchPayload::build(&batch, self.compressor.as_ref()) {
                Ok(payload) => payload,
                Err(e) => {
                    self.buffer.revert_in_flight(&ids)?;
                    return Err(e);
                }
            };
            debug!(
                entries = ids.len(),
                raw_bytes = payload.raw_len,
                bytes = payload.body.len(),
                key = %payload.idempotency_key,
                "Sending batch"
            );

            match self.attempt(&payload, attempt_timeout).await {
                Attempt::Done(WriteOutcome::Success) => {
                    let sent = self.buffer.mark_synced(&ids)?;
                    let bytes = payload.body.len();
                    self.update_stats(|s| {
                        s.batches_sent += 1;
                        s.entries_sent += sent as u64;
                        s.bytes_sent += bytes as u64;
                        s.last_success = Some(Utc::now());
                    });
                    info!(count = sent, bytes, "Batch synced");
                    return Ok(SyncResult {
                        sent_count: sent,
                        failed_count: 0,
                        bytes_sent: bytes,
                        outcome: SyncOutcome::Sent,
                    });
                }
                Attempt::Done(WriteOutcome::PayloadTooLarge) if !shrunk && batch.len() > 1 => {
                    self.buffer.revert_in_flight(&ids)?;
                    let keep = batch.len() / 2;
                    warn!(from = batch.len(), to = keep, "Payload too large, shrinking batch");
                    batch.truncate(keep);
                    shrunk = true;
                }
                Attempt::Done(WriteOutcome::PayloadTooLarge) => {
                    return self.fail_batch(
                        &ids,
                        Error::TransientSync("payload too large after shrinking".to_string()),
                    );
                }
                Attempt::Done(WriteOutcome::Retryable(reason)) => {
                    return self.fail_batch(&ids, Error::TransientSync(reason));
                }
                Attempt::TimedOut if attempt_timeout < self.options.attempt_timeout => {
                    // bounded by a caller's deadline, not the remote's budget
                    self.buffer.revert_in_flight(&ids)?;
                    info!(count = ids.len(), "Deadline reached mid-write, batch returned to pending");
                    return Ok(SyncResult::skipped(SyncOutcome::Aborted));
                }
                Attempt::TimedOut => {
                    return self.fail_batch(
                        &ids,
                        Error::Timeout {
                            operation: format!("remote write after {attempt_timeout:?}"),
                        },
                    );
                }
                Attempt::Done(WriteOutcome::Fatal(reason)) => {
                    self.buffer.revert_in_flight(&ids)?;
                    error!(reason = %reason, "Fatal remote error, sync suspended until credentials are refreshed");
                    *self
                        .suspended
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
                    self.update_stats(|s| s.last_error = Some(reason.clone()));
                    return Err(Error::FatalSync(reason));
                }
                Attempt::ConnectivityLost => {
                    self.buffer.revert_in_flight(&ids)?;
                    info!(count = ids.len(), "Connectivity lost mid-write, batch returned to pending");
                    return Ok(SyncResult::skipped(SyncOutcome::Aborted));
                }
            }
        }
    }

    fn fail_batch(&self, ids: &[u64], error: Error) -> Result<SyncResult> {
        let report = self.buffer.mark_failed(ids)?;
        let failed = report.retrying + report.exhausted.len();
        warn!(count = failed, error = %error, "Batch write failed, will retry after backoff");
        self.update_stats(|s| {
            s.entries_failed += failed as u64;
            s.last_error = Some(error.to_string());
        });
        Ok(SyncResult {
            sent_count: 0,
            failed_count: failed,
            bytes_sent: 0,
            outcome: SyncOutcome::Retrying,
        })
    }

    async fn attempt(&self, payload: &BatchPayload, attempt_timeout: Duration) -> Attempt {
        let mut online = self.connectivity.clone();
        let went_offline = async move {
            let offline = online
                .wait_for(|s| *s == ConnectivityState::Offline)
                .await
                .is_ok();
            if !offline {
                // monitor gone: connectivity can no longer change
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            result = tokio::time::timeout(attempt_timeout, self.remote.write_batch(payload)) => {
                match result {
                    Ok(outcome) => Attempt::Done(outcome),
                    Err(_) => Attempt::TimedOut,
                }
            }
            () = went_offline => Attempt::ConnectivityLost,
        }
    }

    /// Send until nothing eligible remains, progress stops, or `deadline`
    /// passes. Totals are summed over all cycles; `outcome` is the last one.
    ///
    /// Each write is bounded by the time left, so no batch is left in
    /// flight when this returns. A write cut short by the deadline returns
    /// its batch to pending without a retry penalty.
    ///
    /// # Errors
    ///
    /// Returns the first error a cycle returns.
    pub async fn flush(&self, deadline: Duration) -> Result<SyncResult> {
        let until = Instant::now() + deadline;
        let mut total = SyncResult::skipped(SyncOutcome::Idle);

        loop {
            let remaining = until.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Flush deadline reached");
                break;
            }
            let result = self
                .run_cycle_within(remaining.min(self.options.attempt_timeout))
                .await?;
            total.sent_count += result.sent_count;
            total.failed_count += result.failed_count;
            total.bytes_sent += result.bytes_sent;
            total.outcome = result.outcome;

            match result.outcome {
                SyncOutcome::Sent => {}
                SyncOutcome::Busy => {
                    tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
                }
                _ => break,
            }
        }

        info!(
            sent = total.sent_count,
            failed = total.failed_count,
            outcome = ?total.outcome,
            "Flush finished"
        );
        Ok(total)
    }

    /// Cycle every `interval` or on `SyncNow`, until cancelled.
    ///
    /// Entries left in flight by an earlier, interrupted loop go back to
    /// pending before the first cycle. A cycle that sent a batch is followed immediately by another, so a
    /// backlog drains without waiting for the timer. Fatal remote errors are
    /// logged and leave the engine suspended; the loop keeps running.
    ///
    /// # Errors
    ///
    /// Returns buffer errors, which the supervisor treats as a component
    /// failure.
    pub async fn run(
        &self,
        interval: Duration,
        signals: &mut mpsc::Receiver<ConnectivitySignal>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        {
            let _cycle = self.cycle.lock().await;
            let reverted = self.buffer.revert_all_in_flight()?;
            if reverted > 0 {
                info!(count = reverted, "Returned stranded in-flight entries to pending");
            }
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                signal = signals.recv() => match signal {
                    Some(ConnectivitySignal::SyncNow) => debug!("Sync triggered by connectivity"),
                    Some(ConnectivitySignal::Suspend) => continue,
                    None => return Ok(()),
                },
                _ = ticker.tick() => {}
            }

            loop {
                match self.run_cycle().await {
                    Ok(result) if result.outcome == SyncOutcome::Sent => {
                        if cancel.is_cancelled() {
                            return Ok(());
                        }
                    }
                    Ok(_) | Err(Error::FatalSync(_)) => break,
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
