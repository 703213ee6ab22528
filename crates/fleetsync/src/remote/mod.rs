//! Remote telemetry store interface.
//!
//! The sync engine only needs one operation from the backend: write a batch
//! and say how it went. The client handle is constructed explicitly and
//! passed in; nothing here keeps process-wide connection state.

pub mod http;

use async_trait::async_trait;

use crate::codec::BatchPayload;
use crate::error::Result;

pub use http::HttpRemoteStore;

/// Result of one batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The batch was stored.
    Success,
    /// Network-class failure; the same batch may succeed later.
    Retryable(String),
    /// Authentication or configuration failure; retrying will not help.
    Fatal(String),
    /// The remote refused the payload size.
    PayloadTooLarge,
}

/// A backend that accepts encoded telemetry batches.
#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Write one batch. Transport errors are reported as outcomes, not errors.
    async fn write_batch(&self, payload: &BatchPayload) -> WriteOutcome;

    /// Reload credentials from their external source.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential source cannot be read.
    async fn refresh_credentials(&self) -> Result<()>;
}

#[cfg(test)]
pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Remote store that replays scripted outcomes, then succeeds.
    #[derive(Debug, Clone, Default)]
    pub struct ScriptedRemote {
        pub outcomes: Arc<Mutex<VecDeque<WriteOutcome>>>,
        pub received: Arc<Mutex<Vec<BatchPayload>>>,
        pub delay: Arc<Mutex<Option<Duration>>>,
        pub refreshes: Arc<Mutex<u32>>,
    }

    impl ScriptedRemote {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_outcomes(outcomes: impl IntoIterator<Item = WriteOutcome>) -> Self {
            let remote = Self::new();
            remote.outcomes.lock().unwrap().extend(outcomes);
            remote
        }

        pub fn push(&self, outcome: WriteOutcome) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn received(&self) -> Vec<BatchPayload> {
            self.received.lock().unwrap().clone()
        }

        pub fn refresh_count(&self) -> u32 {
            *self.refreshes.lock().unwrap()
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedRemote {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn write_batch(&self, payload: &BatchPayload) -> WriteOutcome {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.received.lock().unwrap().push(payload.clone());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(WriteOutcome::Success)
        }

        async fn refresh_credentials(&self) -> Result<()> {
            *self.refreshes.lock().unwrap() += 1;
            Ok(())
        }
    }
}
