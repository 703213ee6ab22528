//! HTTP remote store.
//!
//! POSTs each batch as NDJSON to a per-device URL. The endpoint may contain
//! a `{device_id}` placeholder, e.g.
//! `https://ingest.example.com/vehicles/{device_id}/history`.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::codec::BatchPayload;
use crate::error::{Error, Result};

use super::{RemoteStore, WriteOutcome};

/// Header carrying the batch idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Remote store speaking plain HTTPS.
#[derive(Debug)]
pub struct HttpRemoteStore {
    client: reqwest::Client,
    url: String,
    token: RwLock<Option<String>>,
    token_file: Option<PathBuf>,
}

impl HttpRemoteStore {
    /// Build a client for `endpoint` on behalf of `device_id`.
    ///
    /// A token file, when given, takes precedence over an inline token and
    /// is re-read by [`RemoteStore::refresh_credentials`].
    ///
    /// # Errors
    ///
    /// Returns an error if the token file cannot be read or the HTTP client
    /// cannot be built.
    pub fn new(
        endpoint: &str,
        device_id: &str,
        auth_token: Option<String>,
        token_file: Option<PathBuf>,
        timeout: Duration,
    ) -> Result<Self> {
        let token = match &token_file {
            Some(path) => Some(read_token(&std::fs::read_to_string(path)?)),
            None => auth_token,
        };

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("fleetsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: endpoint.replace("{device_id}", device_id),
            token: RwLock::new(token.filter(|t| !t.is_empty())),
            token_file,
        })
    }

    /// The resolved request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn write_batch(&self, payload: &BatchPayload) -> WriteOutcome {
        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .header(IDEMPOTENCY_HEADER, &payload.idempotency_key)
            .body(payload.body.clone());

        if let Some(encoding) = payload.content_encoding {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        if let Some(token) = self.token.read().await.as_deref() {
            request = request.bearer_auth(token);
        }

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) => return classify_error(&e),
        };
        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        debug!(
            status = status.as_u16(),
            entries = payload.entry_count(),
            bytes = payload.body.len(),
            "Remote write completed"
        );
        classify_status(status)
    }

    async fn refresh_credentials(&self) -> Result<()> {
        let Some(path) = &self.token_file else {
            return Ok(());
        };
        let raw = tokio::fs::read_to_string(path).await?;
        let token = read_token(&raw);
        *self.token.write().await = (!token.is_empty()).then_some(token);
        info!("Reloaded remote credentials from {}", path.display());
        Ok(())
    }
}

/// Map an HTTP status to a write outcome.
#[must_use]
pub fn classify_status(status: StatusCode) -> WriteOutcome {
    if status.is_success() {
        return WriteOutcome::Success;
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            WriteOutcome::Fatal(format!("remote rejected credentials: {status}"))
        }
        StatusCode::PAYLOAD_TOO_LARGE => WriteOutcome::PayloadTooLarge,
        _ => WriteOutcome::Retryable(format!("unexpected status: {status}")),
    }
}

/// Map a transport error to a write outcome.
///
/// A request that cannot be built (bad URL, unencodable header) fails the
/// same way every time; everything else may succeed later.
#[must_use]
pub fn classify_error(err: &reqwest::Error) -> WriteOutcome {
    if err.is_builder() {
        WriteOutcome::Fatal(format!("cannot build request: {err}"))
    } else {
        WriteOutcome::Retryable(err.to_string())
    }
}

fn read_token(raw: &str) -> String {
    raw.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BatchPayload, Identity};

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), WriteOutcome::Success);
        assert_eq!(classify_status(StatusCode::NO_CONTENT), WriteOutcome::Success);
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            WriteOutcome::Fatal(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            WriteOutcome::Fatal(_)
        ));
        assert_eq!(
            classify_status(StatusCode::PAYLOAD_TOO_LARGE),
            WriteOutcome::PayloadTooLarge
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            WriteOutcome::Retryable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            WriteOutcome::Retryable(_)
        ));
    }

    #[test]
    fn test_url_template() {
        let store = HttpRemoteStore::new(
            "https://ingest.example.com/vehicles/{device_id}/history",
            "fleet-042",
            None,
            None,
            Duration::from_secs(15),
        )
        .unwrap();
        assert_eq!(
            store.url(),
            "https://ingest.example.com/vehicles/fleet-042/history"
        );
    }

    #[tokio::test]
    async fn test_token_file_and_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "first-token\n").unwrap();

        let store = HttpRemoteStore::new(
            "https://ingest.example.com",
            "fleet-001",
            Some("inline".to_string()),
            Some(path.clone()),
            Duration::from_secs(15),
        )
        .unwrap();
        assert_eq!(store.token.read().await.as_deref(), Some("first-token"));

        std::fs::write(&path, "second-token").unwrap();
        store.refresh_credentials().await.unwrap();
        assert_eq!(store.token.read().await.as_deref(), Some("second-token"));
    }

    #[tokio::test]
    async fn test_refresh_without_file_is_noop() {
        let store = HttpRemoteStore::new(
            "https://ingest.example.com",
            "fleet-001",
            Some("inline".to_string()),
            None,
            Duration::from_secs(15),
        )
        .unwrap();
        store.refresh_credentials().await.unwrap();
        assert_eq!(store.token.read().await.as_deref(), Some("inline"));
    }

    #[test]
    fn test_missing_token_file() {
        let result = HttpRemoteStore::new(
            "https://ingest.example.com",
            "fleet-001",
            None,
            Some(PathBuf::from("/nonexistent/fleetsync/token")),
            Duration::from_secs(15),
        );
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_malformed_endpoint_is_fatal() {
        let store = HttpRemoteStore::new(
            "http://ingest example.com/vehicles/{device_id}",
            "fleet-001",
            None,
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        let payload = BatchPayload::build(&[], &Identity).unwrap();
        assert!(matches!(
            store.write_batch(&payload).await,
            WriteOutcome::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_unencodable_token_is_fatal() {
        let store = HttpRemoteStore::new(
            "http://127.0.0.1:9/ingest",
            "fleet-001",
            Some("line\nbreak".to_string()),
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        let payload = BatchPayload::build(&[], &Identity).unwrap();
        let outcome = store.write_batch(&payload).await;
        assert!(matches!(outcome, WriteOutcome::Fatal(_)), "{outcome:?}");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let store = HttpRemoteStore::new(
            "http://127.0.0.1:9/ingest",
            "fleet-001",
            None,
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        let payload = BatchPayload::build(&[], &Identity).unwrap();
        assert!(matches!(
            store.write_batch(&payload).await,
            WriteOutcome::Retryable(_)
        ));
    }
}
