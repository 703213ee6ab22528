//! JSON-lines acquisition: one [`Observation`] per line, for replay and
//! integration with other producers.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::record::Observation;

use super::{open_lines, AcquisitionSource, Line, DEFAULT_BAUD_RATE};

const SOURCE: &str = "json_lines";

/// Streams observations from a JSON-lines file or stdin.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
    baud_rate: u32,
}

impl JsonLinesSource {
    /// Read from `path`; `-` reads stdin.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }

    /// Serial line speed used when `path` is a device.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }
}

#[async_trait]
impl AcquisitionSource for JsonLinesSource {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn run(&self, tx: &mpsc::Sender<Observation>, cancel: &CancellationToken) -> Result<()> {
        let mut lines = open_lines(SOURCE, &self.path, self.baud_rate).await?;
        let (mut read, mut skipped) = (0u64, 0u64);

        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => line.map_err(|e| Error::acquisition(SOURCE, e.to_string()))?,
            };
            let line = match line {
                Line::Text(line) => line,
                Line::Garbled => {
                    skipped += 1;
                    warn!("Skipping non-UTF-8 line");
                    continue;
                }
                Line::End => {
                    info!(read, skipped, "JSON-lines input ended");
                    return Ok(());
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str::<Observation>(line) {
                Ok(observation) => {
                    read += 1;
                    if tx.send(observation).await.is_err() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "Skipping malformed observation");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Priority;

    #[tokio::test]
    async fn test_reads_observations_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"device_id":"fleet-001","timestamp":"2025-06-01T08:00:00Z","position":{"latitude":59.3293,"longitude":18.0686}}"#,
                "\n\nnot json\n",
                r#"{"device_id":"fleet-001","timestamp":"2025-06-01T08:00:01Z","position":{"latitude":59.33,"longitude":18.07},"speed":42.5,"priority":"critical","metadata":{"ignition":true}}"#,
                "\n",
            ),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        JsonLinesSource::new(&path)
            .run(&tx, &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.priority, Priority::Normal);
        assert_eq!(first.record.speed, None);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.priority, Priority::Critical);
        assert_eq!(second.record.speed, Some(42.5));
        assert_eq!(second.record.metadata.len(), 1);

        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replay.jsonl");
        let mut input = b"{\"device_id\":\"\xff\xfe\"}\n".to_vec();
        input.extend_from_slice(
            br#"{"device_id":"fleet-002","timestamp":"2025-06-01T08:00:00Z","position":{"latitude":10.938711676632721,"longitude":-0.1}}"#,
        );
        input.push(b'\n');
        std::fs::write(&path, input).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        JsonLinesSource::new(&path)
            .run(&tx, &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);

        let observation = rx.recv().await.unwrap();
        assert_eq!(observation.record.device_id, "fleet-002");
        assert_eq!(observation.record.position.latitude, 10.938_711_676_632_721);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_stops_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jsonl");
        std::fs::write(&path, "").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(1);
        assert!(JsonLinesSource::new(&path).run(&tx, &cancel).await.is_ok());
    }
}
