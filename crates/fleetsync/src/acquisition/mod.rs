//! Acquisition sources.
//!
//! A source produces [`Observation`]s from a GNSS receiver or a replay file.
//! Sources are untrusted: the orchestrator validates every record before it
//! reaches the buffer.

pub mod json_lines;
pub mod nmea;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::record::Observation;

pub use json_lines::JsonLinesSource;
pub use nmea::NmeaSource;

/// Produces observations until cancelled or its input ends.
#[async_trait]
pub trait AcquisitionSource: Send + Sync + std::fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Stream observations into `tx`.
    ///
    /// Returns `Ok(())` when cancelled, when the input ends, or when the
    /// receiver is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Acquisition`] if the input cannot be opened or read.
    async fn run(&self, tx: &mpsc::Sender<Observation>, cancel: &CancellationToken) -> Result<()>;
}

/// Which acquisition source to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionKind {
    /// NMEA 0183 sentences from a receiver.
    #[default]
    Nmea,
    /// One JSON observation per line.
    JsonLines,
}

impl std::fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nmea => write!(f, "nmea"),
            Self::JsonLines => write!(f, "json_lines"),
        }
    }
}

/// Baud rate used when none is configured.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Build the source for `kind` reading from `path`.
///
/// `baud_rate` applies only when `path` is a serial device.
#[must_use]
pub fn build_source(
    kind: AcquisitionKind,
    path: &Path,
    device_id: &str,
    baud_rate: u32,
) -> Box<dyn AcquisitionSource> {
    match kind {
        AcquisitionKind::Nmea => Box::new(NmeaSource::new(path, device_id).with_baud_rate(baud_rate)),
        AcquisitionKind::JsonLines => Box::new(JsonLinesSource::new(path).with_baud_rate(baud_rate)),
    }
}

/// Longer lines are cut and reported as garbled.
const MAX_LINE_BYTES: u64 = 1024 * 1024;

/// One line read from a source input.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    /// A line of text without its terminator.
    Text(String),
    /// A line that is not valid UTF-8, e.g. line noise on a serial port.
    Garbled,
    /// The input ended.
    End,
}

/// Byte-oriented line reader over stdin, a replay file, or a serial port.
struct LineReader {
    inner: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    buf: Vec<u8>,
}

impl LineReader {
    fn new(reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::with_capacity(256),
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Line> {
        self.buf.clear();
        let read = (&mut self.inner)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut self.buf)
            .await?;
        if read == 0 {
            return Ok(Line::End);
        }
        if read as u64 == MAX_LINE_BYTES && self.buf.last() != Some(&b'\n') {
            return Ok(Line::Garbled);
        }
        Ok(match std::str::from_utf8(&self.buf) {
            Ok(text) => Line::Text(text.trim_end_matches(['\r', '\n']).to_string()),
            Err(_) => Line::Garbled,
        })
    }
}

/// Open `path` for line reading.
///
/// `-` is stdin and a regular file is replayed as-is. Anything else is
/// opened as a serial device at `baud_rate`, 8N1 without flow control.
async fn open_lines(source_name: &'static str, path: &Path, baud_rate: u32) -> Result<LineReader> {
    if path == Path::new("-") {
        return Ok(LineReader::new(Box::new(tokio::io::stdin())));
    }

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| cannot_open(source_name, path, e))?;
    if metadata.is_file() {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| cannot_open(source_name, path, e))?;
        return Ok(LineReader::new(Box::new(file)));
    }

    let port = tokio_serial::new(path.to_string_lossy(), baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| cannot_open(source_name, path, e))?;
    debug!(path = %path.display(), baud_rate, "Opened serial device");
    Ok(LineReader::new(Box::new(port)))
}

fn cannot_open(source_name: &'static str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::acquisition(source_name, format!("cannot open {}: {e}", path.display()))
}
