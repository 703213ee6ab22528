//! Batch payload encoding.
//!
//! A batch travels as NDJSON: one line per buffered entry carrying its
//! sequence id, priority and record. The body is then run through a
//! [`Compressor`] chosen by configuration.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::buffer::BufferEntry;
use crate::error::{Error, Result};
use crate::record::{Priority, TelemetryRecord};

/// Upper bound on the bytes a wire line adds around a record's own JSON.
///
/// Covers the sequence id, priority, field names, braces and newline.
pub const MAX_LINE_OVERHEAD: usize = 128;

/// One line of an encoded batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    /// Buffer sequence id.
    pub sequence_id: u64,
    /// Sync priority.
    pub priority: Priority,
    /// The telemetry record.
    pub record: TelemetryRecord,
}

#[derive(Serialize)]
struct WireLine<'a> {
    sequence_id: u64,
    priority: Priority,
    record: &'a TelemetryRecord,
}

impl<'a> From<&'a BufferEntry> for WireLine<'a> {
    fn from(entry: &'a BufferEntry) -> Self {
        Self {
            sequence_id: entry.sequence_id,
            priority: entry.priority,
            record: &entry.record,
        }
    }
}

/// Bytes `entry` occupies in an uncompressed batch, newline included.
///
/// # Errors
///
/// Returns an error if the record cannot be serialized.
pub fn wire_len(entry: &BufferEntry) -> Result<usize> {
    Ok(serde_json::to_vec(&WireLine::from(entry))?.len() + 1)
}

/// Serialize entries to NDJSON.
///
/// # Errors
///
/// Returns an error if any record cannot be serialized.
pub fn encode_batch(entries: &[BufferEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(entries.len() * 256);
    for entry in entries {
        serde_json::to_writer(&mut buf, &WireLine::from(entry))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Parse an NDJSON body back into wire records. Blank lines are skipped.
///
/// # Errors
///
/// Returns an error if any line is not a valid wire record.
pub fn decode_batch(body: &[u8]) -> Result<Vec<WireRecord>> {
    body.split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| serde_json::from_slice(line).map_err(Error::from))
        .collect()
}

/// Idempotency key for a batch: blake3 over its sequence ids.
///
/// A retried batch with the same entries carries the same key, so the remote
/// can drop a duplicate whose first attempt landed after the client timed out.
#[must_use]
pub fn idempotency_key(sequence_ids: &[u64]) -> String {
    let mut hasher = blake3::Hasher::new();
    for id in sequence_ids {
        hasher.update(&id.to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

// --- Compression ---

/// Configured payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    /// Send the NDJSON body as is.
    None,
    /// gzip (`Content-Encoding: gzip`).
    #[default]
    Gzip,
    /// zlib (`Content-Encoding: deflate`).
    Zlib,
}

impl CompressionKind {
    /// Build the compressor for this setting.
    #[must_use]
    pub fn compressor(self) -> Box<dyn Compressor> {
        match self {
            Self::None => Box::new(Identity),
            Self::Gzip => Box::new(Gzip),
            Self::Zlib => Box::new(Zlib),
        }
    }
}

impl std::fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Gzip => write!(f, "gzip"),
            Self::Zlib => write!(f, "zlib"),
        }
    }
}

/// A reversible payload transform.
pub trait Compressor: Send + Sync + std::fmt::Debug {
    /// `Content-Encoding` header value, `None` for the identity transform.
    fn content_encoding(&self) -> Option<&'static str>;

    /// Compress `data`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the encoder fails.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Reverse [`Compressor::compress`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if `data` is not valid for this encoding.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// No compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Compressor for Identity {
    fn content_encoding(&self) -> Option<&'static str> {
        None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// gzip via flate2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gzip;

impl Compressor for Gzip {
    fn content_encoding(&self) -> Option<&'static str> {
        Some("gzip")
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| Error::codec(format!("gzip write: {e}")))?;
        encoder
            .finish()
            .map_err(|e| Error::codec(format!("gzip finish: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::codec(format!("gzip decode: {e}")))?;
        Ok(out)
    }
}

/// zlib via flate2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Zlib;

impl Compressor for Zlib {
    fn content_encoding(&self) -> Option<&'static str> {
        Some("deflate")
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| Error::codec(format!("zlib write: {e}")))?;
        encoder
            .finish()
            .map_err(|e| Error::codec(format!("zlib finish: {e}")))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::codec(format!("zlib decode: {e}")))?;
        Ok(out)
    }
}

// --- Payload ---

/// An encoded, compressed batch ready for the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPayload {
    /// Compressed body.
    pub body: Vec<u8>,
    /// `Content-Encoding` of `body`.
    pub content_encoding: Option<&'static str>,
    /// Uncompressed NDJSON length.
    pub raw_len: usize,
    /// Sequence ids in the batch, in send order.
    pub sequence_ids: Vec<u64>,
    /// See [`idempotency_key`].
    pub idempotency_key: String,
}

impl BatchPayload {
    /// Encode and compress `entries`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    pub fn build(entries: &[BufferEntry], compressor: &dyn Compressor) -> Result<Self> {
        let raw = encode_batch(entries)?;
        let sequence_ids: Vec<u64> = entries.iter().map(|e| e.sequence_id).collect();
        Ok(Self {
            body: compressor.compress(&raw)?,
            content_encoding: compressor.content_encoding(),
            raw_len: raw.len(),
            idempotency_key: idempotency_key(&sequence_ids),
            sequence_ids,
        })
    }

    /// Number of entries in the batch.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.sequence_ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SyncState;
    use crate::record::Position;
    use chrono::{TimeZone, Utc};

    fn entry(seq: u64, priority: Priority) -> BufferEntry {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mut record = TelemetryRecord::new(
            "fleet-001",
            ts,
            Position {
                latitude: 40.0 + f64::from(u32::try_from(seq).unwrap()) * 0.001,
                longitude: -3.7,
            },
        );
        record.speed = Some(50.0);
        BufferEntry {
            sequence_id: seq,
            priority,
            sync_state: SyncState::Pending,
            retry_count: 0,
            next_attempt_at: ts,
            created_at: ts,
            payload_bytes: 0,
            record,
        }
    }

    #[test]
    fn test_encode_decode_batch() {
        let entries = vec![entry(1, Priority::Critical), entry(2, Priority::Normal)];
        let body = encode_batch(&entries).unwrap();
        assert_eq!(body.iter().filter(|b| **b == b'\n').count(), 2);

        let decoded = decode_batch(&body).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].sequence_id, 1);
        assert_eq!(decoded[0].priority, Priority::Critical);
        assert_eq!(decoded[1].record, entries[1].record);
    }

    #[test]
    fn test_wire_len_matches_encoding() {
        let entries = vec![entry(7, Priority::High), entry(8, Priority::Normal)];
        let total: usize = entries.iter().map(|e| wire_len(e).unwrap()).sum();
        assert_eq!(total, encode_batch(&entries).unwrap().len());
    }

    #[test]
    fn test_line_overhead_bound() {
        let mut e = entry(u64::MAX, Priority::Critical);
        e.record.metadata.clear();
        let record_len = serde_json::to_vec(&e.record).unwrap().len();
        assert!(wire_len(&e).unwrap() - record_len <= MAX_LINE_OVERHEAD);
    }

    #[test]
    fn test_compress_none() {
        let data = b"hello world";
        let result = Identity.compress(data).unwrap();
        assert_eq!(result, data);
        assert_eq!(Identity.content_encoding(), None);
    }

    #[test]
    fn test_compress_round_trip_reproduces_records() {
        let entries: Vec<BufferEntry> = (1..=20).map(|i| entry(i, Priority::Normal)).collect();
        for kind in [CompressionKind::None, CompressionKind::Gzip, CompressionKind::Zlib] {
            let compressor = kind.compressor();
            let payload = BatchPayload::build(&entries, compressor.as_ref()).unwrap();
            let raw = compressor.decompress(&payload.body).unwrap();
            assert_eq!(raw.len(), payload.raw_len);

            let decoded = decode_batch(&raw).unwrap();
            let records: Vec<_> = decoded.into_iter().map(|w| w.record).collect();
            let expected: Vec<_> = entries.iter().map(|e| e.record.clone()).collect();
            assert_eq!(records, expected, "{kind}");
        }
    }

    #[test]
    fn test_gzip_shrinks_repetitive_payload() {
        let entries: Vec<BufferEntry> = (1..=50).map(|i| entry(i, Priority::Normal)).collect();
        let payload = BatchPayload::build(&entries, &Gzip).unwrap();
        assert!(payload.body.len() < payload.raw_len);
        assert_eq!(payload.content_encoding, Some("gzip"));
    }

    #[test]
    fn test_zlib_content_encoding() {
        assert_eq!(Zlib.content_encoding(), Some("deflate"));
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let err = Gzip.decompress(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn test_idempotency_key_stable() {
        assert_eq!(idempotency_key(&[1, 2, 3]), idempotency_key(&[1, 2, 3]));
        assert_ne!(idempotency_key(&[1, 2, 3]), idempotency_key(&[1, 2]));
        assert_eq!(idempotency_key(&[]).len(), 64);
    }

    #[test]
    fn test_payload_metadata() {
        let entries = vec![entry(4, Priority::Normal), entry(9, Priority::Normal)];
        let payload = BatchPayload::build(&entries, &Identity).unwrap();
        assert_eq!(payload.entry_count(), 2);
        assert_eq!(payload.sequence_ids, vec![4, 9]);
        assert_eq!(payload.idempotency_key, idempotency_key(&[4, 9]));
    }

    #[test]
    fn test_compression_kind_serde() {
        let kind: CompressionKind = serde_json::from_str("\"zlib\"").unwrap();
        assert_eq!(kind, CompressionKind::Zlib);
        assert_eq!(CompressionKind::default(), CompressionKind::Gzip);
    }
}
