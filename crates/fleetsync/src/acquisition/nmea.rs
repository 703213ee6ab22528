//! NMEA 0183 acquisition.
//!
//! Reads sentences from a GNSS receiver's serial device (or a capture file),
//! checks each checksum, and combines a `GGA` with the `RMC` of the same
//! second into one [`TelemetryRecord`]. Talker prefixes (`GP`, `GN`, `GL`,
//! ...) are ignored; sentence types other than `GGA` and `RMC` are skipped.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::{FixQuality, FixType, Observation, Position, TelemetryRecord};

use super::{open_lines, AcquisitionSource, Line, DEFAULT_BAUD_RATE};

const SOURCE: &str = "nmea";

/// Knots to km/h.
pub const KNOTS_TO_KMH: f64 = 1.852;

/// `GGA`: fix data.
#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    /// UTC time of the fix.
    pub time: NaiveTime,
    /// Position, absent without a fix.
    pub position: Option<Position>,
    /// Fix quality indicator; 0 means no fix.
    pub fix_quality: u8,
    /// Satellites in use.
    pub satellites: u8,
    /// Horizontal dilution of precision.
    pub hdop: Option<f64>,
    /// Altitude above mean sea level in metres.
    pub altitude: Option<f64>,
}

impl Gga {
    /// Fix dimension implied by the quality indicator and altitude.
    #[must_use]
    pub fn fix_type(&self) -> FixType {
        match (self.fix_quality, self.altitude) {
            (0, _) => FixType::NoFix,
            (_, Some(_)) => FixType::ThreeD,
            (_, None) => FixType::TwoD,
        }
    }
}

/// `RMC`: recommended minimum data.
#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    /// UTC time of the fix.
    pub time: NaiveTime,
    /// Status `A` (valid) or `V` (void).
    pub valid: bool,
    /// Position, absent when void.
    pub position: Option<Position>,
    /// Speed over ground in knots.
    pub speed_knots: Option<f64>,
    /// Course over ground in degrees true.
    pub course: Option<f64>,
    /// UTC date.
    pub date: Option<NaiveDate>,
}

/// A parsed sentence of interest.
#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    /// Fix data.
    Gga(Gga),
    /// Recommended minimum.
    Rmc(Rmc),
}

/// Parse one line.
///
/// Returns `Ok(None)` for well-formed sentences of other types.
///
/// # Errors
///
/// Returns [`Error::Acquisition`] if the line is not framed as a sentence,
/// the checksum does not match, or a field of a `GGA`/`RMC` is malformed.
pub fn parse_sentence(line: &str) -> Result<Option<Sentence>> {
    let body = verify_checksum(line.trim())?;
    let fields: Vec<&str> = body.split(',').collect();
    let tag = fields[0];
    if tag.len() < 5 || !tag.is_ascii() {
        return Err(Error::acquisition(SOURCE, format!("bad sentence tag '{tag}'")));
    }

    match &tag[tag.len() - 3..] {
        "GGA" => parse_gga(&fields).map(|gga| Some(Sentence::Gga(gga))),
        "RMC" => parse_rmc(&fields).map(|rmc| Some(Sentence::Rmc(rmc))),
        _ => Ok(None),
    }
}

/// Check framing and checksum, returning the body between `$` and `*`.
///
/// # Errors
///
/// Returns [`Error::Acquisition`] on bad framing or checksum mismatch.
pub fn verify_checksum(sentence: &str) -> Result<&str> {
    let rest = sentence
        .strip_prefix('$')
        .ok_or_else(|| Error::acquisition(SOURCE, "sentence does not start with '$'"))?;
    let (body, checksum) = rest
        .rsplit_once('*')
        .ok_or_else(|| Error::acquisition(SOURCE, "sentence has no checksum"))?;

    let expected = u8::from_str_radix(checksum, 16)
        .map_err(|_| Error::acquisition(SOURCE, format!("bad checksum field '{checksum}'")))?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return Err(Error::acquisition(
            SOURCE,
            format!("checksum mismatch: expected {expected:02X}, got {actual:02X}"),
        ));
    }
    Ok(body)
}

fn parse_gga(fields: &[&str]) -> Result<Gga> {
    Ok(Gga {
        time: parse_time(field(fields, 1))?,
        position: parse_position(fields, 2)?,
        fix_quality: parse_opt::<u8>(field(fields, 6), "fix quality")?.unwrap_or(0),
        satellites: parse_opt::<u8>(field(fields, 7), "satellites")?.unwrap_or(0),
        hdop: parse_opt(field(fields, 8), "hdop")?,
        altitude: parse_opt(field(fields, 9), "altitude")?,
    })
}

fn parse_rmc(fields: &[&str]) -> Result<Rmc> {
    let valid = match field(fields, 2) {
        "A" => true,
        "V" => false,
        other => {
            return Err(Error::acquisition(SOURCE, format!("bad RMC status '{other}'")));
        }
    };
    Ok(Rmc {
        time: parse_time(field(fields, 1))?,
        valid,
        position: parse_position(fields, 3)?,
        speed_knots: parse_opt(field(fields, 7), "speed")?,
        course: parse_opt(field(fields, 8), "course")?,
        date: parse_date(field(fields, 9))?,
    })
}

fn field<'a>(fields: &[&'a str], index: usize) -> &'a str {
    fields.get(index).copied().unwrap_or("")
}

fn parse_opt<T: std::str::FromStr>(value: &str, name: &str) -> Result<Option<T>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| Error::acquisition(SOURCE, format!("bad {name} '{value}'")))
}

/// Latitude at `fields[index]`, its hemisphere next, then longitude likewise.
fn parse_position(fields: &[&str], index: usize) -> Result<Option<Position>> {
    let latitude = parse_coordinate(field(fields, index), field(fields, index + 1), 'N', 'S')?;
    let longitude = parse_coordinate(field(fields, index + 2), field(fields, index + 3), 'E', 'W')?;
    Ok(latitude
        .zip(longitude)
        .map(|(latitude, longitude)| Position {
            latitude,
            longitude,
        }))
}

/// `DDMM.MMMM` / `DDDMM.MMMM` to signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str, positive: char, negative: char) -> Result<Option<f64>> {
    let Some(raw) = parse_opt::<f64>(value, "coordinate")? else {
        return Ok(None);
    };
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    if !(0.0..60.0).contains(&minutes) {
        return Err(Error::acquisition(SOURCE, format!("bad coordinate '{value}'")));
    }
    let decimal = degrees + minutes / 60.0;

    let mut chars = hemisphere.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c == positive => Ok(Some(decimal)),
        (Some(c), None) if c == negative => Ok(Some(-decimal)),
        _ => Err(Error::acquisition(SOURCE, format!("bad hemisphere '{hemisphere}'"))),
    }
}

/// `hhmmss` with optional fractional seconds.
fn parse_time(value: &str) -> Result<NaiveTime> {
    let bad = || Error::acquisition(SOURCE, format!("bad time '{value}'"));
    if value.len() < 6 || !value.is_ascii() {
        return Err(bad());
    }
    let hours: u32 = value[0..2].parse().map_err(|_| bad())?;
    let minutes: u32 = value[2..4].parse().map_err(|_| bad())?;
    let seconds: f64 = value[4..].parse().map_err(|_| bad())?;
    if !(0.0..60.0).contains(&seconds) {
        return Err(bad());
    }
    // bounded to [0, 60) and [0, 1000) above
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (whole, millis) = (
        seconds.trunc() as u32,
        ((seconds.fract() * 1000.0).round() as u32).min(999),
    );
    NaiveTime::from_hms_milli_opt(hours, minutes, whole, millis).ok_or_else(bad)
}

/// `ddmmyy`; years before 80 are 20xx.
fn parse_date(value: &str) -> Result<Option<NaiveDate>> {
    if value.is_empty() {
        return Ok(None);
    }
    let bad = || Error::acquisition(SOURCE, format!("bad date '{value}'"));
    if value.len() != 6 || !value.is_ascii() {
        return Err(bad());
    }
    let day: u32 = value[0..2].parse().map_err(|_| bad())?;
    let month: u32 = value[2..4].parse().map_err(|_| bad())?;
    let yy: i32 = value[4..6].parse().map_err(|_| bad())?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
    NaiveDate::from_ymd_opt(year, month, day)
        .map(Some)
        .ok_or_else(bad)
}

/// Pairs `GGA` and `RMC` sentences into records.
#[derive(Debug)]
pub struct FixAssembler {
    device_id: String,
    last_gga: Option<Gga>,
}

impl FixAssembler {
    /// Create an assembler stamping records with `device_id`.
    #[must_use]
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            last_gga: None,
        }
    }

    /// Feed one sentence; returns a record when an `RMC` completes a fix.
    ///
    /// Void or dateless `RMC` sentences produce nothing. Fix quality and
    /// altitude come from a `GGA` with the same timestamp, if one was seen.
    pub fn push(&mut self, sentence: Sentence) -> Option<TelemetryRecord> {
        match sentence {
            Sentence::Gga(gga) => {
                self.last_gga = Some(gga);
                None
            }
            Sentence::Rmc(rmc) => self.assemble(&rmc),
        }
    }

    fn assemble(&mut self, rmc: &Rmc) -> Option<TelemetryRecord> {
        if !rmc.valid {
            return None;
        }
        let position = rmc.position?;
        let date = rmc.date?;
        let timestamp = Utc.from_utc_datetime(&date.and_time(rmc.time));

        let mut record = TelemetryRecord::new(self.device_id.clone(), timestamp, position);
        record.speed = rmc.speed_knots.map(|knots| knots * KNOTS_TO_KMH);
        record.heading = rmc.course.map(|course| course.rem_euclid(360.0));

        match self.last_gga.take().filter(|gga| gga.time == rmc.time) {
            Some(gga) => {
                record.altitude = gga.altitude;
                record.quality = FixQuality {
                    fix: gga.fix_type(),
                    satellites: gga.satellites,
                    hdop: gga.hdop,
                };
            }
            None => record.quality.fix = FixType::TwoD,
        }
        Some(record)
    }
}

/// Streams records from an NMEA device or capture file.
#[derive(Debug, Clone)]
pub struct NmeaSource {
    path: PathBuf,
    device_id: String,
    baud_rate: u32,
}

impl NmeaSource {
    /// Read from `path` (`-` for stdin), stamping records with `device_id`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, device_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            device_id: device_id.into(),
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
impl AcquisitionSource for NmeaSource {
    fn name(&self) -> &'static str {
        SOURCE
    }

    async fn run(&self, tx: &mpsc::Sender<Observation>, cancel: &CancellationToken) -> Result<()> {
        let mut lines = open_lines(SOURCE, &self.path, self.baud_rate).await?;
        let mut assembler = FixAssembler::new(self.device_id.clone());
        let mut discarded = 0u64;

        info!(path = %self.path.display(), "Reading NMEA sentences");
        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => line.map_err(|e| Error::acquisition(SOURCE, e.to_string()))?,
            };
            let line = match line {
                Line::Text(line) => line,
                Line::Garbled => {
                    discarded += 1;
                    debug!("Discarding non-UTF-8 NMEA line");
                    continue;
                }
                Line::End => {
                    info!(discarded, "NMEA stream ended");
                    return Ok(());
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match parse_sentence(&line) {
                Ok(Some(sentence)) => {
                    if let Some(record) = assembler.push(sentence) {
                        if tx.send(Observation::normal(record)).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    discarded += 1;
                    debug!(error = %e, "Discarding NMEA sentence");
                }
            }
        }
    }
}
