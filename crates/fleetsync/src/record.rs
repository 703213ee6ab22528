//! Core telemetry types for fleetsync.
//!
//! This module defines the record a vehicle unit produces for each GPS fix,
//! the priority it is buffered with, and the local validation every record
//! passes before it is stored.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Geographic position in decimal degrees (WGS84).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude in `[-90, 90]`.
    pub latitude: f64,
    /// Longitude in `[-180, 180]`.
    pub longitude: f64,
}

/// GNSS fix dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FixType {
    /// No usable fix.
    #[default]
    #[serde(rename = "none")]
    NoFix,
    /// Two-dimensional fix (no altitude).
    #[serde(rename = "2d")]
    TwoD,
    /// Three-dimensional fix.
    #[serde(rename = "3d")]
    ThreeD,
}

impl std::fmt::Display for FixType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoFix => write!(f, "none"),
            Self::TwoD => write!(f, "2d"),
            Self::ThreeD => write!(f, "3d"),
        }
    }
}

/// Quality indicators reported with a fix.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FixQuality {
    /// Fix dimension.
    pub fix: FixType,
    /// Satellites used in the solution.
    pub satellites: u8,
    /// Horizontal dilution of precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdop: Option<f64>,
}

/// A scalar metadata value attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Free-form text.
    Text(String),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// One telemetry observation from a vehicle unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Identifier of the producing unit.
    pub device_id: String,

    /// When the fix was taken.
    pub timestamp: DateTime<Utc>,

    /// Where the unit was.
    pub position: Position,

    /// Ground speed in km/h.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,

    /// Course over ground in degrees, `[0, 360)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,

    /// Altitude above mean sea level in metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,

    /// Fix quality.
    #[serde(default)]
    pub quality: FixQuality,

    /// Additional scalar attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, MetadataValue>,
}

impl TelemetryRecord {
    /// Create a record with only the required fields set.
    #[must_use]
    pub fn new(device_id: impl Into<String>, timestamp: DateTime<Utc>, position: Position) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp,
            position,
            speed: None,
            heading: None,
            altitude: None,
            quality: FixQuality::default(),
            metadata: BTreeMap::new(),
        }
    }

    /// Check the record against the local acceptance rules.
    ///
    /// Boundaries are inclusive: a latitude of exactly 90.0 is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.device_id.trim().is_empty() {
            return Err(Error::validation("device_id", "must not be empty"));
        }

        let Position {
            latitude,
            longitude,
        } = self.position;
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(Error::validation(
                "latitude",
                format!("{latitude} is outside [-90, 90]"),
            ));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(Error::validation(
                "longitude",
                format!("{longitude} is outside [-180, 180]"),
            ));
        }

        if let Some(speed) = self.speed {
            if !speed.is_finite() || speed < 0.0 {
                return Err(Error::validation(
                    "speed",
                    format!("{speed} is not a non-negative number"),
                ));
            }
        }
        if let Some(heading) = self.heading {
            if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
                return Err(Error::validation(
                    "heading",
                    format!("{heading} is outside [0, 360)"),
                ));
            }
        }
        if let Some(altitude) = self.altitude {
            if !altitude.is_finite() {
                return Err(Error::validation("altitude", "must be finite"));
            }
        }
        if let Some(hdop) = self.quality.hdop {
            if !hdop.is_finite() || hdop < 0.0 {
                return Err(Error::validation(
                    "hdop",
                    format!("{hdop} is not a non-negative number"),
                ));
            }
        }

        for (key, value) in &self.metadata {
            if key.is_empty() {
                return Err(Error::validation("metadata", "keys must not be empty"));
            }
            if let MetadataValue::Float(v) = value {
                if !v.is_finite() {
                    return Err(Error::validation(
                        "metadata",
                        format!("value for '{key}' must be finite"),
                    ));
                }
            }
        }

        Ok(())
    }

    /// [`TelemetryRecord::validate`], and also reject a timestamp more than
    /// `max_future_skew` ahead of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first offending field.
    pub fn validate_at(&self, now: DateTime<Utc>, max_future_skew: std::time::Duration) -> Result<()> {
        self.validate()?;

        let latest = chrono::Duration::from_std(max_future_skew)
            .ok()
            .and_then(|skew| now.checked_add_signed(skew));
        if let Some(latest) = latest {
            if self.timestamp > latest {
                return Err(Error::validation(
                    "timestamp",
                    format!("{} is ahead of the local clock ({now})", self.timestamp),
                ));
            }
        }
        Ok(())
    }
}

/// Sync priority of a buffered record. Higher tiers are sent first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Routine position report.
    #[default]
    Normal,
    /// Operationally relevant (e.g. geofence crossing).
    High,
    /// Must reach the backend as soon as possible.
    Critical,
}

impl Priority {
    /// Integer rank stored in the buffer, larger is more urgent.
    #[must_use]
    pub fn rank(self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::High => 1,
            Self::Critical => 2,
        }
    }

    /// Inverse of [`Priority::rank`]; unknown ranks map to `Normal`.
    #[must_use]
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            2 => Self::Critical,
            1 => Self::High,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A record as handed over by an acquisition source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// The record itself.
    #[serde(flatten)]
    pub record: TelemetryRecord,
    /// Requested sync priority.
    #[serde(default)]
    pub priority: Priority,
}

impl Observation {
    /// Wrap a record with normal priority.
    #[must_use]
    pub fn normal(record: TelemetryRecord) -> Self {
        Self {
            record,
            priority: Priority::Normal,
        }
    }
}
