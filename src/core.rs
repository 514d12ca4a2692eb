//! Core data model shared by every component of the calibrator.
//!
//! The types here are plain values: the wire codec produces [`Reading`]s and
//! [`DeviceInfo`]s, the statistics engine produces [`RoundStatistics`] and
//! [`StatsProgress`], and the calibration coordinator produces
//! [`CalibrationSummary`]s. They travel between components through the
//! [`EventBus`](crate::bus::EventBus) and are `Serialize` so external
//! collaborators (database, report export, GUI) can consume them as-is.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the comparison a photometer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The certified reference photometer.
    #[serde(rename = "ref")]
    Reference,
    /// The photometer being calibrated.
    Test,
}

impl Role {
    /// Fixed-width label used as a log prefix.
    pub fn label(self) -> &'static str {
        match self {
            Role::Reference => "REF.",
            Role::Test => "TEST",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reference => f.write_str("ref"),
            Role::Test => f.write_str("test"),
        }
    }
}

/// Photometer hardware model. Selects wire protocol and info/write strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Model {
    /// WiFi photometer with an embedded web server.
    #[serde(rename = "TESS-W", alias = "tess-w", alias = "tessw")]
    TessW,
    /// Portable serial photometer.
    #[serde(rename = "TESS-P", alias = "tess-p", alias = "tessp")]
    TessP,
    /// TESS Auto Scan.
    #[serde(rename = "TAS", alias = "tas")]
    Tas,
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Model::TessW => "TESS-W",
            Model::TessP => "TESS-P",
            Model::Tas => "TAS",
        })
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().replace('_', "-").as_str() {
            "TESS-W" | "TESSW" => Ok(Model::TessW),
            "TESS-P" | "TESSP" => Ok(Model::TessP),
            "TAS" => Ok(Model::Tas),
            other => Err(format!(
                "Unsupported model '{}'. Expected TESS-W|TESS-P|TAS",
                other
            )),
        }
    }
}

/// Central tendency estimator applied to a window of frequencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CentralMethod {
    /// Arithmetic mean.
    Mean,
    /// Median.
    #[default]
    Median,
    /// Most common value.
    Mode,
}

impl fmt::Display for CentralMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CentralMethod::Mean => "mean",
            CentralMethod::Median => "median",
            CentralMethod::Mode => "mode",
        })
    }
}

impl FromStr for CentralMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "mean" | "average" => Ok(CentralMethod::Mean),
            "median" => Ok(CentralMethod::Median),
            "mode" => Ok(CentralMethod::Mode),
            other => Err(format!(
                "Unsupported estimator '{}'. Expected mean|median|mode",
                other
            )),
        }
    }
}

/// How a final value was picked from the per-round lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMethod {
    /// Unique most common value.
    Mode,
    /// Median, used when there is no unique mode.
    Median,
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectionMethod::Mode => "mode",
            SelectionMethod::Median => "median",
        })
    }
}

/// One decoded photometer sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Reception time.
    pub timestamp: DateTime<Utc>,
    /// Measured frequency in Hz.
    pub frequency: f64,
    /// Box (ambient) temperature in °C.
    pub ambient_temp: Option<f64>,
    /// Sky (IR sensor) temperature in °C.
    pub sky_temp: Option<f64>,
    /// Device sequence counter, JSON protocol only.
    pub sequence: Option<u64>,
}

impl Reading {
    /// A bare reading with only a frequency.
    pub fn new(timestamp: DateTime<Utc>, frequency: f64) -> Self {
        Self {
            timestamp,
            frequency,
            ambient_temp: None,
            sky_temp: None,
            sequence: None,
        }
    }
}

/// Device metadata gathered once per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Role of the link that produced this record.
    pub role: Role,
    /// Hardware model.
    pub model: Model,
    /// Device name, e.g. `stars1234`.
    pub name: String,
    /// MAC address.
    pub mac: String,
    /// Firmware identification string.
    pub firmware: String,
    /// Zero point currently stored in the device.
    pub stored_zero_point: f64,
    /// Dark frequency offset in Hz subtracted before computing magnitudes.
    pub frequency_offset: f64,
    /// Absolute zero point of the certified reference. Reference role only.
    pub absolute_zero_point: Option<f64>,
}

/// Window fill state published while a statistics window is filling up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsProgress {
    /// Role of the engine.
    pub role: Role,
    /// Device name, `None` until device info arrives.
    pub name: Option<String>,
    /// Samples currently in the window.
    pub current: usize,
    /// Window capacity.
    pub target: usize,
    /// Timestamp of the oldest sample.
    pub window_begin: Option<DateTime<Utc>>,
    /// Timestamp of the newest sample.
    pub window_end: Option<DateTime<Utc>>,
    /// Seconds spanned by the window so far.
    pub duration: Option<f64>,
}

/// Result of one reduction cycle of a statistics window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundStatistics {
    /// Role of the engine that produced it.
    pub role: Role,
    /// Device name.
    pub name: String,
    /// Assigned by the coordinator when paired.
    pub round_index: Option<u32>,
    /// Central frequency in Hz.
    pub central_frequency: f64,
    /// Standard deviation around the central frequency.
    pub stddev: f64,
    /// Estimator used for `central_frequency`.
    pub central_method: CentralMethod,
    /// Fictitious zero point used for `magnitude`.
    pub fictitious_zp: f64,
    /// Magnitude on the fictitious scale, `+inf` for zero signal.
    pub magnitude: f64,
    /// Number of samples reduced.
    pub sample_count: usize,
    /// Timestamp of the oldest sample.
    pub window_begin: DateTime<Utc>,
    /// Timestamp of the newest sample.
    pub window_end: DateTime<Utc>,
    /// Seconds spanned by the window.
    pub duration: f64,
    /// Round zero point, test role only, set by the coordinator.
    pub zero_point: Option<f64>,
    /// Reference minus test magnitude, test role only, set by the coordinator.
    pub mag_diff: Option<f64>,
}

/// Final per-role outcome of a calibration session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSummary {
    /// Role summarised.
    pub role: Role,
    /// Session token.
    pub session: String,
    /// Calibrated zero point (test) or the stored one (reference).
    pub final_zero_point: f64,
    /// `None` for the reference, which is never chosen by reduction.
    pub zero_point_method: Option<SelectionMethod>,
    /// Best frequency over all rounds.
    pub final_frequency: f64,
    /// How `final_frequency` was chosen.
    pub frequency_method: SelectionMethod,
    /// Magnitude of `final_frequency` on the fictitious scale.
    pub magnitude: f64,
    /// Magnitude difference against the reference, 0 for the reference.
    pub magnitude_offset: f64,
    /// Zero point read from the device when the session started.
    pub previous_zero_point: f64,
    /// Number of rounds configured.
    pub rounds: u32,
    /// Person running the calibration.
    pub author: String,
    /// User offset added to the best zero point.
    pub offset: f64,
    /// Whether the new zero point is written back to the device.
    pub updated_flag: bool,
}

/// Result of writing a zero point and reading it back.
///
/// A mismatch is a value, not an error: the write went through and the
/// caller decides what to do with a device that stores something else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Read-back equals the requested value at two decimals.
    Confirmed {
        /// Value stored in the device.
        zero_point: f64,
    },
    /// Read-back differs from the requested value.
    Mismatch {
        /// Value sent.
        requested: f64,
        /// Value the device reports.
        read_back: f64,
        /// `|requested - read_back|`, rounded to two decimals.
        delta: f64,
    },
    /// The write was sent but no read-back could be obtained.
    Unverified {
        /// Value sent.
        requested: f64,
        /// Why verification failed.
        reason: String,
    },
    /// The write itself failed.
    Failed {
        /// Value that could not be sent.
        requested: f64,
        /// Error reported by the link.
        reason: String,
    },
}

impl WriteOutcome {
    /// Compares a requested zero point with the value read back.
    pub fn verify(requested: f64, read_back: f64) -> Self {
        let requested = round2(requested);
        let read_back = round2(read_back);
        if requested == read_back {
            WriteOutcome::Confirmed {
                zero_point: read_back,
            }
        } else {
            WriteOutcome::Mismatch {
                requested,
                read_back,
                delta: round2((requested - read_back).abs()),
            }
        }
    }

    /// True for [`WriteOutcome::Confirmed`].
    pub fn is_confirmed(&self) -> bool {
        matches!(self, WriteOutcome::Confirmed { .. })
    }
}

/// Rounds to two decimals, the resolution zero points are stored with.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Magnitude of `frequency` on the scale given by `zero_point`.
///
/// Non-positive net frequency (dark sky or a broken sensor) maps to `+inf`.
pub fn magnitude(zero_point: f64, frequency: f64, frequency_offset: f64) -> f64 {
    let net = frequency - frequency_offset;
    if net > 0.0 {
        zero_point - 2.5 * net.log10()
    } else {
        f64::INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_parsing_is_case_insensitive() {
        assert_eq!("tess-w".parse::<Model>().unwrap(), Model::TessW);
        assert_eq!("TESS-P".parse::<Model>().unwrap(), Model::TessP);
        assert_eq!("tas".parse::<Model>().unwrap(), Model::Tas);
        assert!("sqm".parse::<Model>().is_err());
    }

    #[test]
    fn role_serializes_with_short_names() {
        assert_eq!(serde_json::to_string(&Role::Reference).unwrap(), "\"ref\"");
        assert_eq!(serde_json::to_string(&Role::Test).unwrap(), "\"test\"");
    }

    #[test]
    fn magnitude_of_dark_signal_is_infinite() {
        assert!(magnitude(20.5, 0.0, 0.0).is_infinite());
        assert!(magnitude(20.5, 1.0, 2.0).is_infinite());
        assert!((magnitude(20.5, 10.0, 0.0) - 18.0).abs() < 1e-12);
    }

    #[test]
    fn write_verification_reports_delta() {
        assert!(WriteOutcome::verify(20.50, 20.50).is_confirmed());
        assert_eq!(
            WriteOutcome::verify(20.50, 20.49),
            WriteOutcome::Mismatch {
                requested: 20.50,
                read_back: 20.49,
                delta: 0.01,
            }
        );
    }

    #[test]
    fn round2_matches_zero_point_resolution() {
        assert_eq!(round2(20.3843), 20.38);
        assert_eq!(round2(20.386), 20.39);
    }
}
