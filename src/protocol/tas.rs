//! Solicited key/value protocol of serial photometers (TAS, TESS-P).
//!
//! An info request is answered with one field per line, in any order and
//! interleaved with unsolicited readings:
//!
//! ```text
//! name: stars900
//! mac: 5C:CF:7F:76:6A:9F
//! firmware: Feb 12 2020
//! zp: 20.45
//! ```
//!
//! The block is complete once all four fields have been seen. A zero point
//! write is acknowledged by the same `zp:` field.

use super::RawInfo;
use once_cell::sync::Lazy;
use regex::Regex;

/// Line that asks the device for its info block.
pub const INFO_REQUEST: &str = "?\n";

static FIELD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(name|mac|firmware|zp)\s*[:=]\s*(.+?)\s*$")
        .expect("Invalid solicited field regex")
});

/// Line that stores a new zero point.
pub fn write_zero_point_request(zero_point: f64) -> String {
    format!("zp {:.2}\n", zero_point)
}

/// Result of feeding one line to a [`SolicitedCollector`].
#[derive(Debug, Clone, PartialEq)]
pub enum Feed {
    /// Field stored, block still incomplete.
    Stored,
    /// All four fields seen.
    Complete(RawInfo),
    /// Not a solicited field.
    NotSolicited,
}

/// Accumulates solicited fields across lines.
#[derive(Debug, Clone, Default)]
pub struct SolicitedCollector {
    name: Option<String>,
    mac: Option<String>,
    firmware: Option<String>,
    zero_point: Option<f64>,
}

impl SolicitedCollector {
    /// Offers a line to the collector.
    pub fn feed(&mut self, line: &str) -> Feed {
        let Some(caps) = FIELD.captures(line) else {
            return Feed::NotSolicited;
        };
        let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) else {
            return Feed::NotSolicited;
        };
        let value = value.as_str().to_string();

        match key.as_str().to_ascii_lowercase().as_str() {
            "name" => self.name = Some(value),
            "mac" => self.mac = Some(value),
            "firmware" => self.firmware = Some(value),
            "zp" => match value.parse::<f64>() {
                Ok(zp) if zp.is_finite() => self.zero_point = Some(zp),
                _ => return Feed::NotSolicited,
            },
            _ => return Feed::NotSolicited,
        }

        match (&self.name, &self.mac, &self.firmware, self.zero_point) {
            (Some(name), Some(mac), Some(firmware), Some(zero_point)) => {
                let info = RawInfo {
                    name: name.clone(),
                    mac: mac.clone(),
                    firmware: firmware.clone(),
                    zero_point,
                };
                self.reset();
                Feed::Complete(info)
            }
            _ => Feed::Stored,
        }
    }

    /// Drops any partial block.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completes_after_four_fields_in_any_order() {
        let mut c = SolicitedCollector::default();
        assert_eq!(c.feed("ZP = 20.31"), Feed::Stored);
        assert_eq!(c.feed("Firmware: Feb 12 2020"), Feed::Stored);
        assert_eq!(c.feed("mac: 5C:CF:7F:76:6A:9F"), Feed::Stored);
        match c.feed("name: stars900") {
            Feed::Complete(info) => {
                assert_eq!(info.name, "stars900");
                assert_eq!(info.mac, "5C:CF:7F:76:6A:9F");
                assert_eq!(info.firmware, "Feb 12 2020");
                assert_eq!(info.zero_point, 20.31);
            }
            other => panic!("unexpected {:?}", other),
        }
        // A completed block starts over.
        assert_eq!(c.feed("name: stars900"), Feed::Stored);
    }

    #[test]
    fn ignores_readings_and_bad_zero_points() {
        let mut c = SolicitedCollector::default();
        assert_eq!(c.feed(r#"{"seq":1,"freq":3.5}"#), Feed::NotSolicited);
        assert_eq!(c.feed("zp: twenty"), Feed::NotSolicited);
    }

    #[test]
    fn write_request_uses_two_decimals() {
        assert_eq!(write_zero_point_request(20.5), "zp 20.50\n");
    }
}
