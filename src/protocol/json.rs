//! JSON-lines readings.
//!
//! Each record is an object with at least `freq`. The sequence counter is
//! `seq` on TAS/TESS-P and `udp` on TESS-W.

use crate::core::Reading;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct WireReading {
    freq: f64,
    #[serde(default, alias = "udp")]
    seq: Option<u64>,
    #[serde(default)]
    tamb: Option<f64>,
    #[serde(default)]
    tsky: Option<f64>,
}

/// Parses one record. Malformed JSON, non-objects and records without a
/// numeric `freq` yield `None`.
pub fn parse(line: &str, now: DateTime<Utc>) -> Option<Reading> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if !value.is_object() {
        return None;
    }
    let wire: WireReading = serde_json::from_value(value).ok()?;
    if !wire.freq.is_finite() {
        return None;
    }
    Some(Reading {
        timestamp: now,
        frequency: wire.freq,
        ambient_temp: wire.tamb,
        sky_temp: wire.tsky,
        sequence: wire.seq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_record() {
        let r = parse(
            r#"{"seq":42,"freq":10.52,"tamb":21.5,"tsky":-3.25,"mag":18.3}"#,
            Utc::now(),
        )
        .unwrap();
        assert_eq!(r.sequence, Some(42));
        assert_eq!(r.frequency, 10.52);
        assert_eq!(r.ambient_temp, Some(21.5));
        assert_eq!(r.sky_temp, Some(-3.25));
    }

    #[test]
    fn accepts_udp_as_sequence_key() {
        let r = parse(r#"{"udp":7,"freq":3.0}"#, Utc::now()).unwrap();
        assert_eq!(r.sequence, Some(7));
    }

    #[test]
    fn discards_malformed_records() {
        assert!(parse(r#"{"freq":"#, Utc::now()).is_none());
        assert!(parse(r#"{"seq":1}"#, Utc::now()).is_none());
        assert!(parse("[1,2,3]", Utc::now()).is_none());
        assert!(parse("[10.5]", Utc::now()).is_none());
        assert!(parse("10.5", Utc::now()).is_none());
        assert!(parse(r#"{"freq":"fast"}"#, Utc::now()).is_none());
    }
}
