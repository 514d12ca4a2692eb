//! Legacy fixed-field protocol.
//!
//! ```text
//! <fH 04606><tA +2987><tO +2481><mZ -0000>
//! ```
//! `fH` carries Hz, `fm` carries mHz. Temperatures and the zero point are
//! signed integers scaled by 100.

use crate::core::Reading;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

static HZ_READING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^<fH([ +]\d{5})><tA ([+-]\d{4})><tO ([+-]\d{4})><mZ ([+-]\d{4})>")
        .expect("Invalid Hz reading regex")
});

static MHZ_READING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^<fm([ +]\d{5})><tA ([+-]\d{4})><tO ([+-]\d{4})><mZ ([+-]\d{4})>")
        .expect("Invalid mHz reading regex")
});

/// Parses one line. `None` when it matches neither variant.
pub fn parse(line: &str, now: DateTime<Utc>) -> Option<Reading> {
    let (caps, divisor) = if let Some(caps) = HZ_READING.captures(line) {
        (caps, 1.0)
    } else if let Some(caps) = MHZ_READING.captures(line) {
        (caps, 1000.0)
    } else {
        return None;
    };

    let field = |i: usize| -> Option<f64> { caps.get(i)?.as_str().trim().parse::<f64>().ok() };

    let frequency = field(1)? / divisor;
    let ambient = field(2)? / 100.0;
    let sky = field(3)? / 100.0;

    Some(Reading {
        timestamp: now,
        frequency,
        ambient_temp: Some(ambient),
        sky_temp: Some(sky),
        sequence: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hz_reading() {
        let r = parse("<fH 04606><tA +2987><tO +2481><mZ -0000>", Utc::now()).unwrap();
        assert_eq!(r.frequency, 4606.0);
        assert_eq!(r.ambient_temp, Some(29.87));
        assert_eq!(r.sky_temp, Some(24.81));
        assert_eq!(r.sequence, None);
    }

    #[test]
    fn parses_millihertz_reading() {
        let r = parse("<fm+04606><tA -0150><tO -2000><mZ +2050>", Utc::now()).unwrap();
        assert!((r.frequency - 4.606).abs() < 1e-12);
        assert_eq!(r.ambient_temp, Some(-1.5));
        assert_eq!(r.sky_temp, Some(-20.0));
    }

    #[test]
    fn rejects_other_lines() {
        assert!(parse("garbage", Utc::now()).is_none());
        assert!(parse("<fH 0460><tA +2987><tO +2481><mZ -0000>", Utc::now()).is_none());
        assert!(parse(r#"{"freq": 10}"#, Utc::now()).is_none());
    }
}
