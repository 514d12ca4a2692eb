//! Per-role statistics state: the sample window and the values bound from
//! device info.

use super::estimators;
use super::window::SlidingWindow;
use crate::core::{self, CentralMethod, DeviceInfo, Reading, Role, RoundStatistics, StatsProgress};
use crate::error::{AppResult, ZptessError};
use chrono::{DateTime, Utc};
use tracing::debug;

/// Placeholder used in logs before device info arrives.
pub const UNKNOWN_NAME: &str = "?????";

/// Window plus reduction parameters for one role.
#[derive(Debug)]
pub struct StatisticsEngine {
    role: Role,
    alone: bool,
    window: SlidingWindow<Reading>,
    central: CentralMethod,
    name: Option<String>,
    frequency_offset: f64,
    fictitious_zp: Option<f64>,
}

impl StatisticsEngine {
    /// Engine for `role` holding up to `samples` readings.
    ///
    /// An engine running `alone` (no counterpart photometer) takes its
    /// fictitious zero point from its own device instead of the reference.
    pub fn new(role: Role, samples: usize, central: CentralMethod, alone: bool) -> Self {
        Self {
            role,
            alone,
            window: SlidingWindow::new(samples),
            central,
            name: None,
            frequency_offset: 0.0,
            fictitious_zp: None,
        }
    }

    /// Role served.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Device name, once known.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name for log lines.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_NAME)
    }

    /// Zero point magnitudes are reported with.
    pub fn fictitious_zp(&self) -> Option<f64> {
        self.fictitious_zp
    }

    /// Pushes a reading of this engine's role. Other roles are ignored.
    pub fn on_reading(&mut self, role: Role, reading: Reading) {
        if role == self.role {
            self.window.push(reading);
        }
    }

    /// Binds device metadata.
    ///
    /// Own-role info sets the name and the frequency offset. Reference info
    /// sets the fictitious zero point for both roles so their magnitudes share
    /// one scale.
    pub fn on_info(&mut self, role: Role, info: &DeviceInfo) {
        if role == self.role {
            self.name = Some(info.name.clone());
            self.frequency_offset = info.frequency_offset;
            if self.alone {
                self.fictitious_zp = Some(info.stored_zero_point);
            }
        }
        if !self.alone && role == Role::Reference {
            self.fictitious_zp = Some(info.stored_zero_point);
        }
    }

    /// True once the window holds its full capacity.
    pub fn is_full(&self) -> bool {
        self.window.is_full()
    }

    /// Readings currently held.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// True when no reading has arrived yet.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Window fill state.
    pub fn progress(&self) -> StatsProgress {
        let (begin, end) = self.bounds();
        StatsProgress {
            role: self.role,
            name: self.name.clone(),
            current: self.window.len(),
            target: self.window.capacity(),
            window_begin: begin,
            window_end: end,
            duration: begin.zip(end).map(|(b, e)| seconds_between(b, e)),
        }
    }

    /// Reduces the current window.
    ///
    /// Fails with [`ZptessError::StatisticsDegenerate`] when the window is
    /// too small or no fictitious zero point is bound yet.
    pub fn reduce(&self) -> AppResult<RoundStatistics> {
        let fictitious_zp = self.fictitious_zp.ok_or_else(|| {
            ZptessError::StatisticsDegenerate(format!("no zero point bound for {}", self.role))
        })?;
        let (Some(begin), Some(end)) = self.bounds() else {
            return Err(ZptessError::StatisticsDegenerate("empty window".to_string()));
        };

        let frequencies: Vec<f64> = self.window.iter().map(|r| r.frequency).collect();
        debug!(role = %self.role, ring = ?frequencies, "Reducing window");

        let central = estimators::central(self.central, &frequencies)
            .ok_or_else(|| ZptessError::StatisticsDegenerate("empty window".to_string()))?;
        let stddev = estimators::stdev_about(&frequencies, central).ok_or_else(|| {
            ZptessError::StatisticsDegenerate(format!(
                "{} samples are not enough for a deviation",
                frequencies.len()
            ))
        })?;

        Ok(RoundStatistics {
            role: self.role,
            name: self.display_name().to_string(),
            round_index: None,
            central_frequency: central,
            stddev,
            central_method: self.central,
            fictitious_zp,
            magnitude: core::magnitude(fictitious_zp, central, self.frequency_offset),
            sample_count: frequencies.len(),
            window_begin: begin,
            window_end: end,
            duration: seconds_between(begin, end),
            zero_point: None,
            mag_diff: None,
        })
    }

    fn bounds(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (
            self.window.oldest().map(|r| r.timestamp),
            self.window.newest().map(|r| r.timestamp),
        )
    }
}

fn seconds_between(begin: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - begin).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Model;
    use chrono::{Duration, TimeZone};

    fn info(role: Role, name: &str, zp: f64, offset: f64) -> DeviceInfo {
        DeviceInfo {
            role,
            model: Model::TessW,
            name: name.to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            firmware: "1.0".to_string(),
            stored_zero_point: zp,
            frequency_offset: offset,
            absolute_zero_point: None,
        }
    }

    fn feed(engine: &mut StatisticsEngine, role: Role, freqs: &[f64]) {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (i, &f) in freqs.iter().enumerate() {
            engine.on_reading(role, Reading::new(t0 + Duration::seconds(i as i64), f));
        }
    }

    #[test]
    fn test_engine_uses_reference_zero_point() {
        let mut engine = StatisticsEngine::new(Role::Test, 3, CentralMethod::Median, false);
        engine.on_info(Role::Test, &info(Role::Test, "stars100", 20.10, 0.0));
        assert_eq!(engine.fictitious_zp(), None);
        engine.on_info(Role::Reference, &info(Role::Reference, "stars3", 20.50, 0.5));

        assert_eq!(engine.name(), Some("stars100"));
        assert_eq!(engine.fictitious_zp(), Some(20.50));

        feed(&mut engine, Role::Test, &[10.0, 10.0, 10.0, 11.0]);
        let stats = engine.reduce().unwrap();
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.central_frequency, 10.0);
        assert!((stats.magnitude - 18.0).abs() < 1e-12);
        assert_eq!(stats.duration, 2.0);
        assert_eq!(stats.name, "stars100");
        assert_eq!(stats.round_index, None);
        assert_eq!(stats.zero_point, None);
        assert_eq!(stats.mag_diff, None);
    }

    #[test]
    fn lone_engine_uses_its_own_zero_point() {
        let mut engine = StatisticsEngine::new(Role::Test, 2, CentralMethod::Mean, true);
        engine.on_info(Role::Reference, &info(Role::Reference, "stars3", 20.50, 0.0));
        assert_eq!(engine.fictitious_zp(), None);
        engine.on_info(Role::Test, &info(Role::Test, "stars100", 20.10, 0.0));
        assert_eq!(engine.fictitious_zp(), Some(20.10));
    }

    #[test]
    fn readings_of_other_role_are_ignored() {
        let mut engine = StatisticsEngine::new(Role::Reference, 5, CentralMethod::Median, false);
        feed(&mut engine, Role::Test, &[1.0, 2.0]);
        assert!(engine.is_empty());
        feed(&mut engine, Role::Reference, &[1.0, 2.0]);
        let progress = engine.progress();
        assert_eq!(progress.current, 2);
        assert_eq!(progress.target, 5);
        assert_eq!(progress.duration, Some(1.0));
        assert_eq!(progress.name, None);
    }

    #[test]
    fn degenerate_windows_are_errors() {
        let mut engine = StatisticsEngine::new(Role::Reference, 5, CentralMethod::Median, false);
        assert!(matches!(
            engine.reduce(),
            Err(ZptessError::StatisticsDegenerate(_))
        ));
        engine.on_info(Role::Reference, &info(Role::Reference, "stars3", 20.44, 0.0));
        assert!(matches!(
            engine.reduce(),
            Err(ZptessError::StatisticsDegenerate(_))
        ));
        feed(&mut engine, Role::Reference, &[5.0]);
        assert!(matches!(
            engine.reduce(),
            Err(ZptessError::StatisticsDegenerate(_))
        ));
    }

    #[test]
    fn zero_net_signal_gives_infinite_magnitude() {
        let mut engine = StatisticsEngine::new(Role::Reference, 2, CentralMethod::Median, false);
        engine.on_info(Role::Reference, &info(Role::Reference, "stars3", 20.44, 5.0));
        feed(&mut engine, Role::Reference, &[5.0, 5.0]);
        let stats = engine.reduce().unwrap();
        assert!(stats.magnitude.is_infinite());
        assert_eq!(stats.stddev, 0.0);
    }
}
