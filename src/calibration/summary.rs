//! Reduction of the accumulated rounds to the final per-role summaries.

use super::CalibrationSettings;
use crate::core::{self, round2, CalibrationSummary, Role};
use crate::error::{AppResult, ZptessError};
use crate::stats::estimators::mode_or_median;
use tracing::info;

/// Per-round values collected from valid (non-frozen) rounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulators {
    /// Round zero points
    pub zero_points: Vec<f64>,
    /// Reference central frequencies
    pub ref_frequencies: Vec<f64>,
    /// Test central frequencies
    pub test_frequencies: Vec<f64>,
}

impl Accumulators {
    /// Records one valid round.
    pub fn push(&mut self, zero_point: f64, ref_frequency: f64, test_frequency: f64) {
        self.zero_points.push(zero_point);
        self.ref_frequencies.push(ref_frequency);
        self.test_frequencies.push(test_frequency);
    }

    /// Rounds recorded.
    pub fn len(&self) -> usize {
        self.zero_points.len()
    }

    /// True before the first valid round.
    pub fn is_empty(&self) -> bool {
        self.zero_points.is_empty()
    }
}

/// Zero points known from device info when the session ends.
#[derive(Debug, Clone, Copy)]
pub struct DeviceZeroPoints {
    /// Reference stored zero point, also the fictitious zero point
    pub reference: f64,
    /// Test zero point read at the start of the session
    pub test_previous: f64,
}

/// Builds the reference and test summaries, in that order.
pub fn summarize(
    session: &str,
    accumulators: &Accumulators,
    devices: DeviceZeroPoints,
    settings: &CalibrationSettings,
) -> AppResult<(CalibrationSummary, CalibrationSummary)> {
    let degenerate = || ZptessError::StatisticsDegenerate("no valid rounds to summarize".into());
    let (best_zp, zp_method) = mode_or_median(&accumulators.zero_points).ok_or_else(degenerate)?;
    let (ref_freq, ref_method) =
        mode_or_median(&accumulators.ref_frequencies).ok_or_else(degenerate)?;
    let (test_freq, test_method) =
        mode_or_median(&accumulators.test_frequencies).ok_or_else(degenerate)?;

    let zp_fict = devices.reference;
    let final_zp = round2(best_zp + settings.offset);
    let ref_mag = core::magnitude(zp_fict, ref_freq, 0.0);
    let test_mag = core::magnitude(zp_fict, test_freq, 0.0);
    let mag_offset = -2.5 * (ref_freq / test_freq).log10();

    info!("{}", "#".repeat(72));
    info!("Session = {}", session);
    info!("Best ZP        list is {:?}", accumulators.zero_points);
    info!("Best {} Freq list is {:?}", Role::Reference.label(), accumulators.ref_frequencies);
    info!("Best {} Freq list is {:?}", Role::Test.label(), accumulators.test_frequencies);
    info!(
        "Final ZP ({:.2}) = Best ZP ({:.2}, {}) + offset ({:.2})",
        final_zp, best_zp, zp_method, settings.offset
    );
    info!(
        "{} Freq. = {:.3} Hz, {} Freq. = {:.3} Hz, {} Mag. = {:.2}, {} Mag. = {:.2}, Diff {:.2}",
        Role::Reference.label(),
        ref_freq,
        Role::Test.label(),
        test_freq,
        Role::Reference.label(),
        ref_mag,
        Role::Test.label(),
        test_mag,
        mag_offset
    );
    info!(
        "OLD {} ZP = {:.2}, NEW {} ZP = {:.2}",
        Role::Test.label(),
        devices.test_previous,
        Role::Test.label(),
        final_zp
    );
    info!("{}", "#".repeat(72));

    let reference = CalibrationSummary {
        role: Role::Reference,
        session: session.to_string(),
        final_zero_point: devices.reference,
        zero_point_method: None,
        final_frequency: ref_freq,
        frequency_method: ref_method,
        magnitude: ref_mag,
        magnitude_offset: 0.0,
        previous_zero_point: devices.reference,
        rounds: settings.rounds,
        author: settings.author.clone(),
        offset: 0.0,
        updated_flag: false,
    };
    let test = CalibrationSummary {
        role: Role::Test,
        session: session.to_string(),
        final_zero_point: final_zp,
        zero_point_method: Some(zp_method),
        final_frequency: test_freq,
        frequency_method: test_method,
        magnitude: test_mag,
        magnitude_offset: mag_offset,
        previous_zero_point: devices.test_previous,
        rounds: settings.rounds,
        author: settings.author.clone(),
        offset: settings.offset,
        updated_flag: settings.update,
    };
    Ok((reference, test))
}
