//! Round synchronization state machine.
//!
//! The coordinator is a plain value: feed it device info and statistics and
//! it returns the events to publish. The runner in the parent module wires it
//! to the bus.

use super::summary::{self, Accumulators, DeviceZeroPoints};
use super::CalibrationSettings;
use crate::bus::Event;
use crate::core::{CalibrationSummary, DeviceInfo, Role, RoundStatistics};
use crate::error::{AppResult, ZptessError};
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

/// Statistics waiting for a counterpart, per role.
pub const MAX_PENDING: usize = 4;

/// Round-based reference/test pairing.
#[derive(Debug)]
pub struct CalibrationCoordinator {
    settings: CalibrationSettings,
    session: String,
    round: u32,
    pending_ref: VecDeque<RoundStatistics>,
    pending_test: VecDeque<RoundStatistics>,
    accumulators: Accumulators,
    zp_abs: f64,
    zp_fict: Option<f64>,
    test_zp: Option<f64>,
    summaries: Option<(CalibrationSummary, CalibrationSummary)>,
    missing_info: Option<Role>,
}

impl CalibrationCoordinator {
    /// Coordinator for a new session.
    pub fn new(settings: CalibrationSettings, session: impl Into<String>) -> Self {
        let zp_abs = settings.absolute_zero_point;
        Self {
            settings,
            session: session.into(),
            round: 1,
            pending_ref: VecDeque::new(),
            pending_test: VecDeque::new(),
            accumulators: Accumulators::default(),
            zp_abs,
            zp_fict: None,
            test_zp: None,
            summaries: None,
            missing_info: None,
        }
    }

    /// Session token.
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Round currently waiting for a pair, 1-based.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Valid rounds collected so far.
    pub fn accumulators(&self) -> &Accumulators {
        &self.accumulators
    }

    /// True once all rounds are done, whether or not the summaries could be built.
    pub fn is_finished(&self) -> bool {
        self.summaries.is_some() || self.missing_info.is_some()
    }

    /// Why a finished session has no summaries.
    pub fn failure(&self) -> Option<ZptessError> {
        self.missing_info.map(ZptessError::NoDeviceInfo)
    }

    /// Reference and test summaries, once finished.
    pub fn summaries(&self) -> Option<&(CalibrationSummary, CalibrationSummary)> {
        self.summaries.as_ref()
    }

    /// Session start event.
    pub fn begin(&self) -> Event {
        info!(
            rounds = self.settings.rounds,
            session = %self.session,
            "Starting calibration"
        );
        Event::CalibBegin {
            session: self.session.clone(),
        }
    }

    /// Records device zero points.
    ///
    /// Reference info fixes the absolute zero point (when the record carries
    /// one) and the fictitious zero point. Test info fixes the zero point
    /// reported as previous in the summary.
    pub fn on_info(&mut self, role: Role, info: &DeviceInfo) {
        match role {
            Role::Reference => {
                if let Some(zp_abs) = info.absolute_zero_point {
                    self.zp_abs = zp_abs;
                }
                self.zp_fict = Some(info.stored_zero_point);
            }
            Role::Test => self.test_zp = Some(info.stored_zero_point),
        }
    }

    /// Queues statistics and pairs them with the counterpart when possible.
    ///
    /// Returns the events to publish, in order. Statistics arriving after the
    /// last round are ignored.
    pub fn on_stats(&mut self, stats: RoundStatistics) -> AppResult<Vec<Event>> {
        let mut events = Vec::new();
        if self.is_finished() {
            return Ok(events);
        }

        let queue = match stats.role {
            Role::Reference => &mut self.pending_ref,
            Role::Test => &mut self.pending_test,
        };
        queue.push_back(stats);
        if queue.len() > MAX_PENDING {
            if let Some(dropped) = queue.pop_front() {
                warn!(role = %dropped.role, "Dropping statistics never paired");
            }
        }

        while !self.is_finished() {
            let (Some(ref_head), Some(test_head)) = (self.pending_ref.front(), self.pending_test.front())
            else {
                break;
            };
            let skew = ref_head.window_end - test_head.window_end;
            if u128::from(skew.num_milliseconds().unsigned_abs()) > self.settings.max_skew.as_millis() {
                let stale = if skew < chrono::Duration::zero() {
                    self.pending_ref.pop_front()
                } else {
                    self.pending_test.pop_front()
                };
                if let Some(stale) = stale {
                    debug!(role = %stale.role, skew_ms = skew.num_milliseconds(), "Discarding stale statistics");
                }
                continue;
            }
            if let (Some(reference), Some(test)) = (self.pending_ref.pop_front(), self.pending_test.pop_front()) {
                self.pair(reference, test, &mut events)?;
            }
        }
        Ok(events)
    }

    fn pair(
        &mut self,
        mut reference: RoundStatistics,
        mut test: RoundStatistics,
        events: &mut Vec<Event>,
    ) -> AppResult<()> {
        let round = self.round;
        reference.round_index = Some(round);
        test.round_index = Some(round);

        let ref_frozen = reference.stddev == 0.0;
        let test_frozen = test.stddev == 0.0;
        if ref_frozen || test_frozen {
            match (ref_frozen, test_frozen) {
                (true, true) => warn!("FROZEN {} and {}", reference.name, test.name),
                (true, false) => warn!("FROZEN {}", reference.name),
                _ => warn!("FROZEN {}", test.name),
            }
            return Ok(());
        }

        let mag_diff = -2.5 * (reference.central_frequency / test.central_frequency).log10();
        let zp = crate::core::round2(self.zp_abs + mag_diff);
        if !zp.is_finite() {
            warn!(
                round,
                ref_freq = reference.central_frequency,
                test_freq = test.central_frequency,
                "Magnitude difference not computable, repeating round"
            );
            return Ok(());
        }

        info!(
            "ROUND {:02}: (ref-test) \u{394} Mag = {:.2}, ZP Fict = {:.2}, ZP Abs = {:.2}, ZP = {:.2}",
            round,
            mag_diff,
            self.zp_fict.unwrap_or(reference.fictitious_zp),
            self.zp_abs,
            zp
        );
        self.accumulators
            .push(zp, reference.central_frequency, test.central_frequency);

        reference.zero_point = None;
        reference.mag_diff = None;
        test.zero_point = Some(zp);
        test.mag_diff = Some(mag_diff);
        events.push(Event::CalibRoundInfo {
            role: Role::Reference,
            round,
            stats: reference,
        });
        events.push(Event::CalibRoundInfo {
            role: Role::Test,
            round,
            stats: test,
        });

        self.round += 1;
        if self.round > self.settings.rounds {
            self.finish(events)?;
        }
        Ok(())
    }

    fn finish(&mut self, events: &mut Vec<Event>) -> AppResult<()> {
        let devices = match (self.zp_fict, self.test_zp) {
            (Some(reference), Some(test_previous)) => DeviceZeroPoints {
                reference,
                test_previous,
            },
            (reference, _) => {
                let role = if reference.is_none() {
                    Role::Reference
                } else {
                    Role::Test
                };
                error!(role = %role, "No photometer info, calibration ends without summary");
                self.missing_info = Some(role);
                events.push(Event::CalibEnd {
                    session: self.session.clone(),
                });
                return Ok(());
            }
        };
        let (reference, test) =
            summary::summarize(&self.session, &self.accumulators, devices, &self.settings)?;

        events.push(Event::CalibSummaryInfo(reference.clone()));
        events.push(Event::CalibSummaryInfo(test.clone()));
        if self.settings.update {
            events.push(Event::UpdateZeroPoint {
                role: Role::Test,
                zero_point: test.final_zero_point,
            });
        }
        events.push(Event::CalibEnd {
            session: self.session.clone(),
        });
        self.summaries = Some((reference, test));
        Ok(())
    }
}
