//! Calibration Coordinator
//!
//! Pairs reference and test statistics round by round, computes a zero point
//! per valid round and reduces the rounds to one summary per role.
//!
//! [`CalibrationCoordinator`] holds the state machine and never touches the
//! bus; [`CalibrationService`] runs it as a task that consumes
//! `photometer_info` and `stats_info` and publishes what the coordinator
//! returns.

pub mod coordinator;
pub mod summary;

use crate::bus::{Event, EventBus, Subscription, Topic};
use crate::config::{ZptessConfig, REF_ZP_ABS};
use crate::core::CalibrationSummary;
use crate::error::{AppResult, ZptessError};
pub use coordinator::CalibrationCoordinator;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Session parameters used by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    /// Valid rounds required
    pub rounds: u32,
    /// Added to the best zero point
    pub offset: f64,
    /// Recorded in the summaries
    pub author: String,
    /// Ask the test link to store the final zero point
    pub update: bool,
    /// Used when the reference info carries no absolute zero point
    pub absolute_zero_point: f64,
    /// Largest window end skew accepted when pairing
    pub max_skew: Duration,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            rounds: 5,
            offset: 0.0,
            author: String::new(),
            update: false,
            absolute_zero_point: REF_ZP_ABS,
            max_skew: Duration::from_secs(10),
        }
    }
}

impl CalibrationSettings {
    /// Settings from the loaded configuration.
    pub fn from_config(config: &ZptessConfig) -> Self {
        Self {
            rounds: config.calibration.rounds,
            offset: config.calibration.offset,
            author: config.calibration.author.clone(),
            update: config.calibration.update,
            absolute_zero_point: config.calibration.absolute_zero_point,
            max_skew: config.max_skew(),
        }
    }
}

/// Summaries produced by a finished session, reference first.
pub type Summaries = (CalibrationSummary, CalibrationSummary);

/// Handle to the running coordinator task.
pub struct CalibrationService {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<AppResult<Option<Summaries>>>,
}

impl CalibrationService {
    /// Subscribes, then spawns the coordinator task. `calib_begin` is
    /// published by the task before it consumes anything.
    pub fn spawn(coordinator: CalibrationCoordinator, bus: EventBus) -> Self {
        let sub = bus.subscribe(&[Topic::PhotometerInfo, Topic::StatsInfo]);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let span = info_span!("calibration", session = %coordinator.session());
        let task = tokio::spawn(run(coordinator, bus, sub, shutdown_rx).instrument(span));
        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Waits for the coordinator to finish on its own.
    ///
    /// `Ok(None)` when it was stopped before all rounds were done.
    pub async fn join(self) -> AppResult<Option<Summaries>> {
        let mut this = self;
        let _keep_running = this.shutdown_tx.take();
        (&mut this.task)
            .await
            .map_err(|err| ZptessError::Transport(format!("Calibration task failed: {}", err)))?
    }

    /// Stops the coordinator and returns what it produced.
    pub async fn stop(mut self) -> AppResult<Option<Summaries>> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        (&mut self.task)
            .await
            .map_err(|err| ZptessError::Transport(format!("Calibration task failed: {}", err)))?
    }
}

impl Drop for CalibrationService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn run(
    mut coordinator: CalibrationCoordinator,
    bus: EventBus,
    mut sub: Subscription,
    mut shutdown: oneshot::Receiver<()>,
) -> AppResult<Option<Summaries>> {
    bus.publish(coordinator.begin());

    loop {
        let event = tokio::select! {
            _ = &mut shutdown => {
                info!(round = coordinator.round(), "Calibration stopped");
                return Ok(None);
            }
            event = sub.recv() => event?,
        };

        match event {
            Event::PhotometerInfo { role, info } => coordinator.on_info(role, &info),
            Event::StatsInfo(stats) => match coordinator.on_stats(stats) {
                Ok(events) => {
                    for event in events {
                        bus.publish(event);
                    }
                }
                Err(err) => {
                    error!(error = %err, "Could not summarize calibration");
                    bus.publish(Event::CalibEnd {
                        session: coordinator.session().to_string(),
                    });
                    return Err(err);
                }
            },
            other => warn!(topic = ?other.topic(), "Unexpected event"),
        }

        if let Some(summaries) = coordinator.summaries() {
            info!("Calibration finished");
            return Ok(Some(summaries.clone()));
        }
        if let Some(err) = coordinator.failure() {
            return Err(err);
        }
    }
}
