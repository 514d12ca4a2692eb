//! Statistics Engine
//!
//! One service per role turns `phot_sample` events into `stats_info`
//! events. While its window is filling it publishes `stats_progress` every
//! `progress_period`; once the window is full it reduces it every `period`,
//! starting immediately. The reduction cadence is independent of calibration
//! rounds.

pub mod engine;
pub mod estimators;
pub mod window;

use crate::bus::{Event, EventBus, Subscription, Topic};
use crate::config::ZptessConfig;
use crate::core::{CentralMethod, Role};
use crate::error::{AppResult, ZptessError};
pub use engine::StatisticsEngine;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

/// Parameters of one statistics service.
#[derive(Debug, Clone)]
pub struct StatsOptions {
    /// Role served
    pub role: Role,
    /// Window capacity
    pub samples: usize,
    /// Central estimator
    pub central: CentralMethod,
    /// Reduction period once the window is full
    pub period: Duration,
    /// Progress period while the window fills
    pub progress_period: Duration,
    /// No counterpart photometer: use the own device zero point
    pub alone: bool,
}

impl StatsOptions {
    /// Options for `role` from the loaded configuration.
    pub fn from_config(role: Role, config: &ZptessConfig, alone: bool) -> Self {
        Self {
            role,
            samples: config.stats.samples,
            central: config.stats.central,
            period: config.stats.period,
            progress_period: config.stats.progress_period,
            alone,
        }
    }
}

enum Wake {
    Shutdown,
    Event(AppResult<Event>),
    Progress,
    Reduce,
}

/// Handle to a running statistics service.
pub struct StatsService {
    role: Role,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl StatsService {
    /// Subscribes to samples and device info, then spawns the service task.
    ///
    /// The subscription exists before this returns, so info published right
    /// after spawning is never missed.
    pub fn spawn(options: StatsOptions, bus: EventBus) -> Self {
        let sub = bus.subscribe(&[Topic::PhotSample, Topic::PhotometerInfo]);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let role = options.role;
        let span = info_span!("stats", role = %role);
        let task = tokio::spawn(run(options, bus, sub, shutdown_rx).instrument(span));
        Self {
            role,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Role served.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Stops the service and waits for it to finish. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(role = %self.role, error = %err, "Statistics task failed");
            }
        }
    }
}

impl Drop for StatsService {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn run(
    options: StatsOptions,
    bus: EventBus,
    mut sub: Subscription,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut engine = StatisticsEngine::new(
        options.role,
        options.samples,
        options.central,
        options.alone,
    );
    let label = options.role.label();
    info!(
        "[{}] {:8} Starting statistics service (T = {:?})",
        label,
        engine.display_name(),
        options.period
    );

    let mut progress = time::interval_at(
        Instant::now() + options.progress_period,
        options.progress_period,
    );
    progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reduction = time::interval(options.period);
    let mut reducing = false;

    loop {
        let wake = tokio::select! {
            _ = &mut shutdown => Wake::Shutdown,
            event = sub.recv() => Wake::Event(event),
            _ = progress.tick(), if !reducing => Wake::Progress,
            _ = reduction.tick(), if reducing => Wake::Reduce,
        };

        match wake {
            Wake::Shutdown => break,
            Wake::Event(Err(ZptessError::BusClosed)) => {
                debug!("Event bus closed");
                break;
            }
            Wake::Event(Err(err)) => {
                warn!(error = %err, "Event bus error");
            }
            Wake::Event(Ok(Event::PhotSample { role, reading })) => {
                engine.on_reading(role, reading);
            }
            Wake::Event(Ok(Event::PhotometerInfo { role, info })) => {
                engine.on_info(role, &info);
            }
            Wake::Event(Ok(_)) => {}
            Wake::Progress => {
                if engine.is_full() {
                    info!(
                        "[{}] {:8} Window full, starting statistics task",
                        label,
                        engine.display_name()
                    );
                    reducing = true;
                    reduction = time::interval(options.period);
                    reduction.set_missed_tick_behavior(MissedTickBehavior::Delay);
                } else {
                    let progress = engine.progress();
                    debug!(
                        current = progress.current,
                        target = progress.target,
                        "Window filling"
                    );
                    bus.publish(Event::StatsProgress(progress));
                }
            }
            Wake::Reduce => match engine.reduce() {
                Ok(stats) => {
                    info!(
                        "[{}] {:8} ({}-{})[{:.1}s] {} f = {:.3} Hz, \u{3c3} = {:.3} Hz, m = {:.2} @ {:.2}",
                        label,
                        stats.name,
                        stats.window_begin.format("%H:%M:%S"),
                        stats.window_end.format("%H:%M:%S"),
                        stats.duration,
                        stats.central_method,
                        stats.central_frequency,
                        stats.stddev,
                        stats.magnitude,
                        stats.fictitious_zp,
                    );
                    bus.publish(Event::StatsInfo(stats));
                }
                Err(err) => debug!(error = %err, "Skipping reduction"),
            },
        }
    }

    info!("[{}] {:8} Stopping statistics service", label, engine.display_name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DeviceInfo, Model, Reading};
    use chrono::Utc;

    fn options(role: Role) -> StatsOptions {
        StatsOptions {
            role,
            samples: 3,
            central: CentralMethod::Median,
            period: Duration::from_secs(5),
            progress_period: Duration::from_millis(1500),
            alone: false,
        }
    }

    fn reference_info() -> DeviceInfo {
        DeviceInfo {
            role: Role::Reference,
            model: Model::TessW,
            name: "stars3".into(),
            mac: "18:FE:34:CF:E9:A3".into(),
            firmware: String::new(),
            stored_zero_point: 20.44,
            frequency_offset: 0.0,
            absolute_zero_point: Some(20.44),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn progress_then_statistics() {
        let bus = EventBus::new();
        let mut out = bus.subscribe(&[Topic::StatsProgress, Topic::StatsInfo]);
        let mut service = StatsService::spawn(options(Role::Reference), bus.clone());

        bus.publish(Event::PhotometerInfo {
            role: Role::Reference,
            info: reference_info(),
        });
        bus.publish(Event::PhotSample {
            role: Role::Reference,
            reading: Reading::new(Utc::now(), 10.0),
        });

        match out.recv().await.unwrap() {
            Event::StatsProgress(progress) => {
                assert_eq!(progress.current, 1);
                assert_eq!(progress.target, 3);
                assert_eq!(progress.name.as_deref(), Some("stars3"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        for f in [10.0, 11.0] {
            bus.publish(Event::PhotSample {
                role: Role::Reference,
                reading: Reading::new(Utc::now(), f),
            });
        }

        let stats = loop {
            match out.recv().await.unwrap() {
                Event::StatsInfo(stats) => break stats,
                Event::StatsProgress(_) => continue,
                other => panic!("unexpected event {:?}", other),
            }
        };
        assert_eq!(stats.role, Role::Reference);
        assert_eq!(stats.central_frequency, 10.0);
        assert_eq!(stats.sample_count, 3);
        assert_eq!(stats.fictitious_zp, 20.44);

        service.stop().await;
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn without_zero_point_nothing_is_emitted() {
        let bus = EventBus::new();
        let mut out = bus.subscribe(&[Topic::StatsInfo]);
        let mut service = StatsService::spawn(options(Role::Test), bus.clone());

        for f in [10.0, 10.0, 10.0] {
            bus.publish(Event::PhotSample {
                role: Role::Test,
                reading: Reading::new(Utc::now(), f),
            });
        }
        time::sleep(Duration::from_secs(30)).await;
        assert!(out.try_recv().unwrap().is_none());
        service.stop().await;
    }
}
