//! Session assembly.
//!
//! A [`Session`] wires photometer links, statistics services and the
//! calibration coordinator to one [`EventBus`] for a single run and tears
//! everything down when the run ends. Sessions are ephemeral: nothing
//! survives the process.
//!
//! ## Run modes
//!
//! - **`Calibrate`**: both links, both statistics services, the coordinator.
//!   Ends on `calib_end` (and, with `update`, on the `zero_point_written`
//!   that follows it).
//! - **`Read`**: links and statistics services for the selected roles, no
//!   coordinator. Runs until the shutdown signal.
//! - **`DryRun`**: connects to the test photometer, publishes its info, stops.
//! - **`WriteZeroPoint`**: connects to the test photometer, writes and
//!   verifies a zero point, stops.

use crate::bus::{Event, EventBus, Topic};
use crate::calibration::{CalibrationCoordinator, CalibrationService, CalibrationSettings, Summaries};
use crate::config::ZptessConfig;
use crate::core::{Role, WriteOutcome};
use crate::error::{AppResult, ZptessError};
use crate::photometer::{LinkOptions, PhotometerLink};
use crate::stats::{StatsOptions, StatsService};
use crate::transport::{Connector, EndpointConnector};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Session token format.
pub const SESSION_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Which photometers a read session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleSelection {
    /// Reference only
    Reference,
    /// Test only
    Test,
    /// Both photometers
    Both,
}

impl RoleSelection {
    /// Roles selected, reference first.
    pub fn roles(self) -> &'static [Role] {
        match self {
            RoleSelection::Reference => &[Role::Reference],
            RoleSelection::Test => &[Role::Test],
            RoleSelection::Both => &[Role::Reference, Role::Test],
        }
    }
}

/// What a session does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    /// Full calibration
    Calibrate,
    /// Display readings and statistics only
    Read(RoleSelection),
    /// Connect to the test photometer and show its info
    DryRun,
    /// Store a zero point in the test photometer
    WriteZeroPoint(f64),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// The run did what it was asked to.
    Completed {
        /// Calibration summaries, reference first
        summaries: Option<Summaries>,
        /// Result of a zero point write
        written: Option<WriteOutcome>,
    },
    /// A photometer could not be reached or gave no info.
    Offline(Role),
    /// The shutdown signal arrived before a calibration finished.
    Interrupted,
}

impl SessionOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionOutcome::Completed {
                written: Some(WriteOutcome::Failed { .. }),
                ..
            } => 1,
            SessionOutcome::Completed { .. } | SessionOutcome::Interrupted => 0,
            SessionOutcome::Offline(_) => 1,
        }
    }
}

/// Components started for a run, stopped together.
#[derive(Default)]
struct Running {
    links: Vec<PhotometerLink>,
    stats: Vec<StatsService>,
    listener: Option<JoinHandle<()>>,
    calibration: Option<CalibrationService>,
}

impl Running {
    fn link(&self, role: Role) -> AppResult<&PhotometerLink> {
        self.links
            .iter()
            .find(|link| link.role() == role)
            .ok_or(ZptessError::LinkNotStarted)
    }

    async fn shutdown(mut self) -> AppResult<Option<Summaries>> {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        let summaries = match self.calibration.take() {
            Some(service) => service.stop().await?,
            None => None,
        };
        for link in &mut self.links {
            link.stop().await;
        }
        for service in &mut self.stats {
            service.stop().await;
        }
        Ok(summaries)
    }
}

/// One calibration run.
pub struct Session {
    id: String,
    config: ZptessConfig,
    bus: EventBus,
    connector: Arc<dyn Connector>,
}

impl Session {
    /// Session talking to real devices.
    pub fn new(config: ZptessConfig) -> Self {
        Self::with_connector(config, Arc::new(EndpointConnector))
    }

    /// Session opening transports through `connector`.
    pub fn with_connector(config: ZptessConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            id: Utc::now().format(SESSION_FORMAT).to_string(),
            config,
            bus: EventBus::new(),
            connector,
        }
    }

    /// Session token.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bus shared by every component of the session.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Effective configuration.
    pub fn config(&self) -> &ZptessConfig {
        &self.config
    }

    fn link(&self, role: Role) -> AppResult<PhotometerLink> {
        let options = LinkOptions::from_config(role, &self.config)?;
        Ok(PhotometerLink::with_connector(
            options,
            self.bus.clone(),
            self.connector.clone(),
        ))
    }

    /// Runs `mode` until it completes, a photometer goes offline or
    /// `shutdown` resolves.
    pub async fn run<F>(&self, mode: RunMode, shutdown: F) -> AppResult<SessionOutcome>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(session = %self.id, mode = ?mode, "Session starting");
        let outcome = match mode {
            RunMode::Calibrate => self.calibrate(&mut shutdown).await,
            RunMode::Read(selection) => self.read(selection, &mut shutdown).await,
            RunMode::DryRun => self.dry_run(&mut shutdown).await,
            RunMode::WriteZeroPoint(zero_point) => self.write(zero_point, &mut shutdown).await,
        };
        match &outcome {
            Ok(outcome) => info!(session = %self.id, outcome = ?outcome, "Session finished"),
            Err(err) => error!(session = %self.id, error = %err, "Session failed"),
        }
        outcome
    }

    /// Starts the links for `roles` in order. Returns the first role that
    /// went offline, with every link started so far kept in `running`.
    async fn start_links<F>(
        &self,
        roles: &[Role],
        running: &mut Running,
        shutdown: &mut std::pin::Pin<&mut F>,
    ) -> AppResult<Option<Started>>
    where
        F: Future<Output = ()>,
    {
        for &role in roles {
            let mut link = self.link(role)?;
            let info = tokio::select! {
                _ = shutdown.as_mut() => {
                    running.links.push(link);
                    return Ok(Some(Started::Interrupted));
                }
                info = link.start() => info?,
            };
            running.links.push(link);
            if info.is_none() {
                return Ok(Some(Started::Offline(role)));
            }
        }
        Ok(None)
    }

    async fn calibrate<F>(&self, shutdown: &mut std::pin::Pin<&mut F>) -> AppResult<SessionOutcome>
    where
        F: Future<Output = ()>,
    {
        let update = self.config.calibration.update;
        let mut watcher = self
            .bus
            .subscribe(&[Topic::PhotometerOff, Topic::CalibEnd, Topic::ZeroPointWritten]);

        let mut running = Running::default();
        for role in [Role::Reference, Role::Test] {
            running.stats.push(StatsService::spawn(
                StatsOptions::from_config(role, &self.config, false),
                self.bus.clone(),
            ));
        }
        let coordinator =
            CalibrationCoordinator::new(CalibrationSettings::from_config(&self.config), self.id.clone());
        running.calibration = Some(CalibrationService::spawn(coordinator, self.bus.clone()));

        if let Some(started) = self
            .start_links(&[Role::Reference, Role::Test], &mut running, shutdown)
            .await?
        {
            running.shutdown().await?;
            return Ok(started.into());
        }

        if update {
            let listener = running.link(Role::Test)?.spawn_zero_point_listener()?;
            running.listener = Some(listener);
        }
        for link in &running.links {
            link.stream_readings().await?;
        }

        let ended = loop {
            let event = tokio::select! {
                _ = shutdown.as_mut() => break None,
                event = watcher.recv() => event?,
            };
            match event {
                Event::PhotometerOff { role, reason } => {
                    warn!(role = %role, reason = %reason, "Photometer went offline");
                    running.shutdown().await?;
                    return Ok(SessionOutcome::Offline(role));
                }
                Event::CalibEnd { .. } => break Some(()),
                _ => {}
            }
        };
        if ended.is_none() {
            running.shutdown().await?;
            return Ok(SessionOutcome::Interrupted);
        }

        let summaries = match running.calibration.take() {
            Some(service) => match service.join().await {
                Ok(summaries) => summaries,
                Err(err) => {
                    running.shutdown().await?;
                    return Err(err);
                }
            },
            None => None,
        };
        let written = if update && summaries.is_some() {
            self.wait_zero_point_written(&mut watcher).await
        } else {
            None
        };
        running.shutdown().await?;
        Ok(SessionOutcome::Completed { summaries, written })
    }

    async fn wait_zero_point_written(
        &self,
        watcher: &mut crate::bus::Subscription,
    ) -> Option<WriteOutcome> {
        let test = &self.config.test;
        let deadline = test.write_timeout + test.info_timeout;
        let wait = async {
            loop {
                match watcher.recv().await {
                    Ok(Event::ZeroPointWritten {
                        role: Role::Test,
                        outcome,
                    }) => return Some(outcome),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(timeout = ?deadline, "No zero point write confirmation");
                None
            }
        }
    }

    async fn read<F>(
        &self,
        selection: RoleSelection,
        shutdown: &mut std::pin::Pin<&mut F>,
    ) -> AppResult<SessionOutcome>
    where
        F: Future<Output = ()>,
    {
        let alone = selection != RoleSelection::Both;
        let mut watcher = self.bus.subscribe(&[Topic::PhotometerOff]);
        let mut running = Running::default();
        for &role in selection.roles() {
            running.stats.push(StatsService::spawn(
                StatsOptions::from_config(role, &self.config, alone),
                self.bus.clone(),
            ));
        }

        if let Some(started) = self
            .start_links(selection.roles(), &mut running, shutdown)
            .await?
        {
            running.shutdown().await?;
            return Ok(match started {
                Started::Interrupted => SessionOutcome::Completed {
                    summaries: None,
                    written: None,
                },
                Started::Offline(role) => SessionOutcome::Offline(role),
            });
        }
        for link in &running.links {
            link.stream_readings().await?;
        }

        let outcome = tokio::select! {
            _ = shutdown.as_mut() => SessionOutcome::Completed { summaries: None, written: None },
            event = watcher.recv() => match event? {
                Event::PhotometerOff { role, .. } => SessionOutcome::Offline(role),
                _ => SessionOutcome::Interrupted,
            },
        };
        running.shutdown().await?;
        Ok(outcome)
    }

    async fn dry_run<F>(&self, shutdown: &mut std::pin::Pin<&mut F>) -> AppResult<SessionOutcome>
    where
        F: Future<Output = ()>,
    {
        let mut running = Running::default();
        let started = self.start_links(&[Role::Test], &mut running, shutdown).await?;
        running.shutdown().await?;
        Ok(match started {
            Some(started) => started.into(),
            None => SessionOutcome::Completed {
                summaries: None,
                written: None,
            },
        })
    }

    async fn write<F>(
        &self,
        zero_point: f64,
        shutdown: &mut std::pin::Pin<&mut F>,
    ) -> AppResult<SessionOutcome>
    where
        F: Future<Output = ()>,
    {
        let mut running = Running::default();
        if let Some(started) = self.start_links(&[Role::Test], &mut running, shutdown).await? {
            running.shutdown().await?;
            return Ok(started.into());
        }

        let outcome = match running.link(Role::Test)?.write_zero_point(zero_point).await {
            Ok(outcome) => outcome,
            Err(err) => WriteOutcome::Failed {
                requested: zero_point,
                reason: err.to_string(),
            },
        };
        self.bus.publish(Event::ZeroPointWritten {
            role: Role::Test,
            outcome: outcome.clone(),
        });
        running.shutdown().await?;
        Ok(SessionOutcome::Completed {
            summaries: None,
            written: Some(outcome),
        })
    }
}

enum Started {
    Offline(Role),
    Interrupted,
}

impl From<Started> for SessionOutcome {
    fn from(value: Started) -> Self {
        match value {
            Started::Offline(role) => SessionOutcome::Offline(role),
            Started::Interrupted => SessionOutcome::Interrupted,
        }
    }
}
