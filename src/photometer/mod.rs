//! Photometer Link
//!
//! One [`PhotometerLink`] per role owns one transport to one device. It walks
//! the lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected → Streaming
//!       ▲             │
//!       └─────────────┘ (failure; TCP links reconnect with backoff)
//! ```
//!
//! and turns the device's records into bus events:
//!
//! - [`start`](PhotometerLink::start) connects, asks for device info and
//!   publishes `photometer_info`, or `photometer_off` when the device cannot
//!   be reached or does not answer.
//! - [`stream_readings`](PhotometerLink::stream_readings) starts publishing
//!   deduplicated `phot_sample` events.
//! - [`write_zero_point`](PhotometerLink::write_zero_point) stores a zero
//!   point and verifies it.
//! - [`stop`](PhotometerLink::stop) releases the transport and is idempotent.
//!
//! The transport itself lives in a spawned task (see `io_task`) that receives
//! [`LinkCommand`]s over an mpsc channel, each carrying a oneshot reply.

pub mod dedup;
pub mod device;
mod io_task;

use crate::bus::{Event, EventBus, Topic};
use crate::config::{DeviceDefaults, ZptessConfig};
use crate::core::{DeviceInfo, Model, Role, WriteOutcome};
use crate::error::{AppResult, ZptessError};
use crate::protocol::RawInfo;
use crate::transport::{Connector, Endpoint, EndpointConnector, RetryPolicy};
use device::InfoSource;
use io_task::IoTask;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Everything a link needs to know about its device.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Role of the device
    pub role: Role,
    /// Hardware model
    pub model: Model,
    /// Where the device lives
    pub endpoint: Endpoint,
    /// Legacy fixed-field readings instead of JSON
    pub old_protocol: bool,
    /// Dark frequency offset copied into the device info
    pub frequency_offset: f64,
    /// Info request deadline
    pub info_timeout: Duration,
    /// Zero point write deadline
    pub write_timeout: Duration,
    /// Reconnection policy (TCP only)
    pub retry: RetryPolicy,
    /// Fallback identity for a silent serial TESS-W reference
    pub defaults: Option<DeviceDefaults>,
    /// Absolute zero point, reference role only
    pub absolute_zero_point: Option<f64>,
    /// Host for TESS-W web requests, taken from the endpoint by default
    pub http_host: Option<String>,
}

impl LinkOptions {
    /// Options for `role` from the loaded configuration.
    pub fn from_config(role: Role, config: &ZptessConfig) -> AppResult<Self> {
        let phot = config.photometer(role);
        let endpoint = phot.endpoint()?;
        let http_host = endpoint.host().map(str::to_string);
        Ok(Self {
            role,
            model: phot.model,
            endpoint,
            old_protocol: phot.old_protocol,
            frequency_offset: phot.frequency_offset,
            info_timeout: phot.info_timeout,
            write_timeout: phot.write_timeout,
            retry: RetryPolicy::from(&phot.retry),
            defaults: phot.defaults.clone(),
            absolute_zero_point: match role {
                Role::Reference => Some(config.calibration.absolute_zero_point),
                Role::Test => None,
            },
            http_host,
        })
    }

    fn complete(&self, raw: RawInfo) -> DeviceInfo {
        let mut info = raw.into_device_info(self.role, self.model, self.frequency_offset);
        info.absolute_zero_point = self.absolute_zero_point;
        info
    }

    /// Default record for a serial TESS-W reference that did not answer.
    fn fallback(&self) -> Option<DeviceInfo> {
        if self.role != Role::Reference || self.model != Model::TessW || !self.endpoint.is_serial()
        {
            return None;
        }
        let defaults = self.defaults.as_ref()?;
        Some(self.complete(RawInfo {
            name: defaults.name.clone(),
            mac: defaults.mac.clone(),
            firmware: defaults.firmware.clone(),
            zero_point: defaults.zero_point,
        }))
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No transport
    Disconnected,
    /// Opening or reopening the transport
    Connecting,
    /// Transport open, readings not forwarded yet
    Connected,
    /// Forwarding readings
    Streaming,
    /// Device unreachable or silent, `photometer_off` published
    Offline,
    /// Stopped by the owner
    Stopped,
}

/// Per-link protocol counters, logged when the link closes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkCounters {
    /// Records received
    pub received: u64,
    /// Records understood (readings and solicited fields)
    pub decoded: u64,
    /// Records not understood
    pub discarded: u64,
    /// Readings dropped as retransmissions
    pub duplicates: u64,
    /// Readings published
    pub forwarded: u64,
}

pub(crate) enum LinkCommand {
    ReadInfo {
        reply: oneshot::Sender<AppResult<RawInfo>>,
    },
    WriteZeroPoint {
        zero_point: f64,
        reply: oneshot::Sender<AppResult<WriteOutcome>>,
    },
    StartStreaming {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable command handle to a running link.
#[derive(Clone)]
pub struct LinkHandle {
    role: Role,
    cmd_tx: mpsc::Sender<LinkCommand>,
}

impl LinkHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> LinkCommand,
    ) -> AppResult<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| ZptessError::Transport(format!("{} link is closed", self.role)))?;
        rx.await
            .map_err(|_| ZptessError::Transport(format!("{} link closed before answering", self.role)))
    }

    async fn read_info(&self) -> AppResult<RawInfo> {
        self.request(|reply| LinkCommand::ReadInfo { reply }).await?
    }

    async fn start_streaming(&self) -> AppResult<()> {
        self.request(|reply| LinkCommand::StartStreaming { reply })
            .await
    }

    /// Writes a zero point and verifies it. A read-back mismatch is an `Ok`
    /// outcome; only a failed write is an error.
    pub async fn write_zero_point(&self, zero_point: f64) -> AppResult<WriteOutcome> {
        self.request(|reply| LinkCommand::WriteZeroPoint { zero_point, reply })
            .await?
    }
}

struct Running {
    handle: LinkHandle,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<LinkCounters>,
}

/// Link to one photometer.
pub struct PhotometerLink {
    options: LinkOptions,
    bus: EventBus,
    connector: Arc<dyn Connector>,
    state_tx: Arc<watch::Sender<LinkState>>,
    state_rx: watch::Receiver<LinkState>,
    running: Option<Running>,
    info: Option<DeviceInfo>,
}

impl PhotometerLink {
    /// Link using real serial ports and sockets.
    pub fn new(options: LinkOptions, bus: EventBus) -> Self {
        Self::with_connector(options, bus, Arc::new(EndpointConnector))
    }

    /// Link using a custom connector.
    pub fn with_connector(options: LinkOptions, bus: EventBus, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        Self {
            options,
            bus,
            connector,
            state_tx: Arc::new(state_tx),
            state_rx,
            running: None,
            info: None,
        }
    }

    /// Role of this link.
    pub fn role(&self) -> Role {
        self.options.role
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Watch channel following the lifecycle state.
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Device info obtained by [`start`](Self::start).
    pub fn info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    /// Command handle, available once started.
    pub fn handle(&self) -> AppResult<LinkHandle> {
        self.running
            .as_ref()
            .map(|running| running.handle.clone())
            .ok_or(ZptessError::LinkNotStarted)
    }

    /// Connects and reads device info.
    ///
    /// Returns `Ok(None)` after publishing `photometer_off` when the device
    /// cannot be reached or does not answer; the link is stopped in that case
    /// and info requests are not retried.
    pub async fn start(&mut self) -> AppResult<Option<DeviceInfo>> {
        if self.running.is_some() {
            return Ok(self.info.clone());
        }
        let role = self.options.role;
        info!(
            role = %role,
            model = %self.options.model,
            endpoint = %self.options.endpoint,
            "Starting photometer link"
        );

        let info_source =
            match InfoSource::for_model(self.options.model, self.options.http_host.as_deref()) {
                Ok(source) => source,
                Err(err) => {
                    error!(role = %role, error = %err, "Cannot build info source");
                    self.go_offline(&err).await;
                    return Ok(None);
                }
            };
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = IoTask::new(
            self.options.clone(),
            self.bus.clone(),
            self.connector.clone(),
            info_source,
            self.state_tx.clone(),
        );
        let join = tokio::spawn(task.run(cmd_rx, shutdown_rx, ready_tx));
        let handle = LinkHandle { role, cmd_tx };
        self.running = Some(Running {
            handle: handle.clone(),
            shutdown_tx,
            task: join,
        });

        let connected = ready_rx.await.unwrap_or_else(|_| {
            Err(ZptessError::Transport("Link task ended before connecting".to_string()))
        });

        let outcome = match connected {
            Ok(()) => match handle.read_info().await {
                Ok(raw) => Ok(self.options.complete(raw)),
                Err(err) => {
                    error!(role = %role, error = %err, "Could not read photometer info");
                    match self.options.fallback() {
                        Some(info) => {
                            warn!("Fixed photometer info with defaults");
                            Ok(info)
                        }
                        None => Err(err),
                    }
                }
            },
            Err(err) => Err(err),
        };

        match outcome {
            Ok(info) => {
                log_info(&info);
                self.info = Some(info.clone());
                self.bus.publish(Event::PhotometerInfo {
                    role,
                    info: info.clone(),
                });
                Ok(Some(info))
            }
            Err(err) => {
                self.go_offline(&err).await;
                Ok(None)
            }
        }
    }

    /// Releases the transport and publishes `photometer_off` for `err`.
    async fn go_offline(&mut self, err: &ZptessError) {
        let reason = if err.is_timeout() {
            format!("no answer: {}", err)
        } else {
            err.to_string()
        };
        self.stop().await;
        self.state_tx.send_replace(LinkState::Offline);
        self.bus.publish(Event::PhotometerOff {
            role: self.options.role,
            reason,
        });
    }

    /// Starts forwarding deduplicated readings as `phot_sample` events.
    pub async fn stream_readings(&self) -> AppResult<()> {
        self.handle()?.start_streaming().await
    }

    /// Writes a zero point and verifies it, see [`LinkHandle::write_zero_point`].
    pub async fn write_zero_point(&self, zero_point: f64) -> AppResult<WriteOutcome> {
        self.handle()?.write_zero_point(zero_point).await
    }

    /// Serves `update_zero_point` events for this link's role, answering each
    /// with `zero_point_written`.
    pub fn spawn_zero_point_listener(&self) -> AppResult<JoinHandle<()>> {
        let handle = self.handle()?;
        let bus = self.bus.clone();
        let role = self.options.role;
        let mut sub = bus.subscribe(&[Topic::UpdateZeroPoint]);

        Ok(tokio::spawn(async move {
            while let Ok(event) = sub.recv().await {
                let Event::UpdateZeroPoint { role: target, zero_point } = event else {
                    continue;
                };
                if target != role {
                    continue;
                }
                let outcome = match handle.write_zero_point(zero_point).await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        error!(role = %role, error = %err, "Zero point update failed");
                        WriteOutcome::Failed {
                            requested: zero_point,
                            reason: err.to_string(),
                        }
                    }
                };
                bus.publish(Event::ZeroPointWritten { role, outcome });
            }
        }))
    }

    /// Releases the transport. Safe to call any number of times.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        info!(role = %self.options.role, "Stopping photometer link");
        let _ = running.shutdown_tx.send(());
        match running.task.await {
            Ok(_counters) => {}
            Err(err) => warn!(role = %self.options.role, error = %err, "Link task failed"),
        }
        if self.state() != LinkState::Offline {
            self.state_tx.send_replace(LinkState::Stopped);
        }
    }
}

impl Drop for PhotometerLink {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(());
        }
    }
}

fn log_info(info: &DeviceInfo) {
    let label = info.role.label();
    info!("[{}] Role      : {}", label, info.role);
    info!("[{}] Model     : {}", label, info.model);
    info!("[{}] Name      : {}", label, info.name);
    info!("[{}] MAC       : {}", label, info.mac);
    info!("[{}] Zero Point: {:.2} (old)", label, info.stored_zero_point);
    info!("[{}] Firmware  : {}", label, info.firmware);
}
