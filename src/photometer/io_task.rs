//! The task that exclusively owns a photometer transport.
//!
//! It multiplexes three sources in one `select!` loop: the shutdown signal,
//! commands from the [`PhotometerLink`](super::PhotometerLink) and records
//! arriving from the device. Info and zero point requests are served inline,
//! so readings that arrive while waiting for an answer are still decoded.

use super::dedup::Deduplicator;
use super::device::InfoSource;
use super::{LinkCommand, LinkCounters, LinkOptions, LinkState};
use crate::bus::{Event, EventBus};
use crate::core::{round2, Reading, WriteOutcome};
use crate::error::{AppResult, ZptessError};
use crate::logging::PROTOCOL_TARGET;
use crate::protocol::{tas, tessw_page, Decoded, LineDecoder, RawInfo, ReadingFormat};
use crate::transport::{Connector, Transport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, info_span, warn, Instrument};

type BoxedTransport = Box<dyn Transport>;

enum Wake {
    Shutdown,
    Command(LinkCommand),
    Frame(AppResult<Option<String>>),
}

pub(crate) struct IoTask {
    options: LinkOptions,
    bus: EventBus,
    connector: Arc<dyn Connector>,
    info_source: InfoSource,
    state_tx: Arc<watch::Sender<LinkState>>,
    decoder: LineDecoder,
    dedup: Deduplicator,
    delimiter: u8,
    streaming: bool,
    cancelled: bool,
    counters: LinkCounters,
}

impl IoTask {
    pub(crate) fn new(
        options: LinkOptions,
        bus: EventBus,
        connector: Arc<dyn Connector>,
        info_source: InfoSource,
        state_tx: Arc<watch::Sender<LinkState>>,
    ) -> Self {
        let decoder = LineDecoder::new(options.model, options.old_protocol);
        Self {
            options,
            bus,
            connector,
            info_source,
            state_tx,
            decoder,
            dedup: Deduplicator::default(),
            delimiter: b'\n',
            streaming: false,
            cancelled: false,
            counters: LinkCounters::default(),
        }
    }

    pub(crate) async fn run(
        self,
        commands: mpsc::Receiver<LinkCommand>,
        shutdown: oneshot::Receiver<()>,
        ready: oneshot::Sender<AppResult<()>>,
    ) -> LinkCounters {
        let span = info_span!("link", role = %self.options.role, endpoint = %self.options.endpoint);
        self.serve(commands, shutdown, ready).instrument(span).await
    }

    async fn serve(
        mut self,
        mut commands: mpsc::Receiver<LinkCommand>,
        mut shutdown: oneshot::Receiver<()>,
        ready: oneshot::Sender<AppResult<()>>,
    ) -> LinkCounters {
        self.set_state(LinkState::Connecting);

        let connector = self.connector.clone();
        let endpoint = self.options.endpoint.clone();
        let first = tokio::select! {
            _ = &mut shutdown => None,
            result = connector.connect(&endpoint) => Some(result),
        };

        let mut transport = match first {
            Some(Ok(transport)) => {
                info!("Connected via {}", transport.describe());
                self.set_state(LinkState::Connected);
                let _ = ready.send(Ok(()));
                transport
            }
            Some(Err(err)) => {
                error!(error = %err, "Could not open {}", endpoint);
                self.set_state(LinkState::Disconnected);
                let _ = ready.send(Err(err));
                return self.counters;
            }
            None => {
                self.set_state(LinkState::Disconnected);
                let _ = ready.send(Err(ZptessError::Transport(
                    "Link stopped while connecting".to_string(),
                )));
                return self.counters;
            }
        };

        loop {
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Shutdown,
                cmd = commands.recv() => cmd.map_or(Wake::Shutdown, Wake::Command),
                frame = transport.read_frame() => Wake::Frame(frame),
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Command(cmd) => self.handle_command(cmd, &mut transport, &mut shutdown).await,
                Wake::Frame(Ok(Some(line))) => {
                    if let Some(info) = self.on_line(&line) {
                        debug!(name = %info.name, "Ignoring unsolicited info block");
                    }
                }
                Wake::Frame(Ok(None)) => {
                    match self.reconnect("closed by peer", &mut shutdown).await {
                        Some(fresh) => transport = fresh,
                        None => break,
                    }
                }
                Wake::Frame(Err(err)) => {
                    match self.reconnect(&err.to_string(), &mut shutdown).await {
                        Some(fresh) => transport = fresh,
                        None => break,
                    }
                }
            }

            if self.cancelled {
                break;
            }
        }

        if *self.state_tx.borrow() != LinkState::Offline {
            self.set_state(LinkState::Disconnected);
        }
        let c = self.counters;
        info!(
            received = c.received,
            decoded = c.decoded,
            discarded = c.discarded,
            duplicates = c.duplicates,
            forwarded = c.forwarded,
            "Link closed"
        );
        c
    }

    fn set_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    fn label(&self) -> &'static str {
        self.options.role.label()
    }

    /// Decodes one record. Returns a completed solicited info block.
    fn on_line(&mut self, line: &str) -> Option<RawInfo> {
        self.counters.received += 1;
        debug!(target: PROTOCOL_TARGET, "<== {} [{:02}] {}", self.label(), line.len(), line);

        match self.decoder.decode(line, Utc::now()) {
            Decoded::Reading(reading) => {
                self.counters.decoded += 1;
                self.forward(reading);
                None
            }
            Decoded::Info(info) => {
                self.counters.decoded += 1;
                Some(info)
            }
            Decoded::Partial => {
                self.counters.decoded += 1;
                None
            }
            Decoded::Discarded => {
                self.counters.discarded += 1;
                None
            }
        }
    }

    fn forward(&mut self, reading: Reading) {
        if !self.streaming {
            return;
        }
        if !self.dedup.accept(&reading) {
            self.counters.duplicates += 1;
            return;
        }
        self.counters.forwarded += 1;
        self.bus.publish(Event::PhotSample {
            role: self.options.role,
            reading,
        });
    }

    async fn handle_command(
        &mut self,
        cmd: LinkCommand,
        transport: &mut BoxedTransport,
        shutdown: &mut oneshot::Receiver<()>,
    ) {
        match cmd {
            LinkCommand::ReadInfo { reply } => {
                let result = self.read_info(transport, shutdown).await;
                if let Ok(info) = &result {
                    self.check_firmware(&info.firmware, transport);
                }
                let _ = reply.send(result);
            }
            LinkCommand::WriteZeroPoint { zero_point, reply } => {
                let result = self.write_zero_point(zero_point, transport).await;
                let _ = reply.send(result);
            }
            LinkCommand::StartStreaming { reply } => {
                self.streaming = true;
                self.set_state(LinkState::Streaming);
                info!("Streaming readings");
                let _ = reply.send(());
            }
        }
    }

    async fn read_info(
        &mut self,
        transport: &mut BoxedTransport,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> AppResult<RawInfo> {
        let timeout = self.options.info_timeout;
        match self.info_source.clone() {
            InfoSource::Http(http) => {
                tokio::select! {
                    _ = &mut *shutdown => {
                        self.cancelled = true;
                        Err(ZptessError::Transport("Link stopped during info request".to_string()))
                    }
                    result = http.read_info(timeout) => result,
                }
            }
            InfoSource::Solicited => self.solicit_info(transport, timeout, Some(shutdown)).await,
            InfoSource::Unavailable(reason) => Err(InfoSource::unavailable_error(&reason)),
        }
    }

    /// Sends an info request and waits for the complete answer block.
    async fn solicit_info(
        &mut self,
        transport: &mut BoxedTransport,
        timeout: Duration,
        shutdown: Option<&mut oneshot::Receiver<()>>,
    ) -> AppResult<RawInfo> {
        self.decoder.reset_solicited();
        debug!(target: PROTOCOL_TARGET, "==> {} {}", self.label(), tas::INFO_REQUEST.trim_end());
        transport.write_line(tas::INFO_REQUEST).await?;

        let stop = async {
            match shutdown {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(stop);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = tokio::select! {
                _ = &mut stop => {
                    self.cancelled = true;
                    return Err(ZptessError::Transport(
                        "Link stopped during info request".to_string(),
                    ));
                }
                frame = tokio::time::timeout_at(deadline, transport.read_frame()) => frame,
            };

            match frame {
                Err(_) => {
                    return Err(ZptessError::Timeout(format!(
                        "No info answer within {:?}",
                        timeout
                    )))
                }
                Ok(Err(err)) => return Err(err),
                Ok(Ok(None)) => {
                    return Err(ZptessError::Transport(
                        "Connection closed during info request".to_string(),
                    ))
                }
                Ok(Ok(Some(line))) => {
                    if let Some(info) = self.on_line(&line) {
                        return Ok(info);
                    }
                }
            }
        }
    }

    /// Writes a zero point and reads it back. Not cancelled by shutdown.
    async fn write_zero_point(
        &mut self,
        zero_point: f64,
        transport: &mut BoxedTransport,
    ) -> AppResult<WriteOutcome> {
        let zero_point = round2(zero_point);
        let timeout = self.options.write_timeout;
        info!("[{}] Updating ZP : {:.2}", self.label(), zero_point);

        let read_back = match self.info_source.clone() {
            InfoSource::Http(http) => match http.write_zero_point(zero_point, timeout).await {
                Ok(confirmed) => Ok(confirmed),
                Err(ZptessError::Parse(reason)) => {
                    warn!("{}; reading the status page instead", reason);
                    http.read_info(timeout).await.map(|info| info.zero_point)
                }
                Err(err) => return Err(err),
            },
            InfoSource::Solicited => {
                let request = tas::write_zero_point_request(zero_point);
                debug!(target: PROTOCOL_TARGET, "==> {} {}", self.label(), request.trim_end());
                transport.write_line(&request).await?;
                self.solicit_info(transport, timeout, None)
                    .await
                    .map(|info| info.zero_point)
            }
            InfoSource::Unavailable(reason) => return Err(InfoSource::unavailable_error(&reason)),
        };

        let outcome = match read_back {
            Ok(value) => WriteOutcome::verify(zero_point, value),
            Err(err) => WriteOutcome::Unverified {
                requested: zero_point,
                reason: err.to_string(),
            },
        };

        match &outcome {
            WriteOutcome::Confirmed { zero_point } => {
                info!("[{}] Written ZP : {:.2}", self.label(), zero_point)
            }
            WriteOutcome::Mismatch {
                requested,
                read_back,
                delta,
            } => warn!(
                "[{}] ZP mismatch: requested {:.2}, device reports {:.2} (delta {:.2})",
                self.label(),
                requested,
                read_back,
                delta
            ),
            WriteOutcome::Unverified { reason, .. } | WriteOutcome::Failed { reason, .. } => {
                warn!("[{}] ZP written but not verified: {}", self.label(), reason)
            }
        }
        Ok(outcome)
    }

    fn check_firmware(&mut self, firmware: &str, transport: &mut BoxedTransport) {
        let http = matches!(self.info_source, InfoSource::Http(_));
        if !http
            || self.decoder.format() != ReadingFormat::Json
            || !tessw_page::is_conflicting_firmware(firmware)
        {
            return;
        }
        warn!(
            firmware,
            "Firmware sends JSON without line terminators, framing on '}}'"
        );
        if self.options.endpoint.is_tcp() {
            warn!("TCP transport is unreliable with this firmware, use UDP instead");
        }
        self.delimiter = b'}';
        transport.set_delimiter(self.delimiter);
    }

    /// Replaces a lost transport. `None` means the link is done.
    async fn reconnect(
        &mut self,
        reason: &str,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Option<BoxedTransport> {
        if !self.options.endpoint.is_tcp() {
            error!("Connection lost: {}", reason);
            self.go_offline(format!("connection lost: {}", reason));
            return None;
        }

        warn!("Connection lost ({}), reconnecting", reason);
        self.set_state(LinkState::Connecting);

        let connector = self.connector.clone();
        let endpoint = self.options.endpoint.clone();
        let policy = self.options.retry.clone();
        let attempt = policy.run("Reconnection", || {
            let connector = connector.clone();
            let endpoint = endpoint.clone();
            async move { connector.connect(&endpoint).await }
        });

        let result = tokio::select! {
            _ = &mut *shutdown => None,
            result = attempt => Some(result),
        };

        match result {
            None => {
                self.cancelled = true;
                None
            }
            Some(Ok(mut transport)) => {
                transport.set_delimiter(self.delimiter);
                self.decoder.reset_solicited();
                info!("Reconnected via {}", transport.describe());
                self.set_state(if self.streaming {
                    LinkState::Streaming
                } else {
                    LinkState::Connected
                });
                Some(transport)
            }
            Some(Err(err)) => {
                error!(error = %err, "Giving up reconnection");
                self.go_offline(format!("reconnection failed: {}", err));
                None
            }
        }
    }

    fn go_offline(&mut self, reason: String) {
        self.set_state(LinkState::Offline);
        self.bus.publish(Event::PhotometerOff {
            role: self.options.role,
            reason,
        });
    }
}
