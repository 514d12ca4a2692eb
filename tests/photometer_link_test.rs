//! Photometer link against in-memory devices.
//!
//! A fake TAS answers solicited requests over a `tokio::io::duplex` pipe, and
//! a minimal HTTP server stands in for the TESS-W web pages.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use zptess::bus::{Event, EventBus, Topic};
use zptess::config::ZptessConfig;
use zptess::core::{Model, Role, WriteOutcome};
use zptess::error::{AppResult, ZptessError};
use zptess::photometer::{LinkOptions, LinkState, PhotometerLink};
use zptess::transport::{Connector, Endpoint, StreamTransport, Transport};

/// Hands out prepared pipes in order. `None` entries and an empty queue
/// refuse the connection.
struct PipeConnector {
    pipes: Mutex<VecDeque<Option<DuplexStream>>>,
    connects: AtomicUsize,
}

impl PipeConnector {
    fn new(pipes: Vec<Option<DuplexStream>>) -> Arc<Self> {
        Arc::new(Self {
            pipes: Mutex::new(pipes.into()),
            connects: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Connector for PipeConnector {
    async fn connect(&self, endpoint: &Endpoint) -> AppResult<Box<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let pipe = self.pipes.lock().unwrap().pop_front().flatten();
        match pipe {
            Some(stream) => Ok(Box::new(StreamTransport::new(stream, endpoint.to_string()))),
            None => Err(ZptessError::Transport("connection refused".into())),
        }
    }
}

/// Fake TAS: answers `?` with its info block, stores `zp` writes with a
/// configurable error, and sends whatever the test pushes.
fn spawn_tas(stream: DuplexStream, zero_point: f64, store_error: f64) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let (rd, mut wr) = tokio::io::split(stream);
        let mut lines = BufReader::new(rd).lines();
        let mut zp = zero_point;
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line == "?" {
                            let block = format!(
                                "name: stars900\nmac: 5C:CF:7F:76:6A:9F\nfirmware: Feb 12 2020\nzp: {:.2}\n",
                                zp
                            );
                            if wr.write_all(block.as_bytes()).await.is_err() {
                                break;
                            }
                        } else if let Some(value) = line.strip_prefix("zp ") {
                            if let Ok(value) = value.parse::<f64>() {
                                zp = value + store_error;
                            }
                        }
                    }
                    _ => break,
                },
                push = rx.recv() => match push {
                    Some(text) => {
                        if wr.write_all(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    tx
}

fn tas_options(role: Role) -> LinkOptions {
    tas_options_at(role, "serial:/dev/ttyACM0:9600")
}

fn tas_options_at(role: Role, endpoint: &str) -> LinkOptions {
    let mut config = ZptessConfig::default();
    let phot = config.photometer_mut(role);
    phot.model = Model::Tas;
    phot.endpoint = endpoint.to_string();
    phot.info_timeout = Duration::from_millis(500);
    phot.write_timeout = Duration::from_millis(500);
    LinkOptions::from_config(role, &config).unwrap()
}

#[tokio::test]
async fn tas_info_and_deduplicated_stream() {
    let (link_side, device_side) = tokio::io::duplex(4096);
    let device = spawn_tas(device_side, 20.45, 0.0);
    let bus = EventBus::new();
    let mut samples = bus.subscribe(&[Topic::PhotSample]);
    let mut infos = bus.subscribe(&[Topic::PhotometerInfo]);

    let mut link = PhotometerLink::with_connector(
        tas_options(Role::Test),
        bus.clone(),
        PipeConnector::new(vec![Some(link_side)]),
    );
    let info = link.start().await.unwrap().expect("device info");
    assert_eq!(info.name, "stars900");
    assert_eq!(info.stored_zero_point, 20.45);
    assert_eq!(info.role, Role::Test);
    assert!(matches!(
        infos.recv().await.unwrap(),
        Event::PhotometerInfo { role: Role::Test, .. }
    ));

    link.stream_readings().await.unwrap();
    assert_eq!(link.state(), LinkState::Streaming);

    for seq in [1, 1, 2, 2, 2, 3, 1, 1, 4] {
        device
            .send(format!("{{\"seq\":{},\"freq\":{}.5}}\n", seq, 10 + seq))
            .unwrap();
    }
    device.send("garbage line\n".to_string()).unwrap();

    let mut forwarded = Vec::new();
    while forwarded.len() < 5 {
        match samples.recv().await.unwrap() {
            Event::PhotSample { role, reading } => {
                assert_eq!(role, Role::Test);
                forwarded.push(reading.sequence.unwrap());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(forwarded, vec![1, 2, 3, 1, 4]);

    link.stop().await;
    link.stop().await;
    assert_eq!(link.state(), LinkState::Stopped);
}

#[tokio::test]
async fn unreachable_device_goes_offline_without_retry() {
    let bus = EventBus::new();
    let mut off = bus.subscribe(&[Topic::PhotometerOff]);
    let connector = PipeConnector::new(Vec::new());

    let mut config = ZptessConfig::default();
    config.test.model = Model::Tas;
    config.test.endpoint = "tcp:127.0.0.1:23".to_string();
    let options = LinkOptions::from_config(Role::Test, &config).unwrap();

    let mut link = PhotometerLink::with_connector(options, bus.clone(), connector.clone());
    assert!(link.start().await.unwrap().is_none());
    assert_eq!(link.state(), LinkState::Offline);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    assert!(matches!(
        off.recv().await.unwrap(),
        Event::PhotometerOff { role: Role::Test, .. }
    ));
}

fn reading(seq: u64) -> String {
    format!("{{\"seq\":{},\"freq\":{}.5}}\n", seq, 10 + seq)
}

async fn next_sequence(samples: &mut zptess::bus::Subscription) -> u64 {
    match samples.recv().await.unwrap() {
        Event::PhotSample { reading, .. } => reading.sequence.unwrap(),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn tcp_link_reconnects_and_resumes_streaming() {
    let (first_link, first_device) = tokio::io::duplex(4096);
    let (second_link, second_device) = tokio::io::duplex(4096);
    let connector = PipeConnector::new(vec![Some(first_link), None, Some(second_link)]);
    let bus = EventBus::new();
    let mut samples = bus.subscribe(&[Topic::PhotSample]);
    let mut off = bus.subscribe(&[Topic::PhotometerOff]);

    let mut link = PhotometerLink::with_connector(
        tas_options_at(Role::Test, "tcp:127.0.0.1:23"),
        bus.clone(),
        connector.clone(),
    );
    let first = spawn_tas(first_device, 20.10, 0.0);
    link.start().await.unwrap().expect("device info");
    link.stream_readings().await.unwrap();

    first.send(reading(1)).unwrap();
    first.send(reading(2)).unwrap();
    drop(first);
    assert_eq!(next_sequence(&mut samples).await, 1);
    assert_eq!(next_sequence(&mut samples).await, 2);

    let second = spawn_tas(second_device, 20.10, 0.0);
    second.send(reading(3)).unwrap();
    second.send(reading(4)).unwrap();
    assert_eq!(next_sequence(&mut samples).await, 3);
    assert_eq!(next_sequence(&mut samples).await, 4);

    // One refused attempt between the two pipes.
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    assert_eq!(link.state(), LinkState::Streaming);
    assert!(off.try_recv().unwrap().is_none());
    link.stop().await;
}

#[tokio::test]
async fn serial_link_goes_offline_when_device_disappears() {
    let (link_side, device_side) = tokio::io::duplex(4096);
    let device = spawn_tas(device_side, 20.10, 0.0);
    let connector = PipeConnector::new(vec![Some(link_side)]);
    let bus = EventBus::new();
    let mut samples = bus.subscribe(&[Topic::PhotSample]);
    let mut off = bus.subscribe(&[Topic::PhotometerOff]);

    let mut link =
        PhotometerLink::with_connector(tas_options(Role::Test), bus.clone(), connector.clone());
    link.start().await.unwrap().expect("device info");
    link.stream_readings().await.unwrap();

    device.send(reading(1)).unwrap();
    assert_eq!(next_sequence(&mut samples).await, 1);
    drop(device);

    match off.recv().await.unwrap() {
        Event::PhotometerOff { role, reason } => {
            assert_eq!(role, Role::Test);
            assert!(reason.contains("connection lost"), "{}", reason);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(link.state(), LinkState::Offline);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    link.stop().await;
}

#[tokio::test]
async fn udp_link_goes_offline_when_transport_closes() {
    let (link_side, device_side) = tokio::io::duplex(4096);
    let connector = PipeConnector::new(vec![Some(link_side)]);
    let bus = EventBus::new();
    let mut off = bus.subscribe(&[Topic::PhotometerOff]);

    let mut link = PhotometerLink::with_connector(
        tas_options_at(Role::Test, "udp:127.0.0.1:2255"),
        bus.clone(),
        connector.clone(),
    );
    let device = spawn_tas(device_side, 20.10, 0.0);
    link.start().await.unwrap().expect("device info");
    drop(device);

    match off.recv().await.unwrap() {
        Event::PhotometerOff { reason, .. } => assert!(reason.contains("connection lost")),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(link.state(), LinkState::Offline);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn silent_serial_reference_uses_default_identity() {
    let (link_side, _device_side) = tokio::io::duplex(4096);
    let bus = EventBus::new();
    let mut infos = bus.subscribe(&[Topic::PhotometerInfo]);
    let mut off = bus.subscribe(&[Topic::PhotometerOff]);

    let config = ZptessConfig::default();
    let options = LinkOptions::from_config(Role::Reference, &config).unwrap();
    assert_eq!(options.model, Model::TessW);
    assert!(options.http_host.is_none());

    let mut link = PhotometerLink::with_connector(
        options,
        bus.clone(),
        PipeConnector::new(vec![Some(link_side)]),
    );
    let info = link.start().await.unwrap().expect("fallback info");
    assert_eq!(info.role, Role::Reference);
    assert_eq!(info.name, "stars3");
    assert_eq!(info.mac, "18:FE:34:CF:E9:A3");
    assert_eq!(info.stored_zero_point, 20.44);
    assert_eq!(info.absolute_zero_point, Some(20.44));

    match infos.recv().await.unwrap() {
        Event::PhotometerInfo { role, info: published } => {
            assert_eq!(role, Role::Reference);
            assert_eq!(published, info);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(off.try_recv().unwrap().is_none());
    assert_ne!(link.state(), LinkState::Offline);
    link.stop().await;
}

#[tokio::test]
async fn malformed_tessw_host_goes_offline_before_connecting() {
    let bus = EventBus::new();
    let mut off = bus.subscribe(&[Topic::PhotometerOff]);
    let connector = PipeConnector::new(Vec::new());

    let mut config = ZptessConfig::default();
    config.test.endpoint = "udp:127.0.0.1:2255".to_string();
    let mut options = LinkOptions::from_config(Role::Test, &config).unwrap();
    options.http_host = Some("bad host".to_string());

    let mut link = PhotometerLink::with_connector(options, bus.clone(), connector.clone());
    assert!(link.start().await.unwrap().is_none());
    assert_eq!(link.state(), LinkState::Offline);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    match off.recv().await.unwrap() {
        Event::PhotometerOff { role, reason } => {
            assert_eq!(role, Role::Test);
            assert!(reason.contains("TESS-W host"), "{}", reason);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn silent_device_times_out() {
    let (link_side, _device_side) = tokio::io::duplex(4096);
    let bus = EventBus::new();
    let mut off = bus.subscribe(&[Topic::PhotometerOff]);
    let mut link = PhotometerLink::with_connector(
        tas_options(Role::Test),
        bus.clone(),
        PipeConnector::new(vec![Some(link_side)]),
    );

    assert!(link.start().await.unwrap().is_none());
    match off.recv().await.unwrap() {
        Event::PhotometerOff { reason, .. } => assert!(reason.contains("no answer")),
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn solicited_write_is_verified() {
    let (link_side, device_side) = tokio::io::duplex(4096);
    let _device = spawn_tas(device_side, 20.10, 0.0);
    let mut link = PhotometerLink::with_connector(
        tas_options(Role::Test),
        EventBus::new(),
        PipeConnector::new(vec![Some(link_side)]),
    );
    link.start().await.unwrap().expect("device info");

    let outcome = link.write_zero_point(20.504).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Confirmed { zero_point: 20.50 });
    link.stop().await;
}

#[tokio::test]
async fn solicited_write_mismatch_is_reported() {
    let (link_side, device_side) = tokio::io::duplex(4096);
    let _device = spawn_tas(device_side, 20.10, -0.01);
    let mut link = PhotometerLink::with_connector(
        tas_options(Role::Test),
        EventBus::new(),
        PipeConnector::new(vec![Some(link_side)]),
    );
    link.start().await.unwrap().expect("device info");

    let outcome = link.write_zero_point(20.50).await.unwrap();
    assert_eq!(
        outcome,
        WriteOutcome::Mismatch {
            requested: 20.50,
            read_back: 20.49,
            delta: 0.01,
        }
    );
    link.stop().await;
}

#[tokio::test]
async fn zero_point_listener_answers_updates() {
    let (link_side, device_side) = tokio::io::duplex(4096);
    let _device = spawn_tas(device_side, 20.10, 0.0);
    let bus = EventBus::new();
    let mut written = bus.subscribe(&[Topic::ZeroPointWritten]);
    let mut link = PhotometerLink::with_connector(
        tas_options(Role::Test),
        bus.clone(),
        PipeConnector::new(vec![Some(link_side)]),
    );
    link.start().await.unwrap().expect("device info");
    let listener = link.spawn_zero_point_listener().unwrap();

    bus.publish(Event::UpdateZeroPoint {
        role: Role::Test,
        zero_point: 20.33,
    });
    match written.recv().await.unwrap() {
        Event::ZeroPointWritten { role, outcome } => {
            assert_eq!(role, Role::Test);
            assert!(outcome.is_confirmed());
        }
        other => panic!("unexpected event {:?}", other),
    }
    listener.abort();
    link.stop().await;
}

/// Serves the TESS-W status and set-constant pages for `zero_point`.
async fn spawn_tessw_web(zero_point: f64) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stored = Arc::new(Mutex::new(zero_point));
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let stored = stored.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let body = if let Some(value) = path.strip_prefix("/setconst?cons=") {
                    let value: f64 = value.parse().unwrap_or(0.0);
                    *stored.lock().unwrap() = value;
                    format!("<html><body>New Zero Point {:.2}<br></body></html>", value)
                } else {
                    format!(
                        "<html><body><h2>STARS4ALL</h2>stars1234<br>MAC: 5C:CF:7F:76:6A:9F<br>\
                         ZP: {:.2}<br>Compiled: Sep 18 2019<br></body></html>",
                        *stored.lock().unwrap()
                    )
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr.to_string()
}

#[tokio::test]
async fn tessw_info_and_write_over_http() {
    let host = spawn_tessw_web(20.36).await;
    let (link_side, _device_side) = tokio::io::duplex(4096);

    let mut config = ZptessConfig::default();
    config.test.endpoint = "udp:127.0.0.1:2255".to_string();
    let mut options = LinkOptions::from_config(Role::Test, &config).unwrap();
    options.http_host = Some(host);

    let mut link = PhotometerLink::with_connector(
        options,
        EventBus::new(),
        PipeConnector::new(vec![Some(link_side)]),
    );
    let info = link.start().await.unwrap().expect("device info");
    assert_eq!(info.name, "stars1234");
    assert_eq!(info.mac, "5C:CF:7F:76:6A:9F");
    assert_eq!(info.stored_zero_point, 20.36);

    let outcome = link.write_zero_point(20.5).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Confirmed { zero_point: 20.5 });
    link.stop().await;
}
