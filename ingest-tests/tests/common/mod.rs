//! Shared fixtures for the simulated-network scenarios

#![allow(dead_code)]

use ingest::{
    ConnectOptions, Context, ContextConfig, ErrorCode, Feeder, FeederConfig, MediaHandle,
    ReconnectPolicy, Session,
};
use ingest_io::SimNetwork;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
pub const BACKUP_SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
pub const CLIENT: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1));
pub const PORT: u16 = 2077;
pub const CHANNEL: &str = "live";
pub const FRAME_SIZE: usize = 1316;

pub fn context() -> Context {
    Context::init(ContextConfig {
        log_level: -1,
        ..ContextConfig::default()
    })
    .unwrap()
}

/// Seven TS packets on PID 0x100 carrying `index` in every packet
pub fn frame(index: u32) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_SIZE);
    for ts in 0..7u8 {
        frame.extend_from_slice(&[0x47, 0x01, 0x00, 0x10 | (ts & 0x0F)]);
        frame.extend_from_slice(&index.to_be_bytes());
        frame.resize(frame.len() + 180, (index as u8).wrapping_add(ts));
    }
    frame
}

pub fn frame_index(frame: &[u8]) -> u32 {
    u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]])
}

pub fn server_addr(host: IpAddr) -> SocketAddr {
    SocketAddr::new(host, PORT)
}

pub fn url(host: IpAddr) -> String {
    format!("ingest://{}:{}/{}", host, PORT, CHANNEL)
}

pub fn fast_reconnect(window: Duration) -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        idle_timeout: Duration::from_millis(500),
        retry_interval: Duration::from_millis(100),
        window,
    }
}

pub fn options() -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_secs(3),
        ..ConnectOptions::default()
    }
}

/// Feeder listening on `host` of the simulated network
pub fn listening_feeder(
    context: &Context,
    network: &Arc<SimNetwork>,
    host: IpAddr,
    config: FeederConfig,
) -> Feeder {
    let feeder = context
        .open_feeder(FeederConfig {
            channel: CHANNEL.to_string(),
            connector: Some(Arc::new(network.connector(host))),
            ..config
        })
        .unwrap();
    feeder.listen(PORT).unwrap();
    feeder
}

/// Session on the client host, identified as `guid`
pub fn receiver(context: &Context, network: &Arc<SimNetwork>, guid: &str) -> Session {
    let session = context.create_session().unwrap();
    session.configure_id(guid, "").unwrap();
    session
        .configure_custom_io(Arc::new(network.connector(CLIENT)))
        .unwrap();
    session
}

pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Send frames `range` to every feeder, one per millisecond
pub fn feed(feeders: &[&Feeder], range: std::ops::Range<u32>) {
    for index in range {
        let data = frame(index);
        for feeder in feeders {
            // A feeder whose receiver is away just misses the frame.
            let _ = feeder.send_frame(&data);
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// What a reader collected before the stream ended or the time ran out
#[derive(Debug, Default)]
pub struct Collected {
    pub frames: Vec<Vec<u8>>,
    pub discontinuities: usize,
    pub eof: bool,
}

impl Collected {
    pub fn indices(&self) -> Vec<u32> {
        self.frames.iter().map(|f| frame_index(f)).collect()
    }
}

/// Read whole frames until end of stream, `limit` frames or `timeout`
pub fn collect<H: MediaHandle>(handle: &H, limit: usize, timeout: Duration) -> Collected {
    let deadline = Instant::now() + timeout;
    let mut collected = Collected::default();
    let mut buf = vec![0u8; FRAME_SIZE];

    while Instant::now() < deadline && collected.frames.len() < limit {
        match handle.read(&mut buf, true) {
            Ok(outcome) => {
                if outcome.discontinuity {
                    collected.discontinuities += 1;
                }
                if outcome.bytes > 0 {
                    collected.frames.push(buf[..outcome.bytes].to_vec());
                }
                if outcome.eof {
                    collected.eof = true;
                    break;
                }
            }
            Err(ErrorCode::NotReady) => thread::sleep(Duration::from_millis(1)),
            Err(ErrorCode::EndOfFile) => {
                collected.eof = true;
                break;
            }
            Err(_) => break,
        }
    }
    collected
}
