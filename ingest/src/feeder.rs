//! Sending endpoint
//!
//! A [`Feeder`] packetizes frames, adds FEC parity, keeps sent packets for
//! retransmission and reacts to the receiver's feedback. It either listens
//! for a pulling [`Session`](crate::Session) or pushes to one that accepts.

use crate::context::ContextRef;
use crate::handle::link_error;
use crate::session::{new_session_id, STREAM_PAUSE, STREAM_RESUME, STREAM_SEEK};
use crate::url::ConnectTarget;
use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use ingest_io::{Connector, Link, MediaClock, RateLimiter, Timer, UdpConnector};
use ingest_protocol::handshake::PROTOCOL_VERSION;
use ingest_protocol::{
    AckInfo, ConnectRequest, ConnectResponse, Connection, ConnectionAction, ConnectionState,
    ControlPacket, ControlType, DataPacket, EncoderControl, EncoderController, EncoderFeedback,
    ErrorCode, FecEncoder, FecParams, NakInfo, NetworkSample, Packet, ReconnectPolicy, Role,
    RttEstimator, SendBuffer, StreamInfo,
};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Seven TS packets per datagram
pub const MAX_FRAME_PAYLOAD: usize = 1316;

const TICK: Duration = Duration::from_millis(1);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(200);
const SEND_BUFFER_CAPACITY: usize = 8192;
const FEEDBACK_CAPACITY: usize = 64;
const MAX_DATAGRAMS_PER_TICK: usize = 512;
/// How long `close` waits for the end of stream to be acknowledged
const CLOSE_LINGER: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct FeederConfig {
    pub channel: String,
    /// Session token a receiver must present; empty accepts anyone
    pub password: String,
    /// Bits per second, 0 for no limit
    pub max_bitrate: u32,
    pub latency: Duration,
    pub fec_overhead: u8,
    pub fec_block: Duration,
    pub content_aware: bool,
    /// Reject frames above `max_bitrate` instead of sending them
    pub enforce_bitrate: bool,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub stream_info: StreamInfo,
    pub encoder_control: Option<EncoderControl>,
    pub connector: Option<Arc<dyn Connector>>,
}

impl Default for FeederConfig {
    fn default() -> Self {
        FeederConfig {
            channel: String::new(),
            password: String::new(),
            max_bitrate: 0,
            latency: Duration::from_millis(1000),
            fec_overhead: 0,
            fec_block: Duration::from_millis(50),
            content_aware: false,
            enforce_bitrate: false,
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            stream_info: StreamInfo::default(),
            encoder_control: None,
            connector: None,
        }
    }
}

impl FeederConfig {
    fn fec_params(&self) -> FecParams {
        FecParams {
            mode: u8::from(self.fec_overhead > 0),
            arq: true,
            overhead: self.fec_overhead,
            block_ms: self.fec_block.as_millis().min(u16::MAX as u128) as u16,
            content_aware: self.content_aware,
        }
    }
}

/// Playback request from a receiver of a finite stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    Pause,
    Resume,
    Seek(u8),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeederStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub parity_sent: u64,
    pub retransmitted: u64,
    pub naks_received: u64,
    pub frames_rejected: u64,
    pub rtt_ms: u32,
    pub fec_overhead: u8,
}

struct Peer {
    addr: SocketAddr,
    guid: String,
    session_id: u32,
    last_heard: Instant,
}

enum FeederMode {
    Listener,
    Pusher {
        request: ConnectRequest,
        connection: Connection,
        peer_addr: SocketAddr,
        session_id: u32,
    },
}

struct FeederState {
    config: FeederConfig,
    mode: Option<FeederMode>,
    link: Option<Box<dyn Link>>,
    clock: MediaClock,
    peer: Option<Peer>,
    send_buffer: SendBuffer,
    fec: Option<FecEncoder>,
    limiter: Option<RateLimiter>,
    encoder: Option<EncoderController>,
    requested_bitrate: Option<u32>,
    commands: VecDeque<StreamCommand>,
    rtt: RttEstimator,
    stats: FeederStats,
    last_sent: Instant,
    /// Deadline of an orderly close in progress
    closing: Option<Instant>,
    closed: bool,
}

impl FeederState {
    fn send(&mut self, packet: &Packet, to: SocketAddr, now: Instant) {
        let Some(link) = &self.link else {
            return;
        };
        match link.send_to(&packet.to_bytes(), to) {
            Ok(true) => self.last_sent = now,
            Ok(false) => tracing::trace!("send queue full"),
            Err(e) => tracing::warn!("send to {} failed: {}", to, e),
        }
    }

    fn send_control(&mut self, control: ControlPacket, to: SocketAddr, now: Instant) {
        let control = control.with_timestamp(self.clock.timestamp(now));
        self.send(&Packet::Control(control), to, now);
    }

    /// Address and connection id of a live receiver
    fn active_peer(&self, now: Instant) -> Option<(SocketAddr, u32)> {
        let peer = self.peer.as_ref()?;
        match &self.mode {
            Some(FeederMode::Pusher { connection, .. }) if !connection.is_connected() => None,
            Some(FeederMode::Listener)
                if now.saturating_duration_since(peer.last_heard)
                    >= self.config.reconnect.idle_timeout =>
            {
                None
            }
            _ => Some((peer.addr, peer.session_id)),
        }
    }

    fn connection_state(&self, now: Instant) -> ConnectionState {
        if self.closed {
            return ConnectionState::Disconnected;
        }
        if self.closing.is_some() {
            return ConnectionState::Disconnecting;
        }
        match &self.mode {
            None => ConnectionState::Disconnected,
            Some(FeederMode::Pusher { connection, .. }) => connection.state(),
            Some(FeederMode::Listener) => {
                if self.active_peer(now).is_some() {
                    ConnectionState::Connected
                } else if self.peer.is_some() {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Connecting
                }
            }
        }
    }

    /// New connection: sequence numbers restart and FEC follows the
    /// receiver's request
    fn start_connection(&mut self, session_id: u32, receiver: &FecParams, now: Instant) -> FecParams {
        let mut params = *receiver;
        if params.mode != 0 {
            params.overhead = params.overhead.max(self.config.fec_overhead);
            params.content_aware |= self.config.content_aware;
        }
        self.send_buffer = SendBuffer::new(SEND_BUFFER_CAPACITY, self.config.latency, session_id);
        self.fec = params.fec_enabled().then(|| {
            FecEncoder::new(
                Duration::from_millis(params.block_ms.max(1) as u64),
                params.overhead,
                params.content_aware,
            )
        });
        self.stats.fec_overhead = if params.fec_enabled() { params.overhead } else { 0 };
        self.rtt = RttEstimator::new();
        self.last_sent = now;
        tracing::info!(
            "connection {:08x}: fec mode {} overhead {}% arq {}",
            session_id,
            params.mode,
            params.overhead,
            params.arq
        );
        params
    }

    fn transmit_data(&mut self, packet: DataPacket, to: SocketAddr, now: Instant) {
        let parity = match self.fec.as_mut() {
            Some(fec) => fec.push(&packet, now),
            None => Vec::new(),
        };
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += packet.payload.len() as u64;
        self.send(&Packet::Data(packet), to, now);
        self.transmit_parity(parity, to, now);
    }

    fn transmit_parity(&mut self, parity: Vec<DataPacket>, to: SocketAddr, now: Instant) {
        for packet in parity {
            self.stats.parity_sent += 1;
            self.send(&Packet::Data(packet), to, now);
        }
    }
}

struct FeederShared {
    state: Mutex<FeederState>,
    changed: Condvar,
    stop: AtomicBool,
    feedback: Sender<EncoderFeedback>,
}

pub struct Feeder {
    context: ContextRef,
    guid: String,
    shared: Arc<FeederShared>,
    feedback: Receiver<EncoderFeedback>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Feeder {
    pub(crate) fn new(context: ContextRef, config: FeederConfig) -> Result<Feeder, ErrorCode> {
        if config.channel.is_empty() || config.latency.is_zero() || config.fec_overhead > 100 {
            return Err(ErrorCode::InvalidParameter);
        }
        if config.enforce_bitrate && config.max_bitrate == 0 {
            return Err(ErrorCode::InvalidParameter);
        }

        let now = Instant::now();
        let limiter = config.enforce_bitrate.then(|| {
            // One second worth of data as burst
            let burst = (config.max_bitrate / 8).max(MAX_FRAME_PAYLOAD as u32) as u64;
            RateLimiter::new(config.max_bitrate as u64, burst, now)
        });
        let encoder = config.encoder_control.map(EncoderController::new);
        let guid = format!("feeder-{:016x}", rand::thread_rng().gen::<u64>());
        let (sender, receiver) = channel::bounded(FEEDBACK_CAPACITY);

        let state = FeederState {
            send_buffer: SendBuffer::new(SEND_BUFFER_CAPACITY, config.latency, 0),
            config,
            mode: None,
            link: None,
            clock: MediaClock::new(now),
            peer: None,
            fec: None,
            limiter,
            encoder,
            requested_bitrate: None,
            commands: VecDeque::new(),
            rtt: RttEstimator::new(),
            stats: FeederStats::default(),
            last_sent: now,
            closing: None,
            closed: false,
        };
        Ok(Feeder {
            context,
            guid,
            shared: Arc::new(FeederShared {
                state: Mutex::new(state),
                changed: Condvar::new(),
                stop: AtomicBool::new(false),
                feedback: sender,
            }),
            feedback: receiver,
            worker: Mutex::new(None),
        })
    }

    /// Identity presented when pushing
    pub fn guid(&self) -> &str {
        &self.guid
    }

    fn connector(state: &FeederState) -> Arc<dyn Connector> {
        state
            .config
            .connector
            .clone()
            .unwrap_or_else(|| Arc::new(UdpConnector))
    }

    /// Wait for receivers on `port`
    pub fn listen(&self, port: u16) -> Result<(), ErrorCode> {
        self.context.check()?;
        let mut state = self.shared.state.lock();
        if state.mode.is_some() {
            return Err(ErrorCode::AlreadyConnected);
        }
        let link = Self::connector(&state)
            .bind(Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)))
            .map_err(link_error)?;
        tracing::info!("feeder for {:?} listening on {}", state.config.channel, link.local_addr());
        state.link = Some(link);
        state.mode = Some(FeederMode::Listener);
        drop(state);
        self.spawn_worker()
    }

    /// Push to an accepting session and wait for its answer
    pub fn connect(&self, target: impl Into<ConnectTarget>) -> Result<(), ErrorCode> {
        self.context.check()?;
        let endpoint = target.into().endpoint()?;
        let mut state = self.shared.state.lock();
        if state.mode.is_some() {
            return Err(ErrorCode::AlreadyConnected);
        }
        let connector = Self::connector(&state);
        let peer_addr = connector
            .resolve(&endpoint.host, endpoint.port)
            .map_err(link_error)?;
        state.link = Some(connector.bind(None).map_err(link_error)?);

        let config = &state.config;
        let request = ConnectRequest {
            version: PROTOCOL_VERSION,
            role: Role::Push,
            guid: self.guid.clone(),
            session_token: endpoint.session.clone().unwrap_or_else(|| config.password.clone()),
            channel: config.channel.clone(),
            latency_ms: config.latency.as_millis().min(u32::MAX as u128) as u32,
            low_latency: false,
            fec: config.fec_params(),
            stream: Some(config.stream_info.clone()),
        };
        let timeout = config.connect_timeout;
        let mut connection = Connection::new(config.reconnect);
        let now = Instant::now();
        let actions = connection.begin(timeout, now)?;
        state.mode = Some(FeederMode::Pusher {
            request,
            connection,
            peer_addr,
            session_id: new_session_id(),
        });
        apply_push_actions(&mut state, actions, now);
        tracing::info!("feeder pushing {:?} to {}", state.config.channel, peer_addr);
        drop(state);
        self.spawn_worker()?;

        let deadline = Instant::now() + timeout + Duration::from_millis(200);
        let mut state = self.shared.state.lock();
        loop {
            if let Some(FeederMode::Pusher { connection, .. }) = &state.mode {
                match connection.state() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => {
                        return Err(connection.last_error().unwrap_or(ErrorCode::NotConnected))
                    }
                    _ => {}
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorCode::Timeout);
            }
            self.shared.changed.wait_for(&mut state, deadline - now);
        }
    }

    fn spawn_worker(&self) -> Result<(), ErrorCode> {
        self.shared.stop.store(false, Ordering::Release);
        let worker = FeederWorker {
            shared: Arc::clone(&self.shared),
            buf: vec![0u8; 2048],
            keepalive: Timer::new(KEEPALIVE_INTERVAL, Instant::now()),
        };
        let handle = self
            .context
            .spawn(format!("ingest-feeder-{}", self.guid), move || worker.run())?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Packetize and send one frame
    pub fn send_frame(&self, data: &[u8]) -> Result<(), ErrorCode> {
        self.context.check()?;
        if data.is_empty() {
            return Err(ErrorCode::InvalidParameter);
        }
        let now = Instant::now();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.closing.is_some() || state.closed {
            return Err(ErrorCode::NotConnected);
        }
        let (to, _) = state.active_peer(now).ok_or(ErrorCode::NotConnected)?;
        if let Some(limiter) = state.limiter.as_mut() {
            if !limiter.consume(data.len(), now) {
                state.stats.frames_rejected += 1;
                return Err(ErrorCode::NotReady);
            }
        }

        let timestamp = state.clock.timestamp(now);
        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            let packet = state
                .send_buffer
                .push(Bytes::copy_from_slice(chunk), timestamp, now);
            state.transmit_data(packet, to, now);
        }
        Ok(())
    }

    /// Send the end of stream, wait briefly for it to be acknowledged and
    /// shut the connection down
    pub fn close(&self) -> Result<(), ErrorCode> {
        self.context.check()?;
        let now = Instant::now();
        {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if state.closed || state.closing.is_some() {
                return Ok(());
            }
            if let Some((to, _)) = state.active_peer(now) {
                let timestamp = state.clock.timestamp(now);
                let eos = state.send_buffer.push_end_of_stream(timestamp, now);
                state.transmit_data(eos, to, now);
                let parity = state.fec.as_mut().map(FecEncoder::flush).unwrap_or_default();
                state.transmit_parity(parity, to, now);
                state.closing = Some(now + CLOSE_LINGER.max(state.config.latency));
            } else {
                self.shared.stop.store(true, Ordering::Release);
            }
        }

        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("feeder worker panicked");
            }
        }
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.closing = None;
        tracing::info!("feeder closed after {} packets", state.stats.packets_sent);
        Ok(())
    }

    pub fn status(&self) -> Result<ConnectionState, ErrorCode> {
        self.context.check()?;
        Ok(self.shared.state.lock().connection_state(Instant::now()))
    }

    /// Bitrate the encoder should produce
    ///
    /// The encoder controller's target when feedback is enabled, otherwise
    /// the variant last requested by the receiver, otherwise `max_bitrate`.
    pub fn current_bitrate(&self) -> u32 {
        let state = self.shared.state.lock();
        match (&state.encoder, state.requested_bitrate) {
            (Some(encoder), _) => encoder.current_bitrate(),
            (None, Some(requested)) => requested,
            (None, None) => state.config.max_bitrate,
        }
    }

    /// Encoder feedback produced from receiver reports
    pub fn encoder_feedback(&self) -> Receiver<EncoderFeedback> {
        self.feedback.clone()
    }

    pub fn take_stream_command(&self) -> Option<StreamCommand> {
        self.shared.state.lock().commands.pop_front()
    }

    pub fn query_statistics(&self) -> Result<FeederStats, ErrorCode> {
        self.context.check()?;
        let state = self.shared.state.lock();
        Ok(FeederStats {
            retransmitted: state.send_buffer.retransmitted(),
            rtt_ms: state.rtt.srtt() / 1000,
            ..state.stats
        })
    }
}

impl Drop for Feeder {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }
    }
}

fn apply_push_actions(state: &mut FeederState, actions: Vec<ConnectionAction>, now: Instant) {
    for action in actions {
        let Some(FeederMode::Pusher {
            request,
            peer_addr,
            session_id,
            ..
        }) = &mut state.mode
        else {
            return;
        };
        match action {
            ConnectionAction::SendHandshake => {
                let handshake = ControlPacket::new(ControlType::Handshake, *session_id, request.to_bytes());
                let to = *peer_addr;
                state.send_control(handshake, to, now);
            }
            ConnectionAction::StateChanged { state: next, error } => {
                if next == ConnectionState::Reconnecting {
                    *session_id = new_session_id();
                }
                match error {
                    Some(code) => tracing::warn!("push connection {:?}: {}", next, code),
                    None => tracing::info!("push connection {:?}", next),
                }
            }
        }
    }
}

struct FeederWorker {
    shared: Arc<FeederShared>,
    buf: Vec<u8>,
    keepalive: Timer,
}

impl FeederWorker {
    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        loop {
            let now = Instant::now();
            let finished = {
                let mut guard = shared.state.lock();
                let state = &mut *guard;
                self.receive(state, now);
                self.tick(state, now)
            };
            shared.changed.notify_all();
            if finished || shared.stop.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(TICK);
        }
        tracing::debug!("feeder worker stopped");
    }

    /// Returns true once the worker has nothing left to do
    fn tick(&mut self, state: &mut FeederState, now: Instant) -> bool {
        if let Some(FeederMode::Pusher { connection, .. }) = &mut state.mode {
            let actions = connection.tick(now);
            apply_push_actions(state, actions, now);
            if let Some(FeederMode::Pusher { connection, .. }) = &state.mode {
                if connection.state() == ConnectionState::Disconnected {
                    return true;
                }
            }
        }

        let Some((to, session_id)) = state.active_peer(now) else {
            return state.closing.is_some_and(|deadline| now >= deadline);
        };

        if let Some(fec) = state.fec.as_mut() {
            let parity = fec.poll(now);
            state.transmit_parity(parity, to, now);
        }
        state.send_buffer.drop_expired(now);

        if let Some(deadline) = state.closing {
            if state.send_buffer.is_empty() || now >= deadline {
                let bye = ControlPacket::new(ControlType::Shutdown, session_id, Default::default());
                state.send_control(bye, to, now);
                return true;
            }
        }

        if now.saturating_duration_since(state.last_sent) >= KEEPALIVE_INTERVAL
            && self.keepalive.try_fire(now)
        {
            let keepalive = ControlPacket::new(ControlType::KeepAlive, session_id, Default::default());
            state.send_control(keepalive, to, now);
        }
        false
    }

    fn receive(&mut self, state: &mut FeederState, now: Instant) {
        for _ in 0..MAX_DATAGRAMS_PER_TICK {
            let received = match &state.link {
                Some(link) => link.recv_from(&mut self.buf),
                None => return,
            };
            let (len, from) = match received {
                Ok(Some(received)) => received,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("receive failed: {}", e);
                    return;
                }
            };
            let control = match Packet::from_bytes(&self.buf[..len]) {
                Ok(Packet::Control(control)) => control,
                Ok(Packet::Data(_)) => continue,
                Err(e) => {
                    tracing::trace!("malformed datagram from {}: {}", from, e);
                    continue;
                }
            };

            if control.control_type == ControlType::Handshake {
                match state.mode {
                    Some(FeederMode::Listener) => self.on_request(state, control, from, now),
                    Some(FeederMode::Pusher { .. }) => self.on_response(state, control, from, now),
                    None => {}
                }
                continue;
            }

            let known = state
                .peer
                .as_ref()
                .is_some_and(|peer| peer.addr == from && peer.session_id == control.session_id);
            let pending_reject = matches!(
                &state.mode,
                Some(FeederMode::Pusher { peer_addr, session_id, .. })
                    if *peer_addr == from && *session_id == control.session_id
            );
            if known {
                self.on_control(state, control, from, now);
            } else if pending_reject && control.control_type == ControlType::Reject {
                let code = ErrorCode::from_code(control.additional_info).unwrap_or(ErrorCode::Failed);
                on_push_rejected(state, code, now);
            }
        }
    }

    /// Listener: a session asking for the stream
    fn on_request(&mut self, state: &mut FeederState, control: ControlPacket, from: SocketAddr, now: Instant) {
        let request = match ConnectRequest::from_bytes(&control.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("bad connect request from {}: {}", from, e);
                return;
            }
        };
        if let Err(code) = admit(state, &request, now) {
            tracing::warn!("rejecting {} from {}: {}", request.guid, from, code);
            let reject = ControlPacket::new(ControlType::Reject, control.session_id, Default::default())
                .with_info(0, code.code());
            state.send_control(reject, from, now);
            return;
        }

        let retry = state
            .peer
            .as_ref()
            .is_some_and(|peer| peer.addr == from && peer.session_id == control.session_id);
        let params = if retry {
            tracing::debug!("repeated handshake from {}", from);
            if let Some(peer) = state.peer.as_mut() {
                peer.last_heard = now;
            }
            negotiated(state, &request.fec)
        } else {
            tracing::info!("receiver {} connected from {}", request.guid, from);
            state.peer = Some(Peer {
                addr: from,
                guid: request.guid.clone(),
                session_id: control.session_id,
                last_heard: now,
            });
            state.start_connection(control.session_id, &request.fec, now)
        };

        let response = ConnectResponse {
            version: PROTOCOL_VERSION,
            stream: state.config.stream_info.clone(),
            fec: params,
        };
        let handshake = ControlPacket::new(ControlType::Handshake, control.session_id, response.to_bytes());
        state.send_control(handshake, from, now);
    }

    /// Pusher: the accepting session answered
    fn on_response(&mut self, state: &mut FeederState, control: ControlPacket, from: SocketAddr, now: Instant) {
        let Some(FeederMode::Pusher { peer_addr, session_id, .. }) = &state.mode else {
            return;
        };
        if *peer_addr != from || *session_id != control.session_id {
            return;
        }
        let session_id = *session_id;
        let response = match ConnectResponse::from_bytes(&control.body) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("bad connect response from {}: {}", from, e);
                return;
            }
        };
        if !response.version.is_compatible(&PROTOCOL_VERSION) {
            on_push_rejected(state, ErrorCode::VersionMismatch, now);
            return;
        }

        let fresh = state.peer.as_ref().map_or(true, |peer| peer.session_id != session_id);
        let Some(FeederMode::Pusher { connection, .. }) = &mut state.mode else {
            return;
        };
        connection.on_packet(now);
        let actions = connection.on_accepted(now);
        if fresh {
            state.peer = Some(Peer {
                addr: from,
                guid: String::new(),
                session_id,
                last_heard: now,
            });
            state.start_connection(session_id, &response.fec, now);
        }
        apply_push_actions(state, actions, now);
    }

    fn on_control(&mut self, state: &mut FeederState, control: ControlPacket, from: SocketAddr, now: Instant) {
        if let Some(peer) = state.peer.as_mut() {
            peer.last_heard = now;
        }
        if let Some(FeederMode::Pusher { connection, .. }) = &mut state.mode {
            connection.on_packet(now);
        }

        match control.control_type {
            ControlType::KeepAlive => {}
            ControlType::Ack => {
                let info = match AckInfo::from_bytes(&control.body) {
                    Ok(info) => info,
                    Err(e) => {
                        tracing::debug!("bad ack: {}", e);
                        return;
                    }
                };
                state.send_buffer.acknowledge_up_to(info.ack_seq);
                let reply = ControlPacket::new(ControlType::AckAck, control.session_id, Default::default())
                    .with_info(control.type_info, 0);
                state.send_control(reply, from, now);
                if info.rtt_us > 0 {
                    state.rtt.update(info.rtt_us);
                }
                self.encoder_feedback(state, &info, now);
            }
            ControlType::Nak => {
                let nak = match NakInfo::from_bytes(&control.body) {
                    Ok(nak) => nak,
                    Err(e) => {
                        tracing::debug!("bad nak: {}", e);
                        return;
                    }
                };
                state.stats.naks_received += 1;
                for range in &nak.loss_ranges {
                    for seq in range.iter() {
                        match state.send_buffer.get_for_resend(seq, now) {
                            Ok(packet) => state.send(&Packet::Data(packet), from, now),
                            Err(e) => tracing::trace!("cannot resend: {}", e),
                        }
                    }
                }
            }
            ControlType::FecUpdate => {
                let overhead = control.type_info.min(100) as u8;
                if let Some(fec) = state.fec.as_mut() {
                    tracing::info!("receiver asks for {}% FEC overhead", overhead);
                    fec.set_overhead(overhead);
                    state.stats.fec_overhead = overhead;
                }
            }
            ControlType::BitrateSwitch => {
                tracing::info!("receiver asks for {} bps", control.additional_info);
                state.requested_bitrate = Some(control.additional_info);
            }
            ControlType::StreamControl => {
                let command = match control.type_info {
                    STREAM_PAUSE => StreamCommand::Pause,
                    STREAM_RESUME => StreamCommand::Resume,
                    STREAM_SEEK => StreamCommand::Seek(control.additional_info.min(100) as u8),
                    other => {
                        tracing::debug!("unknown stream control {}", other);
                        return;
                    }
                };
                state.commands.push_back(command);
            }
            ControlType::Shutdown => {
                tracing::info!("receiver {} left", from);
                match &mut state.mode {
                    Some(FeederMode::Pusher { connection, .. }) => {
                        let actions = connection.on_peer_shutdown();
                        apply_push_actions(state, actions, now);
                    }
                    _ => state.peer = None,
                }
            }
            other => tracing::trace!("ignoring {:?}", other),
        }
    }

    fn encoder_feedback(&self, state: &mut FeederState, info: &AckInfo, now: Instant) {
        let Some(encoder) = state.encoder.as_mut() else {
            return;
        };
        let sample = NetworkSample {
            loss_rate: info.loss_rate(),
            residual_loss: info.residual_permille as f64 / 1000.0,
            rtt: Duration::from_micros(info.rtt_us as u64),
            recovery_latency: Duration::ZERO,
            throughput_bps: info.receive_rate_bps as u64,
        };
        if let Some(feedback) = encoder.observe(&sample, now) {
            tracing::debug!("encoder target {} bps", feedback.bitrate);
            if self.shared.feedback.try_send(feedback).is_err() {
                tracing::debug!("encoder feedback queue full");
            }
        }
    }
}

/// Admission checks for a pulling session
fn admit(state: &FeederState, request: &ConnectRequest, now: Instant) -> Result<(), ErrorCode> {
    if !request.version.is_compatible(&PROTOCOL_VERSION) {
        return Err(ErrorCode::VersionMismatch);
    }
    if request.role != Role::Pull {
        return Err(ErrorCode::NotSupported);
    }
    let config = &state.config;
    if !config.password.is_empty() && request.session_token != config.password {
        return Err(ErrorCode::AuthorizationFailed);
    }
    if request.channel != config.channel {
        return Err(ErrorCode::AuthorizationFailed);
    }
    match (&state.peer, state.active_peer(now)) {
        (Some(peer), Some(_)) if peer.guid != request.guid => Err(ErrorCode::ServerFull),
        _ => Ok(()),
    }
}

/// Parameters in effect for the current connection, echoed on handshake retries
fn negotiated(state: &FeederState, receiver: &FecParams) -> FecParams {
    match &state.fec {
        Some(fec) => FecParams {
            overhead: fec.overhead(),
            ..*receiver
        },
        None => FecParams {
            mode: 0,
            ..*receiver
        },
    }
}

fn on_push_rejected(state: &mut FeederState, code: ErrorCode, now: Instant) {
    tracing::warn!("push rejected: {}", code);
    let Some(FeederMode::Pusher { connection, .. }) = &mut state.mode else {
        return;
    };
    let actions = connection.on_rejected(code);
    apply_push_actions(state, actions, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextConfig};

    fn config() -> FeederConfig {
        FeederConfig {
            channel: "live".to_string(),
            ..FeederConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        let context = Context::init(ContextConfig::default()).unwrap();
        let missing_channel = FeederConfig::default();
        assert!(matches!(
            context.open_feeder(missing_channel),
            Err(ErrorCode::InvalidParameter)
        ));

        let unbounded = FeederConfig {
            enforce_bitrate: true,
            ..config()
        };
        assert!(matches!(context.open_feeder(unbounded), Err(ErrorCode::InvalidParameter)));
    }

    #[test]
    fn test_send_without_receiver() {
        let context = Context::init(ContextConfig::default()).unwrap();
        let feeder = context.open_feeder(config()).unwrap();
        assert_eq!(feeder.send_frame(b"frame"), Err(ErrorCode::NotConnected));
        assert_eq!(feeder.send_frame(b""), Err(ErrorCode::InvalidParameter));
        assert_eq!(feeder.status(), Ok(ConnectionState::Disconnected));
        assert_eq!(feeder.current_bitrate(), 0);
    }

    #[test]
    fn test_negotiated_overhead() {
        let context = Context::init(ContextConfig::default()).unwrap();
        let feeder = context
            .open_feeder(FeederConfig {
                fec_overhead: 40,
                ..config()
            })
            .unwrap();
        let mut state = feeder.shared.state.lock();
        let receiver = FecParams {
            mode: 1,
            overhead: 20,
            ..FecParams::default()
        };
        let params = state.start_connection(7, &receiver, Instant::now());
        assert_eq!(params.overhead, 40);
        assert!(state.fec.is_some());

        let off = FecParams::default();
        let params = state.start_connection(8, &off, Instant::now());
        assert!(!params.fec_enabled());
        assert!(state.fec.is_none());
    }
}
