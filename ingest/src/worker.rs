//! Session worker
//!
//! Runs the receive side of one connection on its own thread: drains the
//! link, feeds the recovery pipeline, answers with ACK/NAK, samples the
//! network for the adaptive controllers and drives the connection state
//! machine. Every tick takes the session lock once and sends the queued
//! control packets after releasing it.

use crate::session::{publish, SessionRole, SessionShared, SessionState};
use ingest_io::{Link, MediaClock, Timer};
use ingest_protocol::handshake::PROTOCOL_VERSION;
use ingest_protocol::{
    AckInfo, ConnectRequest, ConnectResponse, ConnectionState, ControlPacket, ControlType,
    DataPacket, ErrorCode, NakInfo, NetworkSample, Packet, Role, SessionEvent,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(1);
const ACK_INTERVAL: Duration = Duration::from_millis(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(200);
const MAX_DATAGRAMS_PER_TICK: usize = 512;
/// ACKs remembered while waiting for their AckAck
const ACK_HISTORY: usize = 64;
const RECV_BUFFER_SIZE: usize = 2048;

pub(crate) struct SessionWorker {
    shared: Arc<SessionShared>,
    link: Box<dyn Link>,
    clock: MediaClock,
    ack_timer: Timer,
    keepalive_timer: Timer,
    sample_timer: Timer,
    ack_number: u16,
    acks_in_flight: VecDeque<(u16, Instant)>,
    buf: Vec<u8>,
}

impl SessionWorker {
    pub(crate) fn new(shared: Arc<SessionShared>, link: Box<dyn Link>, now: Instant) -> Self {
        let sample_interval = shared.state.lock().sample_interval();
        SessionWorker {
            shared,
            link,
            clock: MediaClock::new(now),
            ack_timer: Timer::new(ACK_INTERVAL, now),
            keepalive_timer: Timer::new(KEEPALIVE_INTERVAL, now),
            sample_timer: Timer::new(sample_interval, now),
            ack_number: 0,
            acks_in_flight: VecDeque::new(),
            buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("session worker started on {}", self.link.local_addr());
        let shared = Arc::clone(&self.shared);
        loop {
            let now = Instant::now();
            let (outbox, peer, finished) = {
                let mut state = shared.state.lock();
                self.receive(&mut state, now);
                self.tick(&mut state, now);
                let finished = !state.connection.state().is_attached();
                (std::mem::take(&mut state.outbox), state.peer, finished)
            };
            shared.changed.notify_all();

            if let Some(peer) = peer {
                for packet in outbox {
                    self.send(packet, peer, now);
                }
            }
            if finished || shared.stop.load(Ordering::Acquire) {
                break;
            }
            std::thread::sleep(TICK);
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        if self.shared.stop.load(Ordering::Acquire) {
            if let Some(peer) = state.peer {
                let bye = ControlPacket::new(ControlType::Shutdown, state.session_id, Default::default());
                self.send(bye, peer, now);
            }
        }
        state.pipeline.flush(now);
        drop(state);
        self.shared.changed.notify_all();
        tracing::debug!("session worker stopped");
    }

    fn send(&self, packet: ControlPacket, peer: SocketAddr, now: Instant) {
        let packet = packet.with_timestamp(self.clock.timestamp(now));
        match self.link.send_to(&packet.to_bytes(), peer) {
            Ok(true) => {}
            Ok(false) => tracing::trace!("send queue full, {:?} dropped", packet.control_type),
            Err(e) => tracing::warn!("send to {} failed: {}", peer, e),
        }
    }

    fn receive(&mut self, state: &mut SessionState, now: Instant) {
        for _ in 0..MAX_DATAGRAMS_PER_TICK {
            let (len, from) = match self.link.recv_from(&mut self.buf) {
                Ok(Some(received)) => received,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("receive failed: {}", e);
                    break;
                }
            };
            let packet = match Packet::from_bytes(&self.buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::trace!("malformed datagram from {}: {}", from, e);
                    continue;
                }
            };

            match packet {
                Packet::Control(control) if control.control_type == ControlType::Handshake => {
                    self.on_handshake(state, control, from, now);
                }
                packet if state.peer != Some(from) || packet.session_id() != state.session_id => {
                    tracing::trace!("stray packet from {}", from);
                }
                Packet::Data(data) => self.on_data(state, data, now),
                Packet::Control(control) => self.on_control(state, control, now),
            }
        }
    }

    fn on_data(&mut self, state: &mut SessionState, data: DataPacket, now: Instant) {
        state.connection.on_packet(now);
        if state.connection.is_connected() {
            state.pipeline.on_packet(data, now);
        }
    }

    fn on_control(&mut self, state: &mut SessionState, control: ControlPacket, now: Instant) {
        state.connection.on_packet(now);
        let events = &self.shared.events;
        match control.control_type {
            ControlType::KeepAlive => {}
            ControlType::AckAck => {
                let echoed = control.type_info;
                if let Some(pos) = self.acks_in_flight.iter().position(|(n, _)| *n == echoed) {
                    let (_, sent) = self.acks_in_flight.remove(pos).unwrap_or((echoed, now));
                    let sample = now.saturating_duration_since(sent).as_micros() as u32;
                    state.rtt.update(sample);
                    let srtt = state.rtt.srtt_duration();
                    state.pipeline.set_rtt(srtt);
                }
            }
            ControlType::Shutdown => {
                tracing::info!("peer closed the connection");
                let actions = state.connection.on_peer_shutdown();
                state.pipeline.flush(now);
                state.apply(actions, events);
            }
            ControlType::Reject => {
                let code = ErrorCode::from_code(control.additional_info).unwrap_or(ErrorCode::Failed);
                tracing::warn!("peer rejected the connection: {}", code);
                let actions = state.connection.on_rejected(code);
                state.apply(actions, events);
            }
            other => tracing::trace!("ignoring {:?}", other),
        }
    }

    fn on_handshake(
        &mut self,
        state: &mut SessionState,
        control: ControlPacket,
        from: SocketAddr,
        now: Instant,
    ) {
        if state.is_caller() {
            self.on_response(state, control, from, now);
        } else {
            self.on_request(state, control, from, now);
        }
    }

    /// Caller side: answer to our handshake
    fn on_response(
        &mut self,
        state: &mut SessionState,
        control: ControlPacket,
        from: SocketAddr,
        now: Instant,
    ) {
        if state.peer != Some(from) || control.session_id != state.session_id {
            return;
        }
        let attempt = state.connection.state();
        if !matches!(attempt, ConnectionState::Connecting | ConnectionState::Reconnecting) {
            state.connection.on_packet(now);
            return;
        }
        let response = match ConnectResponse::from_bytes(&control.body) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("bad connect response from {}: {}", from, e);
                return;
            }
        };

        let events = &self.shared.events;
        if !response.version.is_compatible(&PROTOCOL_VERSION) {
            tracing::warn!(
                "peer speaks version {}.{}",
                response.version.major,
                response.version.minor
            );
            let actions = state.connection.on_rejected(ErrorCode::VersionMismatch);
            state.apply(actions, events);
            return;
        }

        if attempt == ConnectionState::Reconnecting {
            state.pipeline.resync();
        }
        if state.fec_tuner.is_none() {
            state.fec_overhead = if response.fec.fec_enabled() {
                response.fec.overhead
            } else {
                0
            };
        }
        state.adopt_stream(response.stream, events);
        let actions = state.connection.on_accepted(now);
        state.apply(actions, events);
        self.restart_timers(now);
    }

    /// Listener side: a feeder pushing to us
    fn on_request(
        &mut self,
        state: &mut SessionState,
        control: ControlPacket,
        from: SocketAddr,
        now: Instant,
    ) {
        let request = match ConnectRequest::from_bytes(&control.body) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("bad connect request from {}: {}", from, e);
                return;
            }
        };
        if let Err(code) = validate_request(state, &request) {
            tracing::warn!("rejecting {} ({}): {}", from, request.guid, code);
            let reject = ControlPacket::new(ControlType::Reject, control.session_id, Default::default())
                .with_info(0, code.code());
            self.send(reject, from, now);
            return;
        }

        let same_connection = state.peer == Some(from)
            && state.session_id == control.session_id
            && state.connection.is_connected();
        let shared = Arc::clone(&self.shared);
        let events = &shared.events;
        if !same_connection {
            if state.peer_guid.is_some() {
                state.pipeline.resync();
            }
            tracing::info!("feeder {} connected from {}", request.guid, from);
            state.peer = Some(from);
            state.session_id = control.session_id;
            state.peer_guid = Some(request.guid.clone());
            if let Some(stream) = request.stream {
                state.adopt_stream(stream, events);
            }
            if state.fec_tuner.is_none() && request.fec.fec_enabled() {
                state.fec_overhead = state.fec_overhead.max(request.fec.overhead);
            }
            self.restart_timers(now);
        }

        let response = ConnectResponse {
            version: PROTOCOL_VERSION,
            stream: state.stream.clone().unwrap_or_default(),
            fec: state.error_correction().fec_params(),
        };
        state.outbox.push(ControlPacket::new(
            ControlType::Handshake,
            state.session_id,
            response.to_bytes(),
        ));
        state.connection.on_packet(now);
        let actions = state.connection.on_accepted(now);
        state.apply(actions, events);
    }

    fn restart_timers(&mut self, now: Instant) {
        self.ack_timer.reset(now);
        self.keepalive_timer.reset(now);
        self.sample_timer.reset(now);
        self.acks_in_flight.clear();
    }

    fn tick(&mut self, state: &mut SessionState, now: Instant) {
        let actions = state.connection.tick(now);
        state.apply(actions, &self.shared.events);

        let connection = state.connection.state();
        if !matches!(connection, ConnectionState::Connected | ConnectionState::Reconnecting) {
            return;
        }
        let naks = state.pipeline.poll(now);
        if connection != ConnectionState::Connected {
            return;
        }

        if !naks.is_empty() {
            let body = NakInfo::new(naks).to_bytes();
            state
                .outbox
                .push(ControlPacket::new(ControlType::Nak, state.session_id, body));
        }
        if self.ack_timer.try_fire(now) {
            self.queue_ack(state, now);
        }
        if self.keepalive_timer.try_fire(now) {
            state.outbox.push(ControlPacket::new(
                ControlType::KeepAlive,
                state.session_id,
                Default::default(),
            ));
        }
        if self.sample_timer.try_fire(now) {
            self.sample(state);
        }
    }

    fn queue_ack(&mut self, state: &mut SessionState, now: Instant) {
        let Some(ack_seq) = state.pipeline.ack_point() else {
            return;
        };
        self.ack_number = self.ack_number.wrapping_add(1);
        let sample = &state.last_sample;
        let info = AckInfo {
            ack_seq,
            rtt_us: state.rtt.srtt(),
            rtt_var_us: state.rtt.rtt_var(),
            receive_rate_bps: sample.throughput_bps.min(u32::MAX as u64) as u32,
            loss_permille: permille(sample.loss_rate),
            residual_permille: permille(sample.residual_loss),
        };
        state.outbox.push(
            ControlPacket::new(ControlType::Ack, state.session_id, info.to_bytes())
                .with_info(self.ack_number, 0),
        );

        self.acks_in_flight.push_back((self.ack_number, now));
        if self.acks_in_flight.len() > ACK_HISTORY {
            self.acks_in_flight.pop_front();
        }
    }

    /// One adaptive sampling interval elapsed
    fn sample(&mut self, state: &mut SessionState) {
        let interval = state.pipeline.take_interval();
        let elapsed = self.sample_timer.interval().as_secs_f64();
        let expected = (interval.received + interval.lost).max(1) as f64;
        let sample = NetworkSample {
            loss_rate: interval.lost as f64 / expected,
            residual_loss: interval.not_recovered as f64 / expected,
            rtt: state.rtt.srtt_duration(),
            recovery_latency: interval.max_delay,
            throughput_bps: (interval.bytes_delivered as f64 * 8.0 / elapsed) as u64,
        };
        state.last_sample = sample;

        if let Some(bitrate) = state.bitrate.observe(&sample) {
            state.request_bitrate(bitrate);
            publish(&self.shared.events, SessionEvent::BitrateChanged(bitrate));
        }
        if let Some(tuner) = state.fec_tuner.as_mut() {
            if let Some(overhead) = tuner.update(sample.loss_rate) {
                tracing::info!("requesting {}% FEC overhead", overhead);
                state.fec_overhead = overhead;
                state.outbox.push(
                    ControlPacket::new(ControlType::FecUpdate, state.session_id, Default::default())
                        .with_info(overhead as u16, 0),
                );
            }
        }
    }
}

/// Admission checks for a pushing feeder
fn validate_request(state: &SessionState, request: &ConnectRequest) -> Result<(), ErrorCode> {
    if !request.version.is_compatible(&PROTOCOL_VERSION) {
        return Err(ErrorCode::VersionMismatch);
    }
    if request.role != Role::Push {
        return Err(ErrorCode::NotSupported);
    }
    if let Some(SessionRole::Listener { session_token }) = &state.role {
        if !session_token.is_empty() && *session_token != request.session_token {
            return Err(ErrorCode::AuthorizationFailed);
        }
    }
    match &state.peer_guid {
        Some(guid) if *guid != request.guid && state.connection.is_connected() => {
            Err(ErrorCode::ServerFull)
        }
        _ => Ok(()),
    }
}

fn permille(rate: f64) -> u16 {
    (rate * 1000.0).round().clamp(0.0, 1000.0) as u16
}
