//! Receiving session
//!
//! A [`Session`] pulls one stream from a source (caller mode) or waits for a
//! feeder to push one (listen mode). All protocol work happens on a
//! background worker; the public methods only touch the shared state under
//! its lock, so `read` never blocks on the network.

use crate::context::ContextRef;
use crate::handle::{link_error, MediaHandle};
use crate::url::ConnectTarget;
use crate::worker::SessionWorker;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use ingest_io::{Connector, UdpConnector};
use ingest_protocol::handshake::PROTOCOL_VERSION;
use ingest_protocol::stats::DEFAULT_STATS_INTERVAL;
use ingest_protocol::{
    AdaptiveConfig, BitrateController, ConnectRequest, Connection, ConnectionAction,
    ConnectionState, ControlPacket, ControlType, Delivery, ErrorCode, ErrorCorrectionConfig,
    FecMode, FecTuner, NetworkSample, ReadOutcome, ReceivePipeline, ReconnectPolicy, Role,
    RttEstimator, SessionEvent, StatsAggregator, StatsSnapshot, StreamInfo,
};
use parking_lot::{Condvar, Mutex};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Extra time a blocking connect waits past the worker's own timeout
const WAIT_SLACK: Duration = Duration::from_millis(200);

/// Stream control operations carried in the `type_info` word
pub(crate) const STREAM_PAUSE: u16 = 0;
pub(crate) const STREAM_RESUME: u16 = 1;
pub(crate) const STREAM_SEEK: u16 = 2;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub low_latency: bool,
    /// Local address to bind, any when `None`
    pub local_addr: Option<SocketAddr>,
    /// Give up the initial connect (or the wait for a feeder) after this long
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            low_latency: false,
            local_addr: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct Settings {
    guid: String,
    session_token: String,
    error_correction: ErrorCorrectionConfig,
    adaptive: AdaptiveConfig,
    reconnect: ReconnectPolicy,
    connector: Option<Arc<dyn Connector>>,
    stats_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            guid: String::new(),
            session_token: String::new(),
            error_correction: ErrorCorrectionConfig::default(),
            adaptive: AdaptiveConfig::default(),
            reconnect: ReconnectPolicy::default(),
            connector: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }
}

/// How the current connection was opened
pub(crate) enum SessionRole {
    Caller { request: ConnectRequest },
    Listener { session_token: String },
}

pub(crate) struct SessionState {
    settings: Settings,
    pub(crate) connection: Connection,
    pub(crate) pipeline: ReceivePipeline,
    pub(crate) role: Option<SessionRole>,
    /// Connection id stamped on every packet of the current connection
    pub(crate) session_id: u32,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) peer_guid: Option<String>,
    pub(crate) stream: Option<StreamInfo>,
    pub(crate) bitrate: BitrateController,
    pub(crate) rtt: RttEstimator,
    stats: StatsAggregator,
    pub(crate) fec_tuner: Option<FecTuner>,
    pub(crate) fec_overhead: u8,
    pub(crate) last_sample: NetworkSample,
    /// Control packets for the worker to send to the peer
    pub(crate) outbox: Vec<ControlPacket>,
}

impl SessionState {
    fn new(now: Instant) -> Self {
        let settings = Settings::default();
        SessionState {
            connection: Connection::new(settings.reconnect),
            pipeline: ReceivePipeline::new(&settings.error_correction),
            role: None,
            session_id: 0,
            peer: None,
            peer_guid: None,
            stream: None,
            bitrate: BitrateController::new(settings.adaptive.clone(), &[]),
            rtt: RttEstimator::new(),
            stats: StatsAggregator::new(settings.stats_interval, now),
            fec_tuner: None,
            fec_overhead: 0,
            last_sample: NetworkSample::default(),
            outbox: Vec::new(),
            settings,
        }
    }

    /// Fresh connection lifetime: counters and buffers start over
    fn reset(&mut self, role: SessionRole, peer: Option<SocketAddr>, now: Instant) {
        let ec = &self.settings.error_correction;
        self.connection = Connection::new(self.settings.reconnect);
        self.pipeline = ReceivePipeline::new(ec);
        self.fec_tuner = (ec.fec_mode == FecMode::Adaptive).then(|| FecTuner::new(ec.fec_overhead));
        self.fec_overhead = match ec.fec_mode {
            FecMode::Off => 0,
            _ => ec.fec_overhead,
        };
        self.role = Some(role);
        self.session_id = new_session_id();
        self.peer = peer;
        self.peer_guid = None;
        self.stream = None;
        self.bitrate = BitrateController::new(self.settings.adaptive.clone(), &[]);
        self.rtt = RttEstimator::new();
        self.stats.set_interval(self.settings.stats_interval);
        self.stats.reset(now);
        self.last_sample = NetworkSample::default();
        self.outbox.clear();
    }

    pub(crate) fn sample_interval(&self) -> Duration {
        self.settings.adaptive.sample_interval
    }

    pub(crate) fn error_correction(&self) -> &ErrorCorrectionConfig {
        &self.settings.error_correction
    }

    pub(crate) fn is_caller(&self) -> bool {
        matches!(self.role, Some(SessionRole::Caller { .. }))
    }

    /// Carry out what the connection state machine asked for
    pub(crate) fn apply(&mut self, actions: Vec<ConnectionAction>, events: &Sender<SessionEvent>) {
        for action in actions {
            match action {
                ConnectionAction::SendHandshake => {
                    if let Some(SessionRole::Caller { request }) = &self.role {
                        self.outbox.push(ControlPacket::new(
                            ControlType::Handshake,
                            self.session_id,
                            request.to_bytes(),
                        ));
                    }
                }
                ConnectionAction::StateChanged { state, error } => {
                    if state == ConnectionState::Reconnecting && self.is_caller() {
                        self.session_id = new_session_id();
                    }
                    publish(events, SessionEvent::Status { state, error });
                }
            }
        }
    }

    /// Take over the stream description announced by the peer
    pub(crate) fn adopt_stream(&mut self, stream: StreamInfo, events: &Sender<SessionEvent>) {
        if self.stream.as_ref() == Some(&stream) {
            return;
        }
        tracing::info!(
            "stream {:?}: live={} variants={:?}",
            stream.channel,
            stream.live,
            stream.bitrates
        );
        self.bitrate = BitrateController::new(self.settings.adaptive.clone(), &stream.bitrates);
        if let Some(bitrate) = self.bitrate.current_bitrate() {
            self.request_bitrate(bitrate);
        }
        publish(events, SessionEvent::NewStream(stream.clone()));
        self.stream = Some(stream);
    }

    pub(crate) fn request_bitrate(&mut self, bitrate: u32) {
        self.outbox.push(
            ControlPacket::new(ControlType::BitrateSwitch, self.session_id, Default::default())
                .with_info(0, bitrate),
        );
    }

    pub(crate) fn statistics(&mut self, now: Instant) -> StatsSnapshot {
        let SessionState {
            stats,
            pipeline,
            connection,
            rtt,
            bitrate,
            fec_overhead,
            ..
        } = self;
        stats.snapshot(now, || {
            let mut snapshot = StatsSnapshot::default();
            snapshot.error_correction.fec_overhead = *fec_overhead;
            pipeline.fill_stats(&mut snapshot);
            snapshot.network.rtt_ms = rtt.srtt() / 1000;
            snapshot.connection.state = connection.state();
            snapshot.connection.reconnects = connection.reconnects();
            snapshot.connection.current_bitrate = bitrate.current_bitrate().unwrap_or(0);
            snapshot.connection.connected_for = connection
                .connected_since()
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
            snapshot
        })
    }

    fn stream_control(&mut self, operation: u16, percent: u32) -> Result<(), ErrorCode> {
        let stream = self.stream.as_ref().ok_or(ErrorCode::NotConnected)?;
        if stream.live {
            return Err(ErrorCode::NotSupported);
        }
        if !self.connection.is_connected() {
            return Err(ErrorCode::NotConnected);
        }
        self.outbox.push(
            ControlPacket::new(ControlType::StreamControl, self.session_id, Default::default())
                .with_info(operation, percent),
        );
        Ok(())
    }
}

/// State shared between a session handle and its worker
pub(crate) struct SessionShared {
    pub(crate) state: Mutex<SessionState>,
    /// Signalled by the worker after every tick
    pub(crate) changed: Condvar,
    pub(crate) stop: AtomicBool,
    pub(crate) events: Sender<SessionEvent>,
}

impl SessionShared {
    pub(crate) fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection.state()
    }

    pub(crate) fn pop_delivery(&self) -> Option<Delivery> {
        self.state.lock().pipeline.pop_delivery()
    }

    pub(crate) fn statistics(&self, now: Instant) -> StatsSnapshot {
        self.state.lock().statistics(now)
    }
}

pub(crate) fn publish(events: &Sender<SessionEvent>, event: SessionEvent) {
    if let Err(TrySendError::Full(event)) = events.try_send(event) {
        tracing::debug!("event queue full, dropping {:?}", event);
    }
}

pub(crate) fn new_session_id() -> u32 {
    rand::random::<u32>().max(1)
}

pub struct Session {
    context: ContextRef,
    shared: Arc<SessionShared>,
    events: Receiver<SessionEvent>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(context: ContextRef) -> Self {
        let (sender, receiver) = channel::bounded(context.event_capacity());
        Session {
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::new(Instant::now())),
                changed: Condvar::new(),
                stop: AtomicBool::new(false),
                events: sender,
            }),
            events: receiver,
            worker: Mutex::new(None),
            context,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    /// Lock the state for a configuration change
    fn configure<F>(&self, apply: F) -> Result<(), ErrorCode>
    where
        F: FnOnce(&mut Settings) -> Result<(), ErrorCode>,
    {
        self.context.check()?;
        let mut state = self.shared.state.lock();
        if state.connection.state().is_attached() {
            return Err(ErrorCode::AlreadyConnected);
        }
        apply(&mut state.settings)
    }

    /// Identity presented to the source; required before connecting
    pub fn configure_id(&self, guid: &str, session_token: &str) -> Result<(), ErrorCode> {
        if guid.is_empty() {
            return Err(ErrorCode::InvalidParameter);
        }
        self.configure(|settings| {
            settings.guid = guid.to_string();
            settings.session_token = session_token.to_string();
            Ok(())
        })
    }

    pub fn configure_error_correction(&self, config: ErrorCorrectionConfig) -> Result<(), ErrorCode> {
        config.validate()?;
        self.configure(|settings| {
            settings.error_correction = config;
            Ok(())
        })
    }

    pub fn configure_adaptive(&self, config: AdaptiveConfig) -> Result<(), ErrorCode> {
        let inverted = config.max_bitrate > 0 && config.initial_bitrate > config.max_bitrate;
        if inverted || config.sample_interval.is_zero() {
            return Err(ErrorCode::InvalidParameter);
        }
        self.configure(|settings| {
            settings.adaptive = config;
            Ok(())
        })
    }

    /// Transport used for the next connect, UDP by default
    pub fn configure_custom_io(&self, connector: Arc<dyn Connector>) -> Result<(), ErrorCode> {
        self.configure(|settings| {
            settings.connector = Some(connector);
            Ok(())
        })
    }

    pub fn configure_reconnect(&self, policy: ReconnectPolicy) -> Result<(), ErrorCode> {
        if policy.enabled && (policy.idle_timeout.is_zero() || policy.retry_interval.is_zero()) {
            return Err(ErrorCode::InvalidParameter);
        }
        self.configure(|settings| {
            settings.reconnect = policy;
            Ok(())
        })
    }

    /// Refresh cadence of [`query_statistics`](Self::query_statistics)
    pub fn configure_stats_interval(&self, interval: Duration) -> Result<(), ErrorCode> {
        self.configure(|settings| {
            settings.stats_interval = interval;
            Ok(())
        })
    }

    /// Connect and wait until the source answers
    pub fn connect(
        &self,
        target: impl Into<ConnectTarget>,
        options: ConnectOptions,
    ) -> Result<(), ErrorCode> {
        let timeout = options.connect_timeout;
        self.begin_connect(target, options)?;
        self.wait_connected(timeout)
    }

    /// Start connecting; progress is reported on [`events`](Self::events)
    pub fn begin_connect(
        &self,
        target: impl Into<ConnectTarget>,
        options: ConnectOptions,
    ) -> Result<(), ErrorCode> {
        self.context.check()?;
        let endpoint = target.into().endpoint()?;
        self.join_finished_worker()?;

        let mut state = self.shared.state.lock();
        if state.connection.state().is_attached() || state.connection.needs_teardown() {
            return Err(ErrorCode::AlreadyConnected);
        }
        let settings = state.settings.clone();
        let guid = endpoint.user.clone().unwrap_or(settings.guid);
        if guid.is_empty() {
            return Err(ErrorCode::InvalidParameter);
        }
        let session_token = endpoint.session.clone().unwrap_or(settings.session_token);

        let connector = settings
            .connector
            .unwrap_or_else(|| Arc::new(UdpConnector));
        let peer = connector
            .resolve(&endpoint.host, endpoint.port)
            .map_err(link_error)?;
        let link = connector.bind(options.local_addr).map_err(link_error)?;

        let ec = &settings.error_correction;
        let request = ConnectRequest {
            version: PROTOCOL_VERSION,
            role: Role::Pull,
            guid: guid.clone(),
            session_token,
            channel: endpoint.channel.clone(),
            latency_ms: ec.max_latency.as_millis().min(u32::MAX as u128) as u32,
            low_latency: options.low_latency,
            fec: ec.fec_params(),
            stream: None,
        };
        tracing::info!(
            "connecting to {} channel {:?} as {}",
            peer,
            endpoint.channel,
            guid
        );

        let now = Instant::now();
        state.reset(SessionRole::Caller { request }, Some(peer), now);
        let actions = state.connection.begin(options.connect_timeout, now)?;
        state.apply(actions, &self.shared.events);
        drop(state);

        self.spawn_worker(SessionWorker::new(Arc::clone(&self.shared), link, now), &guid)
    }

    /// Listen on `port` and wait for a feeder to push a stream
    pub fn accept(&self, port: u16, options: ConnectOptions) -> Result<(), ErrorCode> {
        let timeout = options.connect_timeout;
        self.begin_accept(port, options)?;
        self.wait_connected(timeout)
    }

    pub fn begin_accept(&self, port: u16, options: ConnectOptions) -> Result<(), ErrorCode> {
        self.context.check()?;
        self.join_finished_worker()?;

        let mut state = self.shared.state.lock();
        if state.connection.state().is_attached() || state.connection.needs_teardown() {
            return Err(ErrorCode::AlreadyConnected);
        }
        let settings = state.settings.clone();
        let connector = settings
            .connector
            .unwrap_or_else(|| Arc::new(UdpConnector));
        let ip = options
            .local_addr
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |addr| addr.ip());
        let link = connector
            .bind(Some(SocketAddr::new(ip, port)))
            .map_err(link_error)?;
        tracing::info!("waiting for a feeder on {}", link.local_addr());

        let now = Instant::now();
        let role = SessionRole::Listener {
            session_token: settings.session_token,
        };
        state.reset(role, None, now);
        let actions = state.connection.begin(options.connect_timeout, now)?;
        state.apply(actions, &self.shared.events);
        drop(state);

        let name = format!("listen-{}", port);
        self.spawn_worker(SessionWorker::new(Arc::clone(&self.shared), link, now), &name)
    }

    fn spawn_worker(&self, worker: SessionWorker, name: &str) -> Result<(), ErrorCode> {
        self.shared.stop.store(false, Ordering::Release);
        match self.context.spawn(format!("ingest-session-{}", name), move || worker.run()) {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(code) => {
                let mut state = self.shared.state.lock();
                let actions = state.connection.finish_disconnect();
                state.apply(actions, &self.shared.events);
                Err(code)
            }
        }
    }

    /// Reap a worker that ended on its own (failure or peer shutdown)
    fn join_finished_worker(&self) -> Result<(), ErrorCode> {
        if self.shared.connection_state().is_attached() {
            return Err(ErrorCode::AlreadyConnected);
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("session worker panicked");
            }
        }
        Ok(())
    }

    fn wait_connected(&self, timeout: Duration) -> Result<(), ErrorCode> {
        let deadline = Instant::now() + timeout + WAIT_SLACK;
        let mut state = self.shared.state.lock();
        loop {
            match state.connection.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => {
                    return Err(state.connection.last_error().unwrap_or(ErrorCode::NotConnected))
                }
                _ => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorCode::Timeout);
            }
            self.shared.changed.wait_for(&mut state, deadline - now);
        }
    }

    pub fn read(&self, buf: &mut [u8], full_frames: bool) -> Result<ReadOutcome, ErrorCode> {
        self.context.check()?;
        let mut state = self.shared.state.lock();
        match state.pipeline.read(buf, full_frames) {
            Ok(mut outcome) => {
                outcome.bitrate = state.bitrate.current_bitrate().unwrap_or(0);
                Ok(outcome)
            }
            Err(ErrorCode::NotReady) if !state.connection.state().is_attached() => {
                Err(ErrorCode::NotConnected)
            }
            Err(code) => Err(code),
        }
    }

    /// Stop the worker and close the connection
    pub fn disconnect(&self) -> Result<(), ErrorCode> {
        self.context.check()?;
        {
            let mut state = self.shared.state.lock();
            let actions = state.connection.begin_disconnect()?;
            state.apply(actions, &self.shared.events);
        }

        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("session worker panicked");
            }
        }

        let mut state = self.shared.state.lock();
        let actions = state.connection.finish_disconnect();
        state.apply(actions, &self.shared.events);
        tracing::info!("session disconnected");
        Ok(())
    }

    /// Status notifications; the queue is bounded and drops when full
    pub fn events(&self) -> Receiver<SessionEvent> {
        self.events.clone()
    }

    pub fn status(&self) -> Result<ConnectionState, ErrorCode> {
        self.context.check()?;
        Ok(self.shared.connection_state())
    }

    pub fn last_error(&self) -> Result<Option<ErrorCode>, ErrorCode> {
        self.context.check()?;
        Ok(self.shared.state.lock().connection.last_error())
    }

    pub fn query_stream_info(&self) -> Result<StreamInfo, ErrorCode> {
        self.context.check()?;
        self.shared
            .state
            .lock()
            .stream
            .clone()
            .ok_or(ErrorCode::NotConnected)
    }

    pub fn query_statistics(&self) -> Result<StatsSnapshot, ErrorCode> {
        self.context.check()?;
        Ok(self.shared.statistics(Instant::now()))
    }

    /// Latency budget in effect and smoothed round-trip time, both in ms
    pub fn query_latency(&self) -> Result<(u32, u32), ErrorCode> {
        self.context.check()?;
        let state = self.shared.state.lock();
        if !state.connection.state().is_attached() {
            return Err(ErrorCode::NotConnected);
        }
        let latency = state.pipeline.jitter().effective_latency().as_millis() as u32;
        Ok((latency, state.rtt.srtt() / 1000))
    }

    /// Advertised bitrate variants and the index of the one selected
    pub fn query_adaptive_info(&self) -> Result<(Vec<u32>, usize), ErrorCode> {
        self.context.check()?;
        let state = self.shared.state.lock();
        if state.stream.is_none() {
            return Err(ErrorCode::NotConnected);
        }
        Ok((state.bitrate.variants().to_vec(), state.bitrate.current_index()))
    }

    /// Pin a bitrate variant; 0 returns to automatic switching
    pub fn adaptive_bitrate_switch(&self, bitrate: u32) -> Result<(), ErrorCode> {
        self.context.check()?;
        let mut state = self.shared.state.lock();
        if state.stream.is_none() {
            return Err(ErrorCode::NotConnected);
        }
        if let Some(bitrate) = state.bitrate.select(bitrate)? {
            state.request_bitrate(bitrate);
            publish(&self.shared.events, SessionEvent::BitrateChanged(bitrate));
        }
        Ok(())
    }

    /// Pin the variant at `stream_index` of the advertised list
    pub fn manual_migrate(&self, stream_index: usize) -> Result<(), ErrorCode> {
        self.context.check()?;
        let mut state = self.shared.state.lock();
        if state.stream.is_none() {
            return Err(ErrorCode::NotConnected);
        }
        let previous = state.bitrate.current_index();
        let bitrate = state.bitrate.select_index(stream_index)?;
        if previous != stream_index {
            state.request_bitrate(bitrate);
            publish(&self.shared.events, SessionEvent::BitrateChanged(bitrate));
        }
        Ok(())
    }

    pub fn stream_pause(&self) -> Result<(), ErrorCode> {
        self.context.check()?;
        self.shared.state.lock().stream_control(STREAM_PAUSE, 0)
    }

    pub fn stream_resume(&self) -> Result<(), ErrorCode> {
        self.context.check()?;
        self.shared.state.lock().stream_control(STREAM_RESUME, 0)
    }

    /// Seek a finite stream to `percent`; `-1` only tests whether seeking
    /// is possible
    pub fn stream_seek(&self, percent: i32) -> Result<(), ErrorCode> {
        self.context.check()?;
        let mut state = self.shared.state.lock();
        if percent == -1 {
            let stream = state.stream.as_ref().ok_or(ErrorCode::NotConnected)?;
            return if stream.live {
                Err(ErrorCode::NotSupported)
            } else {
                Ok(())
            };
        }
        if !(0..=100).contains(&percent) {
            return Err(ErrorCode::InvalidParameter);
        }
        state.stream_control(STREAM_SEEK, percent as u32)
    }
}

impl MediaHandle for Session {
    fn read(&self, buf: &mut [u8], full_frames: bool) -> Result<ReadOutcome, ErrorCode> {
        Session::read(self, buf, full_frames)
    }

    fn disconnect(&self) -> Result<(), ErrorCode> {
        Session::disconnect(self)
    }

    fn query_statistics(&self) -> Result<StatsSnapshot, ErrorCode> {
        Session::query_statistics(self)
    }

    fn status(&self) -> Result<ConnectionState, ErrorCode> {
        Session::status(self)
    }

    fn last_error(&self) -> Result<Option<ErrorCode>, ErrorCode> {
        Session::last_error(self)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }
    }
}
