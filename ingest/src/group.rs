//! Failover groups
//!
//! A [`FailoverGroup`] owns several sessions carrying the same stream over
//! different paths. A group worker drains what each component's pipeline
//! releases into a [`Merger`], and the group is read like a single session.

use crate::context::ContextRef;
use crate::handle::MediaHandle;
use crate::session::{ConnectOptions, Session, SessionShared};
use crate::url::ConnectTarget;
use ingest_failover::{
    ComponentStats, MergeInput, MergeMode, MergedPacket, Merger, MergerConfig, MergerStats,
    Priority,
};
use ingest_protocol::{
    ChunkReader, ConnectionState, ErrorCode, ReadOutcome, StatsSnapshot,
};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub search_window: Duration,
    pub mode: MergeMode,
    /// Reported in statistics; each component negotiates its own rate
    pub max_bitrate: u32,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            search_window: Duration::from_millis(1000),
            mode: MergeMode::Header,
            max_bitrate: 0,
        }
    }
}

/// Merged snapshot plus what each component contributed
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub merged: StatsSnapshot,
    pub merger: MergerStats,
    pub components: Vec<ComponentStats>,
    pub max_bitrate: u32,
}

struct Component {
    session: Session,
    target: ConnectTarget,
    priority: Priority,
}

struct GroupState {
    config: GroupConfig,
    components: Vec<Component>,
    merger: Option<Merger>,
    reader: ChunkReader<MergedPacket>,
    attached: bool,
}

impl GroupState {
    fn component_states(&self) -> Vec<ConnectionState> {
        self.components
            .iter()
            .map(|c| c.session.shared().connection_state())
            .collect()
    }
}

struct GroupShared {
    state: Mutex<GroupState>,
    changed: Condvar,
    stop: AtomicBool,
}

pub struct FailoverGroup {
    context: ContextRef,
    shared: Arc<GroupShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FailoverGroup {
    pub(crate) fn new(context: ContextRef, config: GroupConfig) -> Result<Self, ErrorCode> {
        if config.search_window.is_zero() {
            return Err(ErrorCode::InvalidParameter);
        }
        Ok(FailoverGroup {
            context,
            shared: Arc::new(GroupShared {
                state: Mutex::new(GroupState {
                    config,
                    components: Vec::new(),
                    merger: None,
                    reader: ChunkReader::default(),
                    attached: false,
                }),
                changed: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Add a configured session; returns its component index
    pub fn add_component(
        &self,
        session: Session,
        target: impl Into<ConnectTarget>,
        priority: Priority,
    ) -> Result<usize, ErrorCode> {
        self.context.check()?;
        let target = target.into();
        target.endpoint()?;
        let mut state = self.shared.state.lock();
        if state.attached {
            return Err(ErrorCode::AlreadyConnected);
        }
        if session.status()?.is_attached() {
            return Err(ErrorCode::AlreadyConnected);
        }
        state.components.push(Component {
            session,
            target,
            priority,
        });
        Ok(state.components.len() - 1)
    }

    pub fn component_count(&self) -> usize {
        self.shared.state.lock().components.len()
    }

    /// Connect every component and wait until one of them is up
    pub fn connect(&self, options: ConnectOptions) -> Result<(), ErrorCode> {
        let timeout = options.connect_timeout;
        self.begin_connect(options)?;

        let deadline = Instant::now() + timeout + Duration::from_millis(200);
        let mut state = self.shared.state.lock();
        loop {
            let states = state.component_states();
            if states.contains(&ConnectionState::Connected) {
                return Ok(());
            }
            if states.iter().all(|s| !s.is_attached()) {
                let cause = state
                    .components
                    .iter()
                    .find_map(|c| c.session.last_error().ok().flatten());
                return Err(cause.unwrap_or(ErrorCode::NotConnected));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(ErrorCode::Timeout);
            }
            self.shared.changed.wait_for(&mut state, deadline - now);
        }
    }

    /// Start every component; fails only when none could be started
    pub fn begin_connect(&self, options: ConnectOptions) -> Result<(), ErrorCode> {
        self.context.check()?;
        let mut state = self.shared.state.lock();
        if state.attached {
            return Err(ErrorCode::AlreadyConnected);
        }
        if state.components.is_empty() {
            return Err(ErrorCode::InvalidParameter);
        }

        let mut started = 0;
        let mut first_error = None;
        for (index, component) in state.components.iter().enumerate() {
            match component
                .session
                .begin_connect(component.target.clone(), options.clone())
            {
                Ok(()) => started += 1,
                Err(code) => {
                    tracing::warn!("component {} failed to start: {}", index, code);
                    first_error.get_or_insert(code);
                }
            }
        }
        if started == 0 {
            return Err(first_error.unwrap_or(ErrorCode::Failed));
        }

        let merger = Merger::new(MergerConfig {
            search_window: state.config.search_window,
            mode: state.config.mode,
            priorities: state.components.iter().map(|c| c.priority).collect(),
        })
        .map_err(|e| {
            tracing::error!("cannot build merger: {}", e);
            ErrorCode::InvalidParameter
        })?;
        let sessions: Vec<Arc<SessionShared>> = state
            .components
            .iter()
            .map(|c| Arc::clone(c.session.shared()))
            .collect();
        tracing::info!(
            "failover group of {} components, {:?} merge",
            sessions.len(),
            state.config.mode
        );
        state.merger = Some(merger);
        state.reader = ChunkReader::default();
        state.attached = true;
        drop(state);

        self.shared.stop.store(false, Ordering::Release);
        let worker = GroupWorker {
            shared: Arc::clone(&self.shared),
            gaps: vec![false; sessions.len()],
            components: sessions,
        };
        let handle = self
            .context
            .spawn("ingest-group".to_string(), move || worker.run())?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8], full_frames: bool) -> Result<ReadOutcome, ErrorCode> {
        self.context.check()?;
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let result = match state.merger.as_mut() {
            Some(merger) => state.reader.read(buf, full_frames, || merger.pop()),
            None => Err(ErrorCode::NotReady),
        };
        match result {
            Ok(mut outcome) => {
                outcome.bitrate = state
                    .components
                    .iter()
                    .filter_map(|c| c.session.shared().state.lock().bitrate.current_bitrate())
                    .max()
                    .unwrap_or(0);
                Ok(outcome)
            }
            Err(ErrorCode::NotReady)
                if !state.attached
                    || state.component_states().iter().all(|s| !s.is_attached()) =>
            {
                Err(ErrorCode::NotConnected)
            }
            Err(code) => Err(code),
        }
    }

    pub fn disconnect(&self) -> Result<(), ErrorCode> {
        self.context.check()?;
        {
            let mut state = self.shared.state.lock();
            if !state.attached {
                return Err(ErrorCode::NotConnected);
            }
            state.attached = false;
        }

        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("group worker panicked");
            }
        }

        let state = self.shared.state.lock();
        for (index, component) in state.components.iter().enumerate() {
            match component.session.disconnect() {
                Ok(()) | Err(ErrorCode::NotConnected) => {}
                Err(code) => tracing::warn!("component {} disconnect: {}", index, code),
            }
        }
        tracing::info!("failover group disconnected");
        Ok(())
    }

    /// Most attached state among the components
    pub fn status(&self) -> Result<ConnectionState, ErrorCode> {
        self.context.check()?;
        let states = self.shared.state.lock().component_states();
        let order = [
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Disconnecting,
        ];
        Ok(order
            .into_iter()
            .find(|s| states.contains(s))
            .unwrap_or(ConnectionState::Disconnected))
    }

    /// First component error, reported once no component is attached
    pub fn last_error(&self) -> Result<Option<ErrorCode>, ErrorCode> {
        self.context.check()?;
        let state = self.shared.state.lock();
        if state.component_states().iter().any(|s| s.is_attached()) {
            return Ok(None);
        }
        Ok(state
            .components
            .iter()
            .find_map(|c| c.session.last_error().ok().flatten()))
    }

    pub fn query_statistics(&self) -> Result<StatsSnapshot, ErrorCode> {
        Ok(self.query_group_statistics()?.merged)
    }

    pub fn query_group_statistics(&self) -> Result<GroupStats, ErrorCode> {
        self.context.check()?;
        let now = Instant::now();
        let status = self.status()?;
        let state = self.shared.state.lock();
        let snapshots: Vec<StatsSnapshot> = state
            .components
            .iter()
            .map(|c| c.session.shared().statistics(now))
            .collect();

        let mut merged = StatsSnapshot::merge(&snapshots);
        merged.connection.state = status;
        let (merger, components) = match &state.merger {
            Some(merger) => (merger.stats(), merger.component_stats().to_vec()),
            None => (MergerStats::default(), Vec::new()),
        };
        if state.merger.is_some() {
            merged.connection.packets_delivered = merger.forwarded;
            merged.connection.bytes_delivered =
                components.iter().map(|c| c.contributed_bytes).sum();
        }

        Ok(GroupStats {
            merged,
            merger,
            components,
            max_bitrate: state.config.max_bitrate,
        })
    }
}

impl MediaHandle for FailoverGroup {
    fn read(&self, buf: &mut [u8], full_frames: bool) -> Result<ReadOutcome, ErrorCode> {
        FailoverGroup::read(self, buf, full_frames)
    }

    fn disconnect(&self) -> Result<(), ErrorCode> {
        FailoverGroup::disconnect(self)
    }

    fn query_statistics(&self) -> Result<StatsSnapshot, ErrorCode> {
        FailoverGroup::query_statistics(self)
    }

    fn status(&self) -> Result<ConnectionState, ErrorCode> {
        FailoverGroup::status(self)
    }

    fn last_error(&self) -> Result<Option<ErrorCode>, ErrorCode> {
        FailoverGroup::last_error(self)
    }
}

impl Drop for FailoverGroup {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.join();
        }
    }
}

struct GroupWorker {
    shared: Arc<GroupShared>,
    components: Vec<Arc<SessionShared>>,
    /// A component stuffed nulls; its next packet follows a gap
    gaps: Vec<bool>,
}

impl GroupWorker {
    fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        while !shared.stop.load(Ordering::Acquire) {
            let now = Instant::now();
            {
                let mut state = shared.state.lock();
                if let Some(merger) = state.merger.as_mut() {
                    self.pump(merger, now);
                }
            }
            shared.changed.notify_all();
            std::thread::sleep(TICK);
        }
        tracing::debug!("group worker stopped");
    }

    fn pump(&mut self, merger: &mut Merger, now: Instant) {
        for (index, component) in self.components.iter().enumerate() {
            let connected = component.connection_state() == ConnectionState::Connected;
            if connected {
                if let Err(e) = merger.set_connected(index, true) {
                    tracing::warn!("merger rejected component {} state: {}", index, e);
                }
            }
            while let Some(delivery) = component.pop_delivery() {
                if delivery.is_null() {
                    self.gaps[index] = true;
                    continue;
                }
                let input = MergeInput {
                    discontinuity: delivery.discontinuity || std::mem::take(&mut self.gaps[index]),
                    end_of_stream: delivery.end_of_stream,
                    payload: delivery.payload,
                };
                if let Err(e) = merger.on_packet(index, input, now) {
                    tracing::warn!("merge failed: {}", e);
                }
            }
            if !connected {
                if let Err(e) = merger.set_connected(index, false) {
                    tracing::warn!("merger rejected component {} state: {}", index, e);
                }
            }
        }
        merger.expire(now);
    }
}
