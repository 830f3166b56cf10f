//! Connection state machine
//!
//! Tracks the lifecycle of one receiving connection:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!                                        \-> Disconnecting -> Disconnected
//! ```
//!
//! The machine is driven by the session worker: it reports packets heard
//! from the peer, handshake answers and timer ticks, and gets back the
//! actions to take (send a handshake, publish a state change).

use crate::error::ErrorCode;
use crate::handshake::StreamInfo;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Peer went silent; handshakes are retried within the reconnect window
    Reconnecting,
    Disconnecting,
}

impl ConnectionState {
    /// A connect lifecycle is in progress
    pub fn is_attached(self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

/// Notification published on a session's event channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Status {
        state: ConnectionState,
        error: Option<ErrorCode>,
    },
    NewStream(StreamInfo),
    BitrateChanged(u32),
}

/// Automatic reconnection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Silence from the peer that counts as a broken link
    pub idle_timeout: Duration,
    /// Spacing between handshake attempts
    pub retry_interval: Duration,
    /// Give up reconnecting after this long
    pub window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            enabled: true,
            idle_timeout: Duration::from_millis(1500),
            retry_interval: Duration::from_millis(250),
            window: Duration::from_secs(10),
        }
    }
}

/// What the worker must do after feeding the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    SendHandshake,
    StateChanged {
        state: ConnectionState,
        error: Option<ErrorCode>,
    },
}

pub struct Connection {
    state: ConnectionState,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    last_error: Option<ErrorCode>,
    attempt_started: Option<Instant>,
    last_handshake: Option<Instant>,
    last_heard: Option<Instant>,
    connected_at: Option<Instant>,
    reconnects: u32,
    /// A terminal failure ended the last attempt and nobody disconnected yet
    needs_teardown: bool,
}

impl Connection {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Connection {
            state: ConnectionState::Disconnected,
            policy,
            connect_timeout: Duration::from_secs(5),
            last_error: None,
            attempt_started: None,
            last_handshake: None,
            last_heard: None,
            connected_at: None,
            reconnects: 0,
            needs_teardown: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Most recent terminal cause, kept until the next connect
    pub fn last_error(&self) -> Option<ErrorCode> {
        self.last_error
    }

    /// Successful reconnections since the last fresh connect
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn connected_since(&self) -> Option<Instant> {
        self.connected_at
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// After an authorization, licensing, certificate or version failure
    /// the next connect has to wait for [`Connection::finish_disconnect`]
    pub fn needs_teardown(&self) -> bool {
        self.needs_teardown
    }

    /// Start a fresh connect attempt (caller or listener side)
    pub fn begin(
        &mut self,
        connect_timeout: Duration,
        now: Instant,
    ) -> Result<Vec<ConnectionAction>, ErrorCode> {
        if self.state.is_attached() || self.needs_teardown {
            return Err(ErrorCode::AlreadyConnected);
        }
        self.connect_timeout = connect_timeout;
        self.last_error = None;
        self.reconnects = 0;
        self.attempt_started = Some(now);
        self.last_handshake = None;
        self.last_heard = None;
        self.connected_at = None;

        let mut actions = vec![self.transition(ConnectionState::Connecting, None)];
        actions.extend(self.handshake_if_due(now));
        Ok(actions)
    }

    /// Peer accepted our handshake (or we accepted the peer's)
    pub fn on_accepted(&mut self, now: Instant) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                if self.state == ConnectionState::Reconnecting {
                    self.reconnects += 1;
                }
                self.last_heard = Some(now);
                self.connected_at = Some(now);
                self.attempt_started = None;
                vec![self.transition(ConnectionState::Connected, None)]
            }
            _ => Vec::new(),
        }
    }

    /// Peer refused the connection with `code`
    ///
    /// Terminal codes end the lifecycle at once; anything else is retried
    /// while an attempt is in progress.
    pub fn on_rejected(&mut self, code: ErrorCode) -> Vec<ConnectionAction> {
        if !self.state.is_attached() || self.state == ConnectionState::Disconnecting {
            return Vec::new();
        }
        if code.is_terminal() || self.state == ConnectionState::Connected {
            return self.fail(code);
        }
        tracing::debug!("connect attempt rejected with {}, retrying", code);
        Vec::new()
    }

    /// Any valid packet from the peer
    pub fn on_packet(&mut self, now: Instant) {
        self.last_heard = Some(now);
    }

    /// Peer closed the connection in an orderly way
    pub fn on_peer_shutdown(&mut self) -> Vec<ConnectionAction> {
        if self.state != ConnectionState::Connected {
            return Vec::new();
        }
        self.attempt_started = None;
        vec![self.transition(ConnectionState::Disconnected, None)]
    }

    /// Timer tick
    pub fn tick(&mut self, now: Instant) -> Vec<ConnectionAction> {
        match self.state {
            ConnectionState::Connecting => {
                let started = self.attempt_started.unwrap_or(now);
                if now.saturating_duration_since(started) >= self.connect_timeout {
                    tracing::warn!("no answer within {:?}", self.connect_timeout);
                    return self.fail(ErrorCode::Timeout);
                }
                self.handshake_if_due(now)
            }
            ConnectionState::Connected => {
                let heard = self.last_heard.unwrap_or(now);
                if now.saturating_duration_since(heard) < self.policy.idle_timeout {
                    return Vec::new();
                }
                if !self.policy.enabled {
                    tracing::warn!("peer silent for {:?}", self.policy.idle_timeout);
                    return self.fail(ErrorCode::NetworkError);
                }
                tracing::info!("peer silent for {:?}, reconnecting", self.policy.idle_timeout);
                self.attempt_started = Some(now);
                self.last_handshake = None;
                let mut actions = vec![self.transition(ConnectionState::Reconnecting, None)];
                actions.extend(self.handshake_if_due(now));
                actions
            }
            ConnectionState::Reconnecting => {
                let started = self.attempt_started.unwrap_or(now);
                if now.saturating_duration_since(started) >= self.policy.window {
                    tracing::warn!("reconnect window of {:?} elapsed", self.policy.window);
                    return self.fail(ErrorCode::NetworkError);
                }
                self.handshake_if_due(now)
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => Vec::new(),
        }
    }

    /// Caller asked to disconnect
    pub fn begin_disconnect(&mut self) -> Result<Vec<ConnectionAction>, ErrorCode> {
        match self.state {
            ConnectionState::Disconnected if self.needs_teardown => Ok(Vec::new()),
            ConnectionState::Disconnected => Err(ErrorCode::NotConnected),
            ConnectionState::Disconnecting => Ok(Vec::new()),
            _ => Ok(vec![self.transition(ConnectionState::Disconnecting, None)]),
        }
    }

    /// Resources released
    pub fn finish_disconnect(&mut self) -> Vec<ConnectionAction> {
        self.needs_teardown = false;
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        self.attempt_started = None;
        vec![self.transition(ConnectionState::Disconnected, None)]
    }

    fn fail(&mut self, code: ErrorCode) -> Vec<ConnectionAction> {
        self.last_error = Some(code);
        self.needs_teardown = code.is_terminal();
        self.attempt_started = None;
        vec![self.transition(ConnectionState::Disconnected, Some(code))]
    }

    fn handshake_if_due(&mut self, now: Instant) -> Vec<ConnectionAction> {
        let due = self
            .last_handshake
            .map_or(true, |last| now.saturating_duration_since(last) >= self.policy.retry_interval);
        if due {
            self.last_handshake = Some(now);
            vec![ConnectionAction::SendHandshake]
        } else {
            Vec::new()
        }
    }

    fn transition(&mut self, state: ConnectionState, error: Option<ErrorCode>) -> ConnectionAction {
        tracing::debug!("connection {:?} -> {:?}", self.state, state);
        self.state = state;
        ConnectionAction::StateChanged { state, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(actions: &[ConnectionAction]) -> Vec<ConnectionState> {
        actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::StateChanged { state, .. } => Some(*state),
                ConnectionAction::SendHandshake => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_lifecycle() {
        let now = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());
        let actions = conn.begin(Duration::from_secs(1), now).unwrap();
        assert_eq!(states(&actions), vec![ConnectionState::Connecting]);
        assert!(actions.contains(&ConnectionAction::SendHandshake));

        assert_eq!(
            conn.begin(Duration::from_secs(1), now),
            Err(ErrorCode::AlreadyConnected)
        );

        assert_eq!(states(&conn.on_accepted(now)), vec![ConnectionState::Connected]);
        assert_eq!(
            states(&conn.begin_disconnect().unwrap()),
            vec![ConnectionState::Disconnecting]
        );
        assert_eq!(
            states(&conn.finish_disconnect()),
            vec![ConnectionState::Disconnected]
        );
        assert_eq!(conn.begin_disconnect(), Err(ErrorCode::NotConnected));
    }

    #[test]
    fn test_handshake_retry_and_timeout() {
        let start = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());
        conn.begin(Duration::from_millis(600), start).unwrap();

        assert!(conn.tick(start + Duration::from_millis(100)).is_empty());
        assert_eq!(
            conn.tick(start + Duration::from_millis(250)),
            vec![ConnectionAction::SendHandshake]
        );
        let actions = conn.tick(start + Duration::from_millis(600));
        assert_eq!(
            actions,
            vec![ConnectionAction::StateChanged {
                state: ConnectionState::Disconnected,
                error: Some(ErrorCode::Timeout),
            }]
        );
        assert_eq!(conn.last_error(), Some(ErrorCode::Timeout));
    }

    #[test]
    fn test_idle_triggers_reconnect() {
        let start = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());
        conn.begin(Duration::from_secs(1), start).unwrap();
        conn.on_accepted(start);

        assert!(conn.tick(start + Duration::from_millis(1000)).is_empty());
        let actions = conn.tick(start + Duration::from_millis(1500));
        assert_eq!(states(&actions), vec![ConnectionState::Reconnecting]);
        assert!(actions.contains(&ConnectionAction::SendHandshake));

        conn.on_accepted(start + Duration::from_millis(2000));
        assert!(conn.is_connected());
        assert_eq!(conn.reconnects(), 1);
    }

    #[test]
    fn test_reconnect_window_expires() {
        let start = Instant::now();
        let policy = ReconnectPolicy {
            window: Duration::from_secs(2),
            ..ReconnectPolicy::default()
        };
        let mut conn = Connection::new(policy);
        conn.begin(Duration::from_secs(1), start).unwrap();
        conn.on_accepted(start);
        conn.tick(start + Duration::from_millis(1500));

        let actions = conn.tick(start + Duration::from_millis(3500));
        assert_eq!(
            actions,
            vec![ConnectionAction::StateChanged {
                state: ConnectionState::Disconnected,
                error: Some(ErrorCode::NetworkError),
            }]
        );
    }

    #[test]
    fn test_terminal_reject_skips_reconnect() {
        let now = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());
        conn.begin(Duration::from_secs(1), now).unwrap();

        assert!(conn.on_rejected(ErrorCode::ServerFull).len() == 1);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.last_error(), Some(ErrorCode::ServerFull));
    }

    #[test]
    fn test_terminal_failure_needs_disconnect_before_retry() {
        let now = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());
        conn.begin(Duration::from_secs(1), now).unwrap();
        conn.on_rejected(ErrorCode::AuthorizationFailed);
        assert!(conn.needs_teardown());
        assert_eq!(
            conn.begin(Duration::from_secs(1), now).unwrap_err(),
            ErrorCode::AlreadyConnected
        );

        // Already disconnected, so no further state change is announced
        assert!(conn.begin_disconnect().unwrap().is_empty());
        assert!(conn.finish_disconnect().is_empty());
        assert!(!conn.needs_teardown());
        assert_eq!(conn.last_error(), Some(ErrorCode::AuthorizationFailed));
        assert!(conn.begin(Duration::from_secs(1), now).is_ok());
    }

    #[test]
    fn test_timeout_does_not_need_disconnect() {
        let start = Instant::now();
        let mut conn = Connection::new(ReconnectPolicy::default());
        conn.begin(Duration::from_millis(100), start).unwrap();
        conn.tick(start + Duration::from_secs(1));
        assert_eq!(conn.last_error(), Some(ErrorCode::Timeout));
        assert!(!conn.needs_teardown());
        assert_eq!(conn.begin_disconnect().unwrap_err(), ErrorCode::NotConnected);
    }

    #[test]
    fn test_disabled_reconnect_fails_on_idle() {
        let start = Instant::now();
        let policy = ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        };
        let mut conn = Connection::new(policy);
        conn.begin(Duration::from_secs(1), start).unwrap();
        conn.on_accepted(start);
        conn.tick(start + Duration::from_secs(2));
        assert_eq!(conn.last_error(), Some(ErrorCode::NetworkError));
    }
}
