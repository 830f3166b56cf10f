//! In-process simulated network
//!
//! Datagrams travel through a shared [`SimNetwork`] instead of the OS. Loss,
//! delay and jitter are drawn from a seeded RNG, so a scenario replays the
//! same loss pattern for the same seed and traffic. Addresses can be taken
//! down to simulate a dead link.

use crate::link::{Connector, Link, LinkError};
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FIRST_EPHEMERAL_PORT: u16 = 40000;
/// Datagrams queued per endpoint before tail drop
const ENDPOINT_QUEUE_LIMIT: usize = 65536;

/// Impairments applied to datagrams
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LinkConditions {
    /// Drop probability, 0.0 to 1.0
    pub loss: f64,
    pub delay: Duration,
    /// Extra random delay up to this value; reorders datagrams
    pub jitter: Duration,
}

impl LinkConditions {
    pub fn lossy(loss: f64) -> Self {
        LinkConditions {
            loss,
            ..LinkConditions::default()
        }
    }
}

/// Traffic counters of the whole network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub sent: u64,
    pub dropped: u64,
    pub delivered: u64,
}

struct Queued {
    deliver_at: Instant,
    from: SocketAddr,
    data: Bytes,
}

struct NetState {
    endpoints: HashMap<SocketAddr, VecDeque<Queued>>,
    rng: StdRng,
    default_conditions: LinkConditions,
    /// Conditions on datagrams sent from an address
    conditions_from: HashMap<SocketAddr, LinkConditions>,
    down: HashSet<SocketAddr>,
    next_port: u16,
    stats: SimStats,
}

pub struct SimNetwork {
    state: Mutex<NetState>,
}

impl SimNetwork {
    pub fn new(seed: u64) -> Arc<Self> {
        Arc::new(SimNetwork {
            state: Mutex::new(NetState {
                endpoints: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
                default_conditions: LinkConditions::default(),
                conditions_from: HashMap::new(),
                down: HashSet::new(),
                next_port: FIRST_EPHEMERAL_PORT,
                stats: SimStats::default(),
            }),
        })
    }

    /// Connector binding links on host `ip`
    pub fn connector(self: &Arc<Self>, ip: IpAddr) -> SimConnector {
        SimConnector {
            network: Arc::clone(self),
            host: ip,
        }
    }

    pub fn set_default_conditions(&self, conditions: LinkConditions) {
        self.state.lock().default_conditions = conditions;
    }

    /// Impair everything sent from `addr`
    pub fn set_conditions_from(&self, addr: SocketAddr, conditions: LinkConditions) {
        self.state.lock().conditions_from.insert(addr, conditions);
    }

    /// Drop all traffic to and from `addr` while down
    pub fn set_down(&self, addr: SocketAddr, down: bool) {
        let mut state = self.state.lock();
        if down {
            state.down.insert(addr);
            if let Some(queue) = state.endpoints.get_mut(&addr) {
                queue.clear();
            }
        } else {
            state.down.remove(&addr);
        }
    }

    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    fn register(&self, addr: Option<SocketAddr>, host: IpAddr) -> Result<SocketAddr, LinkError> {
        let mut state = self.state.lock();
        let addr = match addr {
            Some(addr) if addr.port() != 0 => {
                let ip = if addr.ip().is_unspecified() { host } else { addr.ip() };
                SocketAddr::new(ip, addr.port())
            }
            _ => loop {
                let port = state.next_port;
                state.next_port = state.next_port.checked_add(1).unwrap_or(FIRST_EPHEMERAL_PORT);
                let candidate = SocketAddr::new(host, port);
                if !state.endpoints.contains_key(&candidate) {
                    break candidate;
                }
            },
        };

        if state.endpoints.contains_key(&addr) {
            return Err(LinkError::AddrInUse(addr));
        }
        state.endpoints.insert(addr, VecDeque::new());
        Ok(addr)
    }

    fn unregister(&self, addr: SocketAddr) {
        self.state.lock().endpoints.remove(&addr);
    }

    fn send(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.stats.sent += 1;

        if state.down.contains(&from) || state.down.contains(&to) {
            state.stats.dropped += 1;
            return;
        }
        let conditions = state
            .conditions_from
            .get(&from)
            .copied()
            .unwrap_or(state.default_conditions);
        if conditions.loss > 0.0 && state.rng.gen::<f64>() < conditions.loss {
            state.stats.dropped += 1;
            return;
        }

        let mut delay = conditions.delay;
        if !conditions.jitter.is_zero() {
            let extra = state.rng.gen_range(0..=conditions.jitter.as_micros() as u64);
            delay += Duration::from_micros(extra);
        }

        let Some(queue) = state.endpoints.get_mut(&to) else {
            state.stats.dropped += 1;
            return;
        };
        if queue.len() >= ENDPOINT_QUEUE_LIMIT {
            state.stats.dropped += 1;
            return;
        }

        let deliver_at = Instant::now() + delay;
        let position = queue
            .iter()
            .rposition(|q| q.deliver_at <= deliver_at)
            .map_or(0, |i| i + 1);
        queue.insert(
            position,
            Queued {
                deliver_at,
                from,
                data: Bytes::copy_from_slice(data),
            },
        );
    }

    fn recv(&self, at: SocketAddr, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, LinkError> {
        let mut state = self.state.lock();
        let queue = state.endpoints.get_mut(&at).ok_or(LinkError::Closed)?;
        match queue.front() {
            Some(front) if front.deliver_at <= Instant::now() => {}
            _ => return Ok(None),
        }
        let Some(datagram) = queue.pop_front() else {
            return Ok(None);
        };
        state.stats.delivered += 1;

        let n = datagram.data.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram.data[..n]);
        Ok(Some((n, datagram.from)))
    }
}

/// Endpoint on a [`SimNetwork`]
pub struct SimLink {
    network: Arc<SimNetwork>,
    local: SocketAddr,
}

impl Link for SimLink {
    fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> Result<bool, LinkError> {
        self.network.send(self.local, peer, datagram);
        Ok(true)
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, LinkError> {
        self.network.recv(self.local, buf)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.network.unregister(self.local);
    }
}

#[derive(Clone)]
pub struct SimConnector {
    network: Arc<SimNetwork>,
    host: IpAddr,
}

impl SimConnector {
    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }
}

impl Connector for SimConnector {
    fn bind(&self, local: Option<SocketAddr>) -> Result<Box<dyn Link>, LinkError> {
        let local = self.network.register(local, self.host)?;
        tracing::trace!("sim link bound at {}", local);
        Ok(Box::new(SimLink {
            network: Arc::clone(&self.network),
            local,
        }))
    }

    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, LinkError> {
        host.parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, port))
            .map_err(|_| LinkError::Unresolved(host.to_string()))
    }
}
