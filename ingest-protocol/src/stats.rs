//! Statistics snapshots
//!
//! Counters are monotonic for one connection lifetime. A fresh connect
//! starts them over; a reconnect keeps them.

use crate::connection::ConnectionState;
use std::time::{Duration, Instant};

/// Default refresh cadence of [`StatsAggregator`]
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkStats {
    /// Datagrams carrying media or parity
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Sequence numbers missing on arrival, before any recovery
    pub packets_lost: u64,
    /// Packets discarded: late arrivals and reader overruns
    pub packets_dropped: u64,
    /// Received payload rate over the last refresh interval
    pub bitrate_bps: u64,
    pub rtt_ms: u32,
    /// `packets_lost` over packets expected
    pub loss_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCorrectionStats {
    pub arq_recovered: u64,
    pub fec_recovered: u64,
    /// Given up at the latency bound or on FEC window expiry
    pub not_recovered: u64,
    pub nulls_stuffed: u64,
    pub duplicates: u64,
    pub parity_received: u64,
    pub nak_requests: u64,
    /// Overhead currently requested from the sender, in percent
    pub fec_overhead: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub packets_delivered: u64,
    pub bytes_delivered: u64,
    /// Latency budget in effect
    pub latency_ms: u32,
    /// Largest arrival-to-delivery delay so far
    pub max_delay_ms: u32,
    pub reconnects: u32,
    /// Bitrate variant currently selected, 0 when none is advertised
    pub current_bitrate: u32,
    pub connected_for: Duration,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        ConnectionStats {
            state: ConnectionState::Disconnected,
            packets_delivered: 0,
            bytes_delivered: 0,
            latency_ms: 0,
            max_delay_ms: 0,
            reconnects: 0,
            current_bitrate: 0,
            connected_for: Duration::ZERO,
        }
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatsSnapshot {
    pub network: NetworkStats,
    pub error_correction: ErrorCorrectionStats,
    pub connection: ConnectionStats,
}

impl StatsSnapshot {
    /// Sum of the counters of `snapshots`; rates and gauges take the maximum
    pub fn merge<'a>(snapshots: impl IntoIterator<Item = &'a StatsSnapshot>) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for s in snapshots {
            let (n, e, c) = (&s.network, &s.error_correction, &s.connection);
            total.network.packets_received += n.packets_received;
            total.network.bytes_received += n.bytes_received;
            total.network.packets_lost += n.packets_lost;
            total.network.packets_dropped += n.packets_dropped;
            total.network.bitrate_bps += n.bitrate_bps;
            total.network.rtt_ms = total.network.rtt_ms.max(n.rtt_ms);
            total.network.loss_rate = total.network.loss_rate.max(n.loss_rate);

            total.error_correction.arq_recovered += e.arq_recovered;
            total.error_correction.fec_recovered += e.fec_recovered;
            total.error_correction.not_recovered += e.not_recovered;
            total.error_correction.nulls_stuffed += e.nulls_stuffed;
            total.error_correction.duplicates += e.duplicates;
            total.error_correction.parity_received += e.parity_received;
            total.error_correction.nak_requests += e.nak_requests;
            total.error_correction.fec_overhead =
                total.error_correction.fec_overhead.max(e.fec_overhead);

            total.connection.reconnects += c.reconnects;
            total.connection.latency_ms = total.connection.latency_ms.max(c.latency_ms);
            total.connection.max_delay_ms = total.connection.max_delay_ms.max(c.max_delay_ms);
            total.connection.current_bitrate =
                total.connection.current_bitrate.max(c.current_bitrate);
            total.connection.connected_for = total.connection.connected_for.max(c.connected_for);
        }
        total
    }
}

/// Caches snapshots for the refresh interval
///
/// Queries inside the interval return the cached copy; the bitrate is
/// computed from the byte counter over the time between two refreshes.
#[derive(Debug)]
pub struct StatsAggregator {
    interval: Duration,
    cached: Option<(Instant, StatsSnapshot)>,
    rate_base: (Instant, u64),
}

impl StatsAggregator {
    pub fn new(interval: Duration, now: Instant) -> Self {
        StatsAggregator {
            interval,
            cached: None,
            rate_base: (now, 0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Change the refresh cadence; a cached snapshot older than it is dropped
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Snapshot at `now`, calling `collect` only when the cache is stale
    pub fn snapshot<F>(&mut self, now: Instant, collect: F) -> StatsSnapshot
    where
        F: FnOnce() -> StatsSnapshot,
    {
        if let Some((taken, snapshot)) = &self.cached {
            if now.saturating_duration_since(*taken) < self.interval {
                return *snapshot;
            }
        }

        let mut snapshot = collect();
        let (base_time, base_bytes) = self.rate_base;
        let elapsed = now.saturating_duration_since(base_time).as_secs_f64();
        if elapsed > 0.0 {
            let bytes = snapshot.network.bytes_received.saturating_sub(base_bytes);
            snapshot.network.bitrate_bps = (bytes as f64 * 8.0 / elapsed) as u64;
        }
        self.rate_base = (now, snapshot.network.bytes_received);
        self.cached = Some((now, snapshot));
        snapshot
    }

    /// Forget everything, for a fresh connection lifetime
    pub fn reset(&mut self, now: Instant) {
        self.cached = None;
        self.rate_base = (now, 0);
    }
}
