//! Failover merger
//!
//! Every component delivers the same content. In the merging modes each
//! packet is keyed (by its RTP header or by a payload fingerprint) and the
//! first copy to arrive within the search window is forwarded; later copies
//! are counted as duplicates and dropped. A later copy under the same key
//! whose bytes differ is a mismatch and is dropped as well.
//!
//! Payload fingerprints are not unique within one stream (null-packet
//! datagrams, repeated PSI tables), so a fingerprint key also carries how
//! many times the same component sent those bytes inside the window. The
//! n-th repeat on one path matches the n-th repeat on another.
//!
//! In [`MergeMode::None`] only the highest-priority connected component is
//! forwarded and the others are ignored until it disconnects.

use bytes::Bytes;
use ingest_protocol::pipeline::Chunk;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use thiserror::Error;

const RTP_VERSION_2: u8 = 0x80;
const RTP_HEADER_SIZE: usize = 12;
/// Merged packets kept for the reader before the oldest are dropped
const OUTPUT_CAPACITY: usize = 16384;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("no components configured")]
    NoComponents,

    #[error("component {0} does not exist")]
    InvalidComponent(usize),
}

/// How copies from different components are matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Forward one component at a time, no matching
    None,
    /// Match by RTP sequence number, timestamp and SSRC
    #[default]
    Header,
    /// Match by payload bytes
    Content,
}

impl MergeMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MergeMode::None),
            1 => Some(MergeMode::Header),
            2 => Some(MergeMode::Content),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    #[default]
    Backup = 0,
    Primary = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergerConfig {
    /// How long a forwarded packet is remembered for matching
    pub search_window: Duration,
    pub mode: MergeMode,
    /// One entry per component, in component order
    pub priorities: Vec<Priority>,
}

/// One packet from a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInput {
    pub payload: Bytes,
    /// The component lost data right before this packet
    pub discontinuity: bool,
    pub end_of_stream: bool,
}

impl MergeInput {
    pub fn new(payload: Bytes) -> Self {
        MergeInput {
            payload,
            discontinuity: false,
            end_of_stream: false,
        }
    }
}

/// Packet of the merged output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPacket {
    pub payload: Bytes,
    pub component: usize,
    pub discontinuity: bool,
    pub end_of_stream: bool,
}

impl Chunk for MergedPacket {
    fn bytes(&self) -> &[u8] {
        &self.payload
    }

    fn discontinuity(&self) -> bool {
        self.discontinuity
    }

    fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    fn is_filler(&self) -> bool {
        ingest_protocol::packet::is_null_filler(&self.payload)
    }
}

/// Per-component contribution counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComponentStats {
    pub priority: Priority,
    pub connected: bool,
    /// Packets of this component that made it into the output
    pub contributed_packets: u64,
    pub contributed_bytes: u64,
    /// Copies that arrived after another component's
    pub duplicates: u64,
    /// Copies whose key matched but whose bytes did not
    pub mismatches: u64,
    /// How far this component's last copy trailed the first copy
    pub last_packet_latency_ms: u32,
    pub reached_end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergerStats {
    pub forwarded: u64,
    pub duplicates: u64,
    pub mismatches: u64,
    /// Packets of standby components ignored in [`MergeMode::None`]
    pub standby_ignored: u64,
    /// Changes of the forwarded component in [`MergeMode::None`]
    pub switches: u64,
    pub overflow: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PacketKey {
    Rtp { seq: u16, timestamp: u32, ssrc: u32 },
    Content { hash: u64, occurrence: u32 },
}

/// Repeats of one fingerprint on one component
struct Occurrence {
    count: u32,
    last: Instant,
}

struct Seen {
    first: Instant,
    payload: Bytes,
}

pub struct Merger {
    config: MergerConfig,
    components: Vec<ComponentStats>,
    seen: HashMap<PacketKey, Seen>,
    /// Insertion order of `seen`, for expiry
    seen_order: VecDeque<(Instant, PacketKey)>,
    /// Per component, fingerprint repeat counts within the window
    occurrences: Vec<HashMap<u64, Occurrence>>,
    occurrence_order: VecDeque<(Instant, usize, u64)>,
    active: Option<usize>,
    pending_discontinuity: bool,
    end_emitted: bool,
    output: VecDeque<MergedPacket>,
    stats: MergerStats,
}

impl Merger {
    pub fn new(config: MergerConfig) -> Result<Self, MergeError> {
        if config.priorities.is_empty() {
            return Err(MergeError::NoComponents);
        }
        let components: Vec<ComponentStats> = config
            .priorities
            .iter()
            .map(|&priority| ComponentStats {
                priority,
                ..ComponentStats::default()
            })
            .collect();
        let occurrences = components.iter().map(|_| HashMap::new()).collect();

        Ok(Merger {
            config,
            components,
            seen: HashMap::new(),
            seen_order: VecDeque::new(),
            occurrences,
            occurrence_order: VecDeque::new(),
            active: None,
            pending_discontinuity: false,
            end_emitted: false,
            output: VecDeque::new(),
            stats: MergerStats::default(),
        })
    }

    pub fn config(&self) -> &MergerConfig {
        &self.config
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn component_stats(&self) -> &[ComponentStats] {
        &self.components
    }

    pub fn stats(&self) -> MergerStats {
        self.stats
    }

    /// Component forwarded in [`MergeMode::None`]
    pub fn active_component(&self) -> Option<usize> {
        self.active
    }

    /// No component is left that could still deliver
    pub fn is_exhausted(&self) -> bool {
        self.components
            .iter()
            .all(|c| !c.connected || c.reached_end)
    }

    pub fn set_connected(&mut self, component: usize, connected: bool) -> Result<(), MergeError> {
        let stats = self
            .components
            .get_mut(component)
            .ok_or(MergeError::InvalidComponent(component))?;
        if stats.connected == connected {
            return Ok(());
        }
        stats.connected = connected;
        if connected {
            stats.reached_end = false;
        }
        tracing::debug!(
            "component {} {}",
            component,
            if connected { "connected" } else { "disconnected" }
        );

        self.elect_active();
        self.maybe_end();
        Ok(())
    }

    /// Feed one packet from `component`; true when it was forwarded
    pub fn on_packet(
        &mut self,
        component: usize,
        input: MergeInput,
        now: Instant,
    ) -> Result<bool, MergeError> {
        if component >= self.components.len() {
            return Err(MergeError::InvalidComponent(component));
        }
        if input.end_of_stream {
            self.components[component].reached_end = true;
            self.maybe_end();
            return Ok(false);
        }

        match self.config.mode {
            MergeMode::None => Ok(self.forward_active(component, input)),
            MergeMode::Header | MergeMode::Content => Ok(self.merge(component, input, now)),
        }
    }

    /// Forget keys older than the search window
    pub fn expire(&mut self, now: Instant) {
        while let Some((at, key)) = self.seen_order.front().copied() {
            if now.saturating_duration_since(at) < self.config.search_window {
                break;
            }
            self.seen_order.pop_front();
            self.seen.remove(&key);
        }
        while let Some((at, component, hash)) = self.occurrence_order.front().copied() {
            if now.saturating_duration_since(at) < self.config.search_window {
                break;
            }
            self.occurrence_order.pop_front();
            let repeats = &mut self.occurrences[component];
            if repeats.get(&hash).map_or(false, |o| o.last == at) {
                repeats.remove(&hash);
            }
        }
    }

    pub fn pop(&mut self) -> Option<MergedPacket> {
        self.output.pop_front()
    }

    pub fn ready(&self) -> usize {
        self.output.len()
    }

    fn forward_active(&mut self, component: usize, input: MergeInput) -> bool {
        if self.active != Some(component) {
            self.stats.standby_ignored += 1;
            return false;
        }
        let discontinuity = input.discontinuity || std::mem::take(&mut self.pending_discontinuity);
        self.emit(component, input.payload, discontinuity);
        true
    }

    fn merge(&mut self, component: usize, input: MergeInput, now: Instant) -> bool {
        self.expire(now);
        let key = self.key_of(component, &input.payload, now);

        if let Some(seen) = self.seen.get(&key) {
            let lag = now.saturating_duration_since(seen.first);
            let stats = &mut self.components[component];
            stats.last_packet_latency_ms = lag.as_millis().min(u32::MAX as u128) as u32;
            if seen.payload == input.payload {
                stats.duplicates += 1;
                self.stats.duplicates += 1;
            } else {
                stats.mismatches += 1;
                self.stats.mismatches += 1;
                tracing::debug!("component {} copy differs from forwarded packet", component);
            }
            return false;
        }

        self.seen.insert(
            key,
            Seen {
                first: now,
                payload: input.payload.clone(),
            },
        );
        self.seen_order.push_back((now, key));
        self.components[component].last_packet_latency_ms = 0;

        // A component-level gap is only a gap of the merged stream when no
        // other component can cover it.
        let covered = self.connected_count() > 1;
        let discontinuity = (input.discontinuity && !covered)
            || std::mem::take(&mut self.pending_discontinuity);
        self.emit(component, input.payload, discontinuity);
        true
    }

    fn emit(&mut self, component: usize, payload: Bytes, discontinuity: bool) {
        let stats = &mut self.components[component];
        stats.contributed_packets += 1;
        stats.contributed_bytes += payload.len() as u64;
        self.stats.forwarded += 1;

        let mut packet = MergedPacket {
            payload,
            component,
            discontinuity,
            end_of_stream: false,
        };
        if self.output.len() >= OUTPUT_CAPACITY {
            self.output.pop_front();
            self.stats.overflow += 1;
            packet.discontinuity = true;
        }
        self.output.push_back(packet);
    }

    fn key_of(&mut self, component: usize, payload: &[u8], now: Instant) -> PacketKey {
        if self.config.mode == MergeMode::Header {
            if let Some(key) = rtp_key(payload) {
                return key;
            }
        }
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        let hash = hasher.finish();

        let occurrence = match self.occurrences[component].get_mut(&hash) {
            Some(repeat) => {
                repeat.count += 1;
                repeat.last = now;
                repeat.count
            }
            None => {
                self.occurrences[component].insert(hash, Occurrence { count: 0, last: now });
                0
            }
        };
        self.occurrence_order.push_back((now, component, hash));
        PacketKey::Content { hash, occurrence }
    }

    fn connected_count(&self) -> usize {
        self.components.iter().filter(|c| c.connected).count()
    }

    /// Highest priority connected component, lowest index first
    fn elect_active(&mut self) {
        let best = self
            .components
            .iter()
            .enumerate()
            .filter(|(_, c)| c.connected)
            .max_by(|(ia, a), (ib, b)| a.priority.cmp(&b.priority).then(ib.cmp(ia)))
            .map(|(i, _)| i);

        if best != self.active {
            if self.active.is_some() {
                self.stats.switches += 1;
                self.pending_discontinuity = true;
            }
            tracing::info!("forwarding component {:?}", best);
            self.active = best;
        }
    }

    fn maybe_end(&mut self) {
        if self.end_emitted || !self.is_exhausted() {
            return;
        }
        if !self.components.iter().any(|c| c.reached_end) {
            return;
        }
        self.end_emitted = true;
        self.output.push_back(MergedPacket {
            payload: Bytes::new(),
            component: 0,
            discontinuity: false,
            end_of_stream: true,
        });
    }
}

fn rtp_key(payload: &[u8]) -> Option<PacketKey> {
    if payload.len() < RTP_HEADER_SIZE || payload[0] & 0xC0 != RTP_VERSION_2 {
        return None;
    }
    Some(PacketKey::Rtp {
        seq: u16::from_be_bytes([payload[2], payload[3]]),
        timestamp: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        ssrc: u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merger(mode: MergeMode) -> Merger {
        let mut merger = Merger::new(MergerConfig {
            search_window: Duration::from_millis(500),
            mode,
            priorities: vec![Priority::Primary, Priority::Backup],
        })
        .unwrap();
        merger.set_connected(0, true).unwrap();
        merger.set_connected(1, true).unwrap();
        merger
    }

    fn input(data: &[u8]) -> MergeInput {
        MergeInput::new(Bytes::copy_from_slice(data))
    }

    fn rtp(seq: u16, body: &[u8]) -> MergeInput {
        let mut data = vec![0x80, 33];
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&(seq as u32 * 3000).to_be_bytes());
        data.extend_from_slice(&0xABCDu32.to_be_bytes());
        data.extend_from_slice(body);
        input(&data)
    }

    #[test]
    fn test_first_copy_wins() {
        let now = Instant::now();
        let mut merger = merger(MergeMode::Content);
        assert!(merger.on_packet(1, input(b"one"), now).unwrap());
        assert!(!merger
            .on_packet(0, input(b"one"), now + Duration::from_millis(20))
            .unwrap());

        let out = merger.pop().unwrap();
        assert_eq!(out.component, 1);
        assert!(merger.pop().is_none());

        let stats = merger.component_stats();
        assert_eq!(stats[1].contributed_packets, 1);
        assert_eq!(stats[0].duplicates, 1);
        assert_eq!(stats[0].last_packet_latency_ms, 20);
    }

    #[test]
    fn test_header_mismatch_dropped() {
        let now = Instant::now();
        let mut merger = merger(MergeMode::Header);
        assert!(merger.on_packet(0, rtp(7, b"good"), now).unwrap());
        assert!(!merger.on_packet(1, rtp(7, b"evil"), now).unwrap());
        assert_eq!(merger.stats().mismatches, 1);
        assert_eq!(merger.component_stats()[1].mismatches, 1);
        assert_eq!(merger.ready(), 1);
    }

    #[test]
    fn test_repeated_payload_on_one_path_is_kept() {
        let now = Instant::now();
        for mode in [MergeMode::Content, MergeMode::Header] {
            let mut merger = merger(mode);
            assert!(merger.on_packet(0, input(b"same"), now).unwrap());
            assert!(merger.on_packet(0, input(b"same"), now).unwrap());
            assert!(!merger.on_packet(1, input(b"same"), now).unwrap());
            assert!(!merger.on_packet(1, input(b"same"), now).unwrap());
            // A third repeat only the backup has seen so far
            assert!(merger.on_packet(1, input(b"same"), now).unwrap());

            assert_eq!(merger.ready(), 3);
            let stats = merger.component_stats();
            assert_eq!(stats[0].contributed_packets, 2);
            assert_eq!(stats[0].duplicates, 0);
            assert_eq!(stats[1].duplicates, 2);
            assert_eq!(stats[1].contributed_packets, 1);
        }
    }

    #[test]
    fn test_repeat_count_restarts_after_window() {
        let now = Instant::now();
        let mut merger = merger(MergeMode::Content);
        assert!(merger.on_packet(0, input(b"psi"), now).unwrap());
        let later = now + Duration::from_millis(600);
        assert!(merger.on_packet(0, input(b"psi"), later).unwrap());
        assert!(!merger.on_packet(1, input(b"psi"), later).unwrap());
        assert_eq!(merger.component_stats()[1].duplicates, 1);
    }

    #[test]
    fn test_header_keys_across_rtp_sequence_wrap() {
        let now = Instant::now();
        let mut merger = merger(MergeMode::Header);
        for seq in [65534u16, 65535, 0, 1] {
            assert!(merger.on_packet(0, rtp(seq, b"frame"), now).unwrap());
        }
        for seq in [65534u16, 65535, 0, 1] {
            assert!(!merger.on_packet(1, rtp(seq, b"frame"), now).unwrap());
        }
        assert_eq!(merger.stats().forwarded, 4);
        assert_eq!(merger.stats().duplicates, 4);
    }

    #[test]
    fn test_window_expiry_forgets() {
        let now = Instant::now();
        let mut merger = merger(MergeMode::Content);
        merger.on_packet(0, input(b"x"), now).unwrap();
        assert!(merger
            .on_packet(1, input(b"x"), now + Duration::from_millis(600))
            .unwrap());
    }

    #[test]
    fn test_none_mode_follows_priority() {
        let now = Instant::now();
        let mut merger = merger(MergeMode::None);
        assert_eq!(merger.active_component(), Some(0));
        assert!(!merger.on_packet(1, input(b"b1"), now).unwrap());
        assert!(merger.on_packet(0, input(b"p1"), now).unwrap());

        merger.set_connected(0, false).unwrap();
        assert_eq!(merger.active_component(), Some(1));
        assert!(merger.on_packet(1, input(b"b2"), now).unwrap());

        let out: Vec<MergedPacket> = std::iter::from_fn(|| merger.pop()).collect();
        assert_eq!(out.len(), 2);
        assert!(!out[0].discontinuity);
        assert!(out[1].discontinuity);
        assert_eq!(merger.stats().switches, 1);
    }

    #[test]
    fn test_single_component_gap_propagates() {
        let now = Instant::now();
        let mut merger = merger(MergeMode::Content);
        merger.set_connected(1, false).unwrap();
        let mut gap = input(b"after gap");
        gap.discontinuity = true;
        merger.on_packet(0, gap, now).unwrap();
        assert!(merger.pop().unwrap().discontinuity);
    }

    #[test]
    fn test_end_when_all_finished() {
        let now = Instant::now();
        let mut merger = merger(MergeMode::Content);
        let eos = MergeInput {
            end_of_stream: true,
            ..input(b"")
        };
        merger.on_packet(0, eos.clone(), now).unwrap();
        assert!(merger.pop().is_none());
        merger.on_packet(1, eos, now).unwrap();
        assert!(merger.pop().unwrap().end_of_stream);
        assert!(merger.is_exhausted());
    }

    #[test]
    fn test_invalid_component() {
        let mut merger = merger(MergeMode::Content);
        assert_eq!(
            merger.on_packet(5, input(b"x"), Instant::now()),
            Err(MergeError::InvalidComponent(5))
        );
        assert!(Merger::new(MergerConfig {
            search_window: Duration::from_millis(1),
            mode: MergeMode::None,
            priorities: vec![],
        })
        .is_err());
    }
}
