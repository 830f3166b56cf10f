//! Receiver-side loss recovery
//!
//! The engine sits between the socket and the jitter buffer. It filters
//! duplicates, tracks gaps in the sequence space, schedules NAKs and
//! rebuilds missing packets from parity. Whatever arrives first for a given
//! sequence number wins; later copies are counted as duplicates.

use crate::config::RecoveryMode;
use crate::fec::{self, FecError};
use crate::loss::{LossList, LossRange};
use crate::packet::DataPacket;
use crate::sequence::SeqNumber;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Number of recently received packets kept for duplicate detection and FEC
pub const RECEIVED_HISTORY: usize = 4096;

/// Gaps wider than this are treated as a stream restart, not as loss
pub const MAX_TRACKED_GAP: u32 = RECEIVED_HISTORY as u32;

const MAX_NAK_COUNT: u32 = 16;
const MIN_NAK_INTERVAL: Duration = Duration::from_millis(10);
const MAX_OPEN_WINDOWS: usize = 256;
const CLOSED_WINDOW_LINGER: Duration = Duration::from_secs(1);

/// How a packet reached the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Network,
    Arq,
    Fec,
}

/// Packet handed to the jitter buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredPacket {
    pub packet: DataPacket,
    pub origin: Origin,
    /// Arrival of the packet, or of the symbol that completed its block
    pub arrival: Instant,
}

/// Engine counters, monotonic for the engine's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryCounters {
    /// First copies of source packets from the network, retransmissions included
    pub received: u64,
    pub parity_received: u64,
    /// Sequence numbers found missing when a later packet arrived
    pub detected_lost: u64,
    pub arq_recovered: u64,
    pub fec_recovered: u64,
    pub duplicates: u64,
    /// Packets behind the delivery point
    pub late: u64,
    /// Sequence numbers requested through NAKs
    pub nak_requests: u64,
    /// Packets declared lost when their FEC window expired
    pub irrecoverable: u64,
}

/// One FEC block on the receiving side
#[derive(Debug)]
pub struct RecoveryWindow {
    base: SeqNumber,
    source_count: usize,
    parity_count: usize,
    session_id: u32,
    parities: BTreeMap<usize, Bytes>,
    opened: Instant,
    deadline: Instant,
    closed: bool,
}

impl RecoveryWindow {
    pub fn new(
        base: SeqNumber,
        source_count: usize,
        parity_count: usize,
        session_id: u32,
        now: Instant,
        span: Duration,
    ) -> Self {
        RecoveryWindow {
            base,
            source_count,
            parity_count,
            session_id,
            parities: BTreeMap::new(),
            opened: now,
            deadline: now + span,
            closed: false,
        }
    }

    pub fn base(&self) -> SeqNumber {
        self.base
    }

    pub fn source_count(&self) -> usize {
        self.source_count
    }

    pub fn parity_count(&self) -> usize {
        self.parity_count
    }

    pub fn parity_received(&self) -> usize {
        self.parities.len()
    }

    pub fn opened(&self) -> Instant {
        self.opened
    }

    pub fn contains(&self, seq: SeqNumber) -> bool {
        let offset = self.base.distance_to(seq);
        offset >= 0 && (offset as usize) < self.source_count
    }

    pub fn last(&self) -> SeqNumber {
        self.base + (self.source_count as u32).saturating_sub(1)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    fn sources(&self) -> impl Iterator<Item = SeqNumber> {
        self.base.span(self.source_count as u32)
    }
}

/// What the receiver should do after a timer tick
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Ranges to request again
    pub nak: Vec<LossRange>,
    /// Sequence numbers no longer worth waiting for
    pub irrecoverable: Vec<SeqNumber>,
}

enum DecodeAttempt {
    Pending,
    Complete,
    Rebuilt(Vec<(usize, Vec<u8>)>),
    Failed(FecError),
}

/// FEC/ARQ recovery for one connection
pub struct RecoveryEngine {
    mode: RecoveryMode,
    fec_block: Duration,
    received: BTreeMap<SeqNumber, DataPacket>,
    /// Keys of `received` in arrival order; raw order breaks at a wrap
    history: VecDeque<SeqNumber>,
    highest: Option<SeqNumber>,
    floor: Option<SeqNumber>,
    loss: LossList,
    windows: VecDeque<RecoveryWindow>,
    counters: RecoveryCounters,
}

impl RecoveryEngine {
    pub fn new(mode: RecoveryMode, fec_block: Duration) -> Self {
        let mut loss = LossList::new(MAX_NAK_COUNT, Duration::from_millis(100));
        if mode.uses_fec() {
            // Give parity one block to arrive before asking for a resend.
            loss.set_first_nak_delay(fec_block);
        }

        RecoveryEngine {
            mode,
            fec_block,
            received: BTreeMap::new(),
            history: VecDeque::new(),
            highest: None,
            floor: None,
            loss,
            windows: VecDeque::new(),
            counters: RecoveryCounters::default(),
        }
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    pub fn counters(&self) -> RecoveryCounters {
        self.counters
    }

    /// Outstanding missing sequence numbers
    pub fn pending_losses(&self) -> usize {
        self.loss.len()
    }

    pub fn open_windows(&self) -> usize {
        self.windows.iter().filter(|w| !w.closed).count()
    }

    /// First sequence number not yet received contiguously
    ///
    /// Reported to the sender so it can release everything below it.
    pub fn ack_point(&self) -> Option<SeqNumber> {
        let highest = self.highest?;
        Some(self.loss.first().unwrap_or(highest.next()))
    }

    /// NAKs are repeated at most once per round trip
    pub fn set_rtt(&mut self, rtt: Duration) {
        self.loss.set_nak_interval(rtt.max(MIN_NAK_INTERVAL));
    }

    /// Feed one data or parity packet
    ///
    /// Returns the packets that became available: the packet itself when it
    /// is a first copy, plus anything rebuilt from parity as a result.
    pub fn on_packet(&mut self, packet: DataPacket, now: Instant) -> Vec<RecoveredPacket> {
        if packet.is_parity() {
            if !self.mode.uses_fec() {
                return Vec::new();
            }
            self.counters.parity_received += 1;
            return self.on_parity(packet, now);
        }

        let seq = packet.seq;
        if self.is_late(seq) {
            self.counters.late += 1;
            return Vec::new();
        }
        if self.received.contains_key(&seq) {
            self.counters.duplicates += 1;
            tracing::trace!("duplicate {}", seq);
            return Vec::new();
        }

        self.track_gap(seq, now);
        let was_missing = self.loss.remove(seq);
        let origin = if packet.flags.retransmitted && was_missing {
            self.counters.arq_recovered += 1;
            Origin::Arq
        } else {
            Origin::Network
        };
        self.counters.received += 1;
        self.remember(packet.clone());

        let mut out = vec![RecoveredPacket {
            packet,
            origin,
            arrival: now,
        }];
        if let Some(idx) = self.windows.iter().position(|w| !w.closed && w.contains(seq)) {
            out.extend(self.try_decode(idx, now));
        }
        out
    }

    /// Timer tick: NAKs that are due and windows that ran out of time
    pub fn poll(&mut self, now: Instant) -> PollOutcome {
        let mut outcome = PollOutcome::default();

        if self.mode.uses_arq() {
            outcome.nak = self.loss.nak_ranges(now);
            self.counters.nak_requests += outcome.nak.iter().map(|r| r.len() as u64).sum::<u64>();
        }

        let fec_only = !self.mode.uses_arq();
        for idx in 0..self.windows.len() {
            let window = &self.windows[idx];
            if window.closed || !window.is_expired(now) {
                continue;
            }
            if fec_only {
                let missing: Vec<SeqNumber> = window
                    .sources()
                    .filter(|s| !self.received.contains_key(s) && !self.is_late(*s))
                    .collect();
                for seq in &missing {
                    self.loss.remove(*seq);
                }
                if !missing.is_empty() {
                    tracing::debug!(
                        "FEC block {} expired with {} packets missing",
                        self.windows[idx].base,
                        missing.len()
                    );
                }
                self.counters.irrecoverable += missing.len() as u64;
                outcome.irrecoverable.extend(missing);
            }
            self.windows[idx].closed = true;
        }

        self.windows.retain(|w| {
            !w.closed || now.saturating_duration_since(w.deadline) < CLOSED_WINDOW_LINGER
        });

        outcome
    }

    /// Everything up to and including `seq` has been delivered or given up
    pub fn release_up_to(&mut self, seq: SeqNumber) {
        let floor = seq.next();
        if self.floor.map_or(true, |f| floor.gt(f)) {
            self.floor = Some(floor);
        }
        self.loss.remove_up_to(seq);
        self.windows.retain(|w| w.last().ge(floor));
    }

    /// Forget the sequence space after the sender restarted its stream
    ///
    /// Counters survive so statistics stay monotonic across a reconnect.
    pub fn resync(&mut self) {
        self.received.clear();
        self.history.clear();
        self.highest = None;
        self.floor = None;
        self.loss.clear();
        self.windows.clear();
    }

    fn is_late(&self, seq: SeqNumber) -> bool {
        self.floor.map_or(false, |floor| seq.lt(floor))
    }

    fn track_gap(&mut self, seq: SeqNumber, now: Instant) {
        let Some(highest) = self.highest else {
            self.highest = Some(seq);
            return;
        };
        if !seq.gt(highest) {
            return;
        }

        let gap = highest.distance_to(seq) as u32 - 1;
        if gap > MAX_TRACKED_GAP {
            tracing::warn!("sequence jumped from {} to {}, not tracking as loss", highest, seq);
        } else if gap > 0 {
            let range = LossRange::new(highest.next(), seq - 1);
            self.counters.detected_lost += gap as u64;
            self.loss.add_range(range, now);
            tracing::trace!("gap {}..={}", range.start, range.end);
        }
        self.highest = Some(seq);
    }

    fn remember(&mut self, packet: DataPacket) {
        let seq = packet.seq;
        if self.received.insert(seq, packet).is_none() {
            self.history.push_back(seq);
        }
        while self.history.len() > RECEIVED_HISTORY {
            if let Some(oldest) = self.history.pop_front() {
                self.received.remove(&oldest);
            }
        }
    }

    fn on_parity(&mut self, packet: DataPacket, now: Instant) -> Vec<RecoveredPacket> {
        let Some(info) = packet.flags.parity else {
            return Vec::new();
        };
        let base = packet.seq;
        let source_count = info.source_count as usize;
        if source_count == 0 {
            return Vec::new();
        }
        let last = base + (source_count as u32 - 1);
        if self.is_late(last) {
            self.counters.late += 1;
            return Vec::new();
        }

        let idx = match self.windows.iter().position(|w| w.base == base) {
            Some(idx) => idx,
            None => {
                if self.windows.len() >= MAX_OPEN_WINDOWS {
                    self.windows.pop_front();
                }
                self.windows.push_back(RecoveryWindow::new(
                    base,
                    source_count,
                    info.parity_count as usize,
                    packet.session_id,
                    now,
                    self.fec_block,
                ));
                self.windows.len() - 1
            }
        };

        let window = &mut self.windows[idx];
        if window.closed {
            return Vec::new();
        }
        if window
            .parities
            .insert(info.index as usize, packet.payload)
            .is_some()
        {
            self.counters.duplicates += 1;
            return Vec::new();
        }

        self.try_decode(idx, now)
    }

    fn decode_attempt(&self, idx: usize) -> DecodeAttempt {
        let window = &self.windows[idx];
        let have: Vec<Option<&DataPacket>> =
            window.sources().map(|s| self.received.get(&s)).collect();
        let present = have.iter().filter(|p| p.is_some()).count();

        if present == window.source_count {
            return DecodeAttempt::Complete;
        }
        if window.parities.is_empty() || present + window.parities.len() < window.source_count {
            return DecodeAttempt::Pending;
        }

        let width = window.parities.values().map(Bytes::len).max().unwrap_or(0);
        let symbols: Vec<Option<Vec<u8>>> = have
            .iter()
            .map(|p| p.map(|p| fec::source_symbol(p, width)))
            .collect();
        let sources: Vec<Option<&[u8]>> = symbols.iter().map(|s| s.as_deref()).collect();
        let parities: Vec<(usize, &[u8])> = window
            .parities
            .iter()
            .map(|(row, p)| (*row, p.as_ref()))
            .collect();

        match fec::reconstruct(&sources, &parities) {
            Ok(rebuilt) => DecodeAttempt::Rebuilt(rebuilt),
            Err(e) => DecodeAttempt::Failed(e),
        }
    }

    fn try_decode(&mut self, idx: usize, now: Instant) -> Vec<RecoveredPacket> {
        let attempt = self.decode_attempt(idx);
        let base = self.windows[idx].base;
        let session_id = self.windows[idx].session_id;

        match attempt {
            DecodeAttempt::Pending => Vec::new(),
            DecodeAttempt::Complete => {
                self.windows[idx].closed = true;
                Vec::new()
            }
            DecodeAttempt::Failed(e) => {
                self.windows[idx].closed = true;
                tracing::warn!("FEC block {} could not be decoded: {}", base, e);
                Vec::new()
            }
            DecodeAttempt::Rebuilt(rebuilt) => {
                self.windows[idx].closed = true;
                let mut out = Vec::with_capacity(rebuilt.len());
                for (index, symbol) in rebuilt {
                    let seq = base + index as u32;
                    if self.is_late(seq) || self.received.contains_key(&seq) {
                        continue;
                    }
                    match fec::packet_from_symbol(seq, session_id, &symbol) {
                        Ok(packet) => {
                            self.track_gap(seq, now);
                            self.loss.remove(seq);
                            self.counters.fec_recovered += 1;
                            self.remember(packet.clone());
                            out.push(RecoveredPacket {
                                packet,
                                origin: Origin::Fec,
                                arrival: now,
                            });
                        }
                        Err(e) => tracing::warn!("rebuilt symbol for {} unusable: {}", seq, e),
                    }
                }
                tracing::debug!("FEC block {} rebuilt {} packets", base, out.len());
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::FecEncoder;
    use crate::sequence::MAX_SEQ_NUMBER;

    fn source(seq: u32) -> DataPacket {
        DataPacket::new(
            SeqNumber::new(seq),
            seq * 100,
            9,
            Bytes::from(vec![seq as u8; 20 + seq as usize % 7]),
        )
    }

    fn block(count: u32, overhead: u8, start: Instant) -> (Vec<DataPacket>, Vec<DataPacket>) {
        let mut encoder = FecEncoder::new(Duration::from_secs(10), overhead, false);
        let sources: Vec<DataPacket> = (0..count).map(source).collect();
        for packet in &sources {
            assert!(encoder.push(packet, start).is_empty());
        }
        (sources, encoder.flush())
    }

    #[test]
    fn test_in_order_delivery() {
        let now = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::Arq, Duration::from_millis(50));
        for seq in 0..5 {
            let out = engine.on_packet(source(seq), now);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].origin, Origin::Network);
        }
        assert_eq!(engine.pending_losses(), 0);
        assert_eq!(engine.counters().received, 5);
    }

    #[test]
    fn test_duplicates_counted() {
        let now = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::Arq, Duration::from_millis(50));
        engine.on_packet(source(1), now);
        assert!(engine.on_packet(source(1), now).is_empty());
        assert_eq!(engine.counters().duplicates, 1);
    }

    #[test]
    fn test_gap_naks_then_arq_recovery() {
        let start = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::Arq, Duration::from_millis(50));
        engine.set_rtt(Duration::from_millis(20));
        engine.on_packet(source(0), start);
        engine.on_packet(source(3), start);
        assert_eq!(engine.counters().detected_lost, 2);

        let outcome = engine.poll(start);
        assert_eq!(
            outcome.nak,
            vec![LossRange::new(SeqNumber::new(1), SeqNumber::new(2))]
        );
        assert!(engine.poll(start + Duration::from_millis(5)).nak.is_empty());

        let mut resent = source(1);
        resent.flags.retransmitted = true;
        let out = engine.on_packet(resent, start + Duration::from_millis(30));
        assert_eq!(out[0].origin, Origin::Arq);
        assert_eq!(engine.counters().arq_recovered, 1);
        assert_eq!(engine.pending_losses(), 1);
    }

    #[test]
    fn test_fec_rebuilds_bit_identical() {
        let now = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::Fec, Duration::from_millis(50));
        let (sources, parity) = block(10, 20, now);
        assert_eq!(parity.len(), 2);

        for packet in sources.iter().filter(|p| p.seq.as_raw() != 3 && p.seq.as_raw() != 7) {
            engine.on_packet(packet.clone(), now);
        }
        assert!(engine.on_packet(parity[0].clone(), now).is_empty());
        let rebuilt = engine.on_packet(parity[1].clone(), now);

        assert_eq!(rebuilt.len(), 2);
        for packet in rebuilt {
            assert_eq!(packet.origin, Origin::Fec);
            assert_eq!(packet.packet, sources[packet.packet.seq.as_raw() as usize]);
        }
        assert_eq!(engine.counters().fec_recovered, 2);
        assert_eq!(engine.pending_losses(), 0);
    }

    #[test]
    fn test_late_retransmission_after_fec_is_duplicate() {
        let now = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::FecArq, Duration::from_millis(50));
        let (sources, parity) = block(4, 25, now);
        for packet in sources.iter().filter(|p| p.seq.as_raw() != 2) {
            engine.on_packet(packet.clone(), now);
        }
        assert_eq!(engine.on_packet(parity[0].clone(), now).len(), 1);

        let mut resent = sources[2].clone();
        resent.flags.retransmitted = true;
        assert!(engine.on_packet(resent, now).is_empty());
        assert_eq!(engine.counters().duplicates, 1);
        assert_eq!(engine.counters().arq_recovered, 0);
    }

    #[test]
    fn test_fec_only_window_expiry() {
        let start = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::Fec, Duration::from_millis(50));
        let (sources, parity) = block(6, 20, start);
        for packet in sources.iter().filter(|p| p.seq.as_raw() > 2) {
            engine.on_packet(packet.clone(), start);
        }
        engine.on_packet(parity[0].clone(), start);

        assert!(engine.poll(start + Duration::from_millis(10)).irrecoverable.is_empty());
        let outcome = engine.poll(start + Duration::from_millis(60));
        assert!(outcome.nak.is_empty());
        assert_eq!(
            outcome.irrecoverable,
            vec![SeqNumber::new(0), SeqNumber::new(1), SeqNumber::new(2)]
        );
        assert_eq!(engine.counters().irrecoverable, 3);
    }

    #[test]
    fn test_fec_arq_waits_a_block_before_nak() {
        let start = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::FecArq, Duration::from_millis(50));
        engine.on_packet(source(0), start);
        engine.on_packet(source(2), start);
        assert!(engine.poll(start + Duration::from_millis(20)).nak.is_empty());
        assert_eq!(engine.poll(start + Duration::from_millis(50)).nak.len(), 1);
    }

    #[test]
    fn test_release_drops_late_packets() {
        let now = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::Arq, Duration::from_millis(50));
        engine.on_packet(source(0), now);
        engine.on_packet(source(5), now);
        engine.release_up_to(SeqNumber::new(4));
        assert_eq!(engine.pending_losses(), 0);
        assert!(engine.on_packet(source(2), now).is_empty());
        assert_eq!(engine.counters().late, 1);
    }

    #[test]
    fn test_duplicate_history_survives_sequence_wrap() {
        let now = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::Arq, Duration::from_millis(50));
        let packet = |seq: SeqNumber| DataPacket::new(seq, 0, 9, Bytes::from_static(b"ts"));
        let start = SeqNumber::new(MAX_SEQ_NUMBER - 9);
        for seq in start.span(RECEIVED_HISTORY as u32 + 1) {
            assert_eq!(engine.on_packet(packet(seq), now).len(), 1);
        }

        // Only the oldest packet, from before the wrap, was forgotten
        assert!(engine.on_packet(packet(SeqNumber::ZERO), now).is_empty());
        assert!(engine.on_packet(packet(start + 1), now).is_empty());
        assert_eq!(engine.counters().duplicates, 2);
    }

    #[test]
    fn test_parity_ignored_without_fec() {
        let now = Instant::now();
        let mut engine = RecoveryEngine::new(RecoveryMode::Arq, Duration::from_millis(50));
        let (_, parity) = block(4, 50, now);
        assert!(engine.on_packet(parity[0].clone(), now).is_empty());
        assert_eq!(engine.counters().parity_received, 0);
    }
}
