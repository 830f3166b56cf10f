//! Jitter/latency buffer
//!
//! Holds recovered packets until they can leave in sequence order. A packet
//! is released as soon as everything before it has been released; a missing
//! head is given up once the earliest buffered packet has waited for the
//! effective latency, so no packet is ever held longer than `max_latency`.
//!
//! The buffered map is keyed by raw sequence number, so the slot following
//! the head is found relative to `next_expected` rather than by map order.

use crate::config::{ErrorCorrectionConfig, LatencyMode};
use crate::packet::{null_filler, DEFAULT_PAYLOAD_SIZE};
use crate::recovery::{Origin, RecoveredPacket};
use crate::sequence::SeqNumber;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// Default bound on released packets waiting for the reader
pub const DEFAULT_OUTPUT_CAPACITY: usize = 8192;

const DYNAMIC_RTT_FACTOR: u32 = 4;
const MIN_DYNAMIC_LATENCY: Duration = Duration::from_millis(20);

/// Buffer settings, usually derived from [`ErrorCorrectionConfig`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitterConfig {
    pub max_latency: Duration,
    pub latency_mode: LatencyMode,
    pub stuff_null: bool,
    pub max_output_jitter: Duration,
    pub fixed_delay: bool,
    pub output_capacity: usize,
}

impl From<&ErrorCorrectionConfig> for JitterConfig {
    fn from(config: &ErrorCorrectionConfig) -> Self {
        JitterConfig {
            max_latency: config.max_latency,
            latency_mode: config.latency_mode,
            stuff_null: config.stuff_null_on_unrecovered,
            max_output_jitter: config.max_output_jitter,
            fixed_delay: config.fixed_end_to_end_delay,
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        }
    }
}

/// A packet (or filler) released to the read path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub seq: SeqNumber,
    pub payload: Bytes,
    /// Packets were given up between the previous delivery and this one
    pub discontinuity: bool,
    pub end_of_stream: bool,
    /// `None` for null filler standing in for an unrecovered packet
    pub origin: Option<Origin>,
    pub arrival: Instant,
    pub released: Instant,
}

impl Delivery {
    pub fn is_null(&self) -> bool {
        self.origin.is_none()
    }

    /// Time spent between arrival and release
    pub fn delay(&self) -> Duration {
        self.released.saturating_duration_since(self.arrival)
    }
}

/// Buffer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JitterStats {
    pub delivered: u64,
    pub bytes_delivered: u64,
    /// Sequence numbers given up
    pub skipped: u64,
    pub nulls_stuffed: u64,
    /// Released packets discarded because the reader fell behind
    pub dropped: u64,
    /// Packets arriving after their sequence number was passed
    pub late: u64,
    pub max_delay: Duration,
}

#[derive(Debug)]
enum Slot {
    Packet(RecoveredPacket),
    /// Declared irrecoverable upstream at the given instant
    Lost(Instant),
}

pub struct JitterBuffer {
    config: JitterConfig,
    slots: BTreeMap<SeqNumber, Slot>,
    next_expected: Option<SeqNumber>,
    increasing_latency: Duration,
    rtt: Duration,
    pending_discontinuity: bool,
    /// Release everything regardless of deadlines, see [`JitterBuffer::flush`]
    flushing: bool,
    last_payload_len: usize,
    /// Local instant and sender timestamp of the first packet seen
    pacing_base: Option<(Instant, u32)>,
    output: VecDeque<Delivery>,
    stats: JitterStats,
    interval_max_delay: Duration,
}

impl JitterBuffer {
    pub fn new(config: JitterConfig) -> Self {
        let increasing_latency = config.max_latency / 2;
        JitterBuffer {
            config,
            slots: BTreeMap::new(),
            next_expected: None,
            increasing_latency,
            rtt: Duration::from_millis(100),
            pending_discontinuity: false,
            flushing: false,
            last_payload_len: DEFAULT_PAYLOAD_SIZE,
            pacing_base: None,
            output: VecDeque::new(),
            stats: JitterStats::default(),
            interval_max_delay: Duration::ZERO,
        }
    }

    pub fn stats(&self) -> JitterStats {
        self.stats
    }

    pub fn next_expected(&self) -> Option<SeqNumber> {
        self.next_expected
    }

    /// Packets held back waiting for order
    pub fn buffered(&self) -> usize {
        self.slots.len()
    }

    /// Released packets not yet read
    pub fn ready(&self) -> usize {
        self.output.len()
    }

    /// Payload bytes released and not yet read
    pub fn ready_payload_bytes(&self) -> usize {
        self.output.iter().map(|d| d.payload.len()).sum()
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = rtt;
    }

    /// Latency budget currently applied to missing packets
    pub fn effective_latency(&self) -> Duration {
        let max = self.config.max_latency;
        match self.config.latency_mode {
            LatencyMode::Static => max,
            LatencyMode::Increasing => self.increasing_latency.min(max),
            LatencyMode::Dynamic => (self.rtt * DYNAMIC_RTT_FACTOR)
                .max(MIN_DYNAMIC_LATENCY)
                .min(max),
        }
    }

    /// Largest arrival-to-release delay since the previous call
    pub fn take_interval_max_delay(&mut self) -> Duration {
        std::mem::take(&mut self.interval_max_delay)
    }

    pub fn insert(&mut self, packet: RecoveredPacket) {
        let seq = packet.packet.seq;
        let next = *self.next_expected.get_or_insert(seq);
        if seq.lt(next) {
            self.stats.late += 1;
            return;
        }
        if self.pacing_base.is_none() {
            self.pacing_base = Some((packet.arrival, packet.packet.timestamp));
        }

        match self.slots.get(&seq) {
            Some(Slot::Packet(_)) => {}
            _ => {
                self.slots.insert(seq, Slot::Packet(packet));
            }
        }
    }

    /// Stop waiting for `seq`; it is skipped as soon as it reaches the head
    pub fn mark_lost(&mut self, seq: SeqNumber, now: Instant) {
        if self.next_expected.map_or(true, |next| seq.lt(next)) {
            return;
        }
        self.slots.entry(seq).or_insert(Slot::Lost(now));
    }

    /// Release everything that is due at `now`
    ///
    /// Returns the last sequence number released or skipped, if any.
    pub fn poll(&mut self, now: Instant) -> Option<SeqNumber> {
        let mut last_passed = None;

        while let Some(next) = self.next_expected {
            match self.slots.get(&next) {
                Some(Slot::Packet(packet)) => {
                    if !self.flushing && self.release_time(packet) > now {
                        break;
                    }
                    if let Some(Slot::Packet(packet)) = self.slots.remove(&next) {
                        self.emit(packet, now);
                    }
                }
                Some(Slot::Lost(_)) => {
                    self.slots.remove(&next);
                    self.skip(next, now);
                }
                None => {
                    let Some(first) = self.first_buffered_after(next) else {
                        break;
                    };
                    let gap = next.distance_to(first);
                    if gap <= 0 {
                        // Stale entry from before a sequence wrap.
                        self.slots.remove(&first);
                        continue;
                    }
                    let Some(earliest) = self.earliest_arrival() else {
                        break;
                    };
                    if !self.flushing && now < earliest + self.effective_latency() {
                        break;
                    }
                    tracing::debug!("giving up on {} packets from {}", gap, next);
                    self.skip_range(next, gap as u32, now);
                    self.on_give_up();
                    self.next_expected = Some(first);
                    last_passed = Some(first - 1);
                    continue;
                }
            }
            last_passed = Some(next);
            self.next_expected = Some(next.next());
        }

        last_passed
    }

    /// Release everything buffered, giving up on every hole
    ///
    /// Used when the sender closed the connection and nothing else can
    /// arrive.
    pub fn flush(&mut self, now: Instant) -> Option<SeqNumber> {
        self.flushing = true;
        let last = self.poll(now);
        self.flushing = false;
        last
    }

    pub fn pop(&mut self) -> Option<Delivery> {
        self.output.pop_front()
    }

    pub fn peek(&self) -> Option<&Delivery> {
        self.output.front()
    }

    /// Put a delivery back at the head of the output queue
    pub fn unpop(&mut self, delivery: Delivery) {
        self.output.push_front(delivery);
    }

    /// Start over after the sender restarted its sequence space
    pub fn resync(&mut self) {
        if self.next_expected.is_some() {
            self.pending_discontinuity = true;
        }
        self.slots.clear();
        self.next_expected = None;
        self.pacing_base = None;
    }

    /// Nearest buffered sequence number at or after `next`
    ///
    /// Everything buffered lies ahead of `next`, so when nothing sits above
    /// it in raw order the nearest slot is the lowest one past the wrap.
    fn first_buffered_after(&self, next: SeqNumber) -> Option<SeqNumber> {
        self.slots
            .range(next..)
            .next()
            .or_else(|| self.slots.iter().next())
            .map(|(seq, _)| *seq)
    }

    fn earliest_arrival(&self) -> Option<Instant> {
        self.slots
            .values()
            .map(|slot| match slot {
                Slot::Packet(p) => p.arrival,
                Slot::Lost(at) => *at,
            })
            .min()
    }

    fn pacing_delay(&self) -> Option<Duration> {
        if self.config.fixed_delay {
            Some(self.effective_latency())
        } else if !self.config.max_output_jitter.is_zero() {
            Some(self.config.max_output_jitter.min(self.effective_latency()))
        } else {
            None
        }
    }

    fn release_time(&self, packet: &RecoveredPacket) -> Instant {
        let Some(delay) = self.pacing_delay() else {
            return packet.arrival;
        };
        let Some((local_base, ts_base)) = self.pacing_base else {
            return packet.arrival;
        };

        let offset = packet.packet.timestamp.wrapping_sub(ts_base) as i32;
        let scheduled = local_base + Duration::from_micros(offset.max(0) as u64) + delay;
        let deadline = packet.arrival + self.config.max_latency;
        scheduled.min(deadline).max(packet.arrival)
    }

    fn on_give_up(&mut self) {
        if self.config.latency_mode == LatencyMode::Increasing {
            let grown = self.increasing_latency + self.increasing_latency / 10;
            self.increasing_latency = grown.min(self.config.max_latency);
        }
    }

    fn emit(&mut self, packet: RecoveredPacket, now: Instant) {
        let RecoveredPacket {
            packet,
            origin,
            arrival,
        } = packet;
        if !packet.payload.is_empty() {
            self.last_payload_len = packet.payload.len();
        }

        let delivery = Delivery {
            seq: packet.seq,
            discontinuity: std::mem::take(&mut self.pending_discontinuity),
            end_of_stream: packet.flags.end_of_stream,
            origin: Some(origin),
            arrival,
            released: now,
            payload: packet.payload,
        };

        let delay = delivery.delay();
        self.stats.max_delay = self.stats.max_delay.max(delay);
        self.interval_max_delay = self.interval_max_delay.max(delay);
        self.stats.delivered += 1;
        self.stats.bytes_delivered += delivery.payload.len() as u64;
        self.push_output(delivery);
    }

    /// Skip `count` sequence numbers with nothing buffered for them
    fn skip_range(&mut self, start: SeqNumber, count: u32, now: Instant) {
        for seq in start.span(count) {
            debug_assert!(!self.slots.contains_key(&seq));
            self.skip(seq, now);
        }
    }

    fn skip(&mut self, seq: SeqNumber, now: Instant) {
        self.stats.skipped += 1;
        if !self.config.stuff_null {
            self.pending_discontinuity = true;
            return;
        }

        self.stats.nulls_stuffed += 1;
        let discontinuity = std::mem::take(&mut self.pending_discontinuity);
        self.push_output(Delivery {
            seq,
            payload: null_filler(self.last_payload_len),
            discontinuity,
            end_of_stream: false,
            origin: None,
            arrival: now,
            released: now,
        });
    }

    fn push_output(&mut self, mut delivery: Delivery) {
        if self.output.len() >= self.config.output_capacity {
            self.output.pop_front();
            self.stats.dropped += 1;
            delivery.discontinuity = true;
        }
        self.output.push_back(delivery);
    }
}
