//! Receive pipeline: recovery engine feeding the jitter buffer, and the
//! byte-oriented read path on top of it

use crate::config::ErrorCorrectionConfig;
use crate::error::ErrorCode;
use crate::jitter::{Delivery, JitterBuffer, JitterConfig};
use crate::loss::LossRange;
use crate::packet::DataPacket;
use crate::recovery::{RecoveryCounters, RecoveryEngine};
use crate::sequence::SeqNumber;
use crate::stats::{ErrorCorrectionStats, StatsSnapshot};
use std::time::{Duration, Instant};

/// Result of one successful read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Bytes written into the caller's buffer
    pub bytes: usize,
    /// Packets were lost before the first byte of this read
    pub discontinuity: bool,
    /// The finite stream ended with this read
    pub eof: bool,
    /// Bitrate variant the data belongs to, 0 when unknown
    pub bitrate: u32,
}

/// Unit handed to a [`ChunkReader`]
pub trait Chunk {
    fn bytes(&self) -> &[u8];
    /// Data was lost right before this chunk
    fn discontinuity(&self) -> bool;
    fn end_of_stream(&self) -> bool;
    /// Filler standing in for lost data
    fn is_filler(&self) -> bool;
}

impl Chunk for Delivery {
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
        self.is_null()
    }
}

/// Byte-oriented read over a queue of chunks
///
/// Whole chunks are copied while they fit; a chunk that does not fit is
/// copied partially and continues on the next call. A discontinuity is only
/// reported at the start of a read, so a read stops right before a chunk
/// that follows a gap.
#[derive(Debug)]
pub struct ChunkReader<C> {
    /// Chunk being copied out, with the offset reached so far
    partial: Option<(C, usize)>,
    suppressed_gap: bool,
    eof_reached: bool,
}

impl<C> Default for ChunkReader<C> {
    fn default() -> Self {
        ChunkReader {
            partial: None,
            suppressed_gap: false,
            eof_reached: false,
        }
    }
}

impl<C: Chunk> ChunkReader<C> {
    pub fn is_eof(&self) -> bool {
        self.eof_reached
    }

    /// Bytes of the partially read chunk still to be returned
    pub fn pending_bytes(&self) -> usize {
        self.partial
            .as_ref()
            .map_or(0, |(chunk, offset)| chunk.bytes().len() - offset)
    }

    pub fn read(
        &mut self,
        buf: &mut [u8],
        full_frames: bool,
        mut next: impl FnMut() -> Option<C>,
    ) -> Result<ReadOutcome, ErrorCode> {
        if self.eof_reached {
            return Err(ErrorCode::EndOfFile);
        }
        if buf.is_empty() {
            return Err(ErrorCode::InvalidParameter);
        }

        let mut outcome = ReadOutcome::default();
        let mut written = 0;

        loop {
            let (chunk, offset) = match self.partial.take() {
                Some(partial) => partial,
                None => match next() {
                    Some(chunk) => (chunk, 0),
                    None => break,
                },
            };

            if offset == 0 {
                if full_frames && chunk.is_filler() {
                    self.suppressed_gap = true;
                    continue;
                }
                if chunk.discontinuity() || self.suppressed_gap {
                    if written > 0 {
                        self.partial = Some((chunk, 0));
                        break;
                    }
                    self.suppressed_gap = false;
                    outcome.discontinuity = true;
                }
            }

            let remaining = &chunk.bytes()[offset..];
            let n = remaining.len().min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&remaining[..n]);
            written += n;

            if n < remaining.len() {
                self.partial = Some((chunk, offset + n));
                break;
            }
            if chunk.end_of_stream() {
                outcome.eof = true;
                self.eof_reached = true;
                break;
            }
            if written == buf.len() {
                break;
            }
        }

        outcome.bytes = written;
        if written == 0 && !outcome.eof {
            return Err(ErrorCode::NotReady);
        }
        Ok(outcome)
    }
}

/// Counters gathered over one adaptive sampling interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalCounters {
    pub received: u64,
    pub lost: u64,
    pub not_recovered: u64,
    pub bytes_delivered: u64,
    pub max_delay: Duration,
}

pub struct ReceivePipeline {
    engine: RecoveryEngine,
    jitter: JitterBuffer,
    reader: ChunkReader<Delivery>,
    packets_received: u64,
    bytes_received: u64,
    interval_base: (RecoveryCounters, u64, u64),
}

impl ReceivePipeline {
    pub fn new(config: &ErrorCorrectionConfig) -> Self {
        ReceivePipeline {
            engine: RecoveryEngine::new(config.recovery_mode(), config.fec_block),
            jitter: JitterBuffer::new(JitterConfig::from(config)),
            reader: ChunkReader::default(),
            packets_received: 0,
            bytes_received: 0,
            interval_base: (RecoveryCounters::default(), 0, 0),
        }
    }

    pub fn engine(&self) -> &RecoveryEngine {
        &self.engine
    }

    pub fn jitter(&self) -> &JitterBuffer {
        &self.jitter
    }

    /// Data or parity packet from the network
    pub fn on_packet(&mut self, packet: DataPacket, now: Instant) {
        self.packets_received += 1;
        self.bytes_received += packet.payload.len() as u64;
        for recovered in self.engine.on_packet(packet, now) {
            self.jitter.insert(recovered);
        }
    }

    /// Timer tick; returns the loss ranges to NAK
    pub fn poll(&mut self, now: Instant) -> Vec<LossRange> {
        let outcome = self.engine.poll(now);
        for seq in outcome.irrecoverable {
            self.jitter.mark_lost(seq, now);
        }
        if let Some(last) = self.jitter.poll(now) {
            self.engine.release_up_to(last);
        }
        outcome.nak
    }

    /// Sender closed the connection: release whatever is still buffered
    pub fn flush(&mut self, now: Instant) {
        if let Some(last) = self.jitter.flush(now) {
            self.engine.release_up_to(last);
        }
    }

    /// Sequence number to acknowledge, see [`RecoveryEngine::ack_point`]
    pub fn ack_point(&self) -> Option<SeqNumber> {
        self.engine.ack_point()
    }

    pub fn set_rtt(&mut self, rtt: Duration) {
        self.engine.set_rtt(rtt);
        self.jitter.set_rtt(rtt);
    }

    /// The sender started a new sequence space (new connection id)
    pub fn resync(&mut self) {
        self.engine.resync();
        self.jitter.resync();
    }

    pub fn is_eof(&self) -> bool {
        self.reader.is_eof()
    }

    /// Copy ready data into `buf`, see [`ChunkReader::read`]
    pub fn read(&mut self, buf: &mut [u8], full_frames: bool) -> Result<ReadOutcome, ErrorCode> {
        let jitter = &mut self.jitter;
        self.reader.read(buf, full_frames, || jitter.pop())
    }

    /// Next released packet, bypassing the byte reader
    ///
    /// Used when a failover group consumes a component packet by packet.
    pub fn pop_delivery(&mut self) -> Option<Delivery> {
        self.jitter.pop()
    }

    /// Bytes of released data not yet read
    pub fn ready_bytes(&self) -> usize {
        self.reader.pending_bytes() + self.jitter.ready_payload_bytes()
    }

    pub fn error_correction_stats(&self) -> ErrorCorrectionStats {
        let counters = self.engine.counters();
        let jitter = self.jitter.stats();
        ErrorCorrectionStats {
            arq_recovered: counters.arq_recovered,
            fec_recovered: counters.fec_recovered,
            not_recovered: jitter.skipped,
            nulls_stuffed: jitter.nulls_stuffed,
            duplicates: counters.duplicates,
            parity_received: counters.parity_received,
            nak_requests: counters.nak_requests,
            fec_overhead: 0,
        }
    }

    /// Fill the pipeline's share of a snapshot
    pub fn fill_stats(&self, snapshot: &mut StatsSnapshot) {
        let counters = self.engine.counters();
        let jitter = self.jitter.stats();

        let network = &mut snapshot.network;
        network.packets_received = self.packets_received;
        network.bytes_received = self.bytes_received;
        network.packets_lost = counters.detected_lost;
        network.packets_dropped = counters.late + jitter.late + jitter.dropped;
        let expected = counters.received - counters.arq_recovered + counters.detected_lost;
        network.loss_rate = if expected > 0 {
            counters.detected_lost as f64 / expected as f64
        } else {
            0.0
        };

        let overhead = snapshot.error_correction.fec_overhead;
        snapshot.error_correction = ErrorCorrectionStats {
            fec_overhead: overhead,
            ..self.error_correction_stats()
        };

        let connection = &mut snapshot.connection;
        connection.packets_delivered = jitter.delivered;
        connection.bytes_delivered = jitter.bytes_delivered;
        connection.latency_ms = self.jitter.effective_latency().as_millis() as u32;
        connection.max_delay_ms = jitter.max_delay.as_millis() as u32;
    }

    /// Counters accumulated since the previous call
    pub fn take_interval(&mut self) -> IntervalCounters {
        let counters = self.engine.counters();
        let jitter = self.jitter.stats();
        let (base, base_skipped, base_bytes) = self.interval_base;
        self.interval_base = (counters, jitter.skipped, jitter.bytes_delivered);

        IntervalCounters {
            received: counters.received - base.received,
            lost: counters.detected_lost - base.detected_lost,
            not_recovered: jitter.skipped - base_skipped,
            bytes_delivered: jitter.bytes_delivered - base_bytes,
            max_delay: self.jitter.take_interval_max_delay(),
        }
    }
}
