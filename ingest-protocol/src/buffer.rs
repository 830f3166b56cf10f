//! Sender-side retransmission buffer
//!
//! Sent packets are kept in a circular buffer indexed by sequence number so a
//! NAK can be answered without searching. Packets leave the buffer when the
//! receiver acknowledges them or when they are older than the receiver's
//! latency budget and a resend could no longer be delivered in time.

use crate::packet::DataPacket;
use crate::sequence::SeqNumber;
use bytes::Bytes;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Packet not found: {0}")]
    NotFound(SeqNumber),
}

#[derive(Clone)]
struct StoredPacket {
    packet: DataPacket,
    first_sent: Instant,
    last_sent: Instant,
    send_count: u32,
}

/// Circular send buffer
pub struct SendBuffer {
    buffer: Vec<Option<StoredPacket>>,
    capacity: usize,
    /// capacity - 1, capacity being a power of two
    mask: usize,
    session_id: u32,
    next_seq: SeqNumber,
    oldest: SeqNumber,
    ttl: Duration,
    retransmitted: u64,
}

impl SendBuffer {
    /// `capacity` is rounded up to a power of two; packets older than `ttl`
    /// are not resent
    pub fn new(capacity: usize, ttl: Duration, session_id: u32) -> Self {
        let capacity = capacity.next_power_of_two();

        SendBuffer {
            buffer: vec![None; capacity],
            capacity,
            mask: capacity - 1,
            session_id,
            next_seq: SeqNumber::ZERO,
            oldest: SeqNumber::ZERO,
            ttl,
            retransmitted: 0,
        }
    }

    #[inline]
    fn index(&self, seq: SeqNumber) -> usize {
        (seq.as_raw() as usize) & self.mask
    }

    /// Store a new packet and return it with its assigned sequence number
    pub fn push(
        &mut self,
        payload: Bytes,
        timestamp: u32,
        now: Instant,
    ) -> DataPacket {
        if self.len() >= self.capacity {
            self.drop_expired(now);
            if self.len() >= self.capacity {
                // Oldest entry is evicted: it cannot be resent anyway once
                // the buffer wrapped over it.
                self.evict_oldest();
            }
        }

        let packet = DataPacket::new(self.next_seq, timestamp, self.session_id, payload);
        self.store(packet.clone(), now);
        packet
    }

    /// Store a final end-of-stream marker
    pub fn push_end_of_stream(&mut self, timestamp: u32, now: Instant) -> DataPacket {
        if self.len() >= self.capacity {
            self.evict_oldest();
        }
        let packet = DataPacket::end_of_stream(self.next_seq, timestamp, self.session_id);
        self.store(packet.clone(), now);
        packet
    }

    fn store(&mut self, packet: DataPacket, now: Instant) {
        let idx = self.index(packet.seq);
        self.buffer[idx] = Some(StoredPacket {
            packet,
            first_sent: now,
            last_sent: now,
            send_count: 1,
        });
        self.next_seq = self.next_seq.next();
    }

    fn evict_oldest(&mut self) {
        let idx = self.index(self.oldest);
        self.buffer[idx] = None;
        self.oldest = self.oldest.next();
    }

    /// Copy of `seq` flagged as a retransmission
    pub fn get_for_resend(&mut self, seq: SeqNumber, now: Instant) -> Result<DataPacket, BufferError> {
        if !self.contains(seq) {
            return Err(BufferError::NotFound(seq));
        }
        let idx = self.index(seq);
        let ttl = self.ttl;

        match &mut self.buffer[idx] {
            Some(stored) if stored.packet.seq == seq => {
                if now.saturating_duration_since(stored.first_sent) > ttl {
                    return Err(BufferError::NotFound(seq));
                }
                stored.last_sent = now;
                stored.send_count += 1;
                self.retransmitted += 1;

                let mut packet = stored.packet.clone();
                packet.flags.retransmitted = true;
                Ok(packet)
            }
            _ => Err(BufferError::NotFound(seq)),
        }
    }

    pub fn get(&self, seq: SeqNumber) -> Result<&DataPacket, BufferError> {
        if !self.contains(seq) {
            return Err(BufferError::NotFound(seq));
        }
        match &self.buffer[self.index(seq)] {
            Some(stored) if stored.packet.seq == seq => Ok(&stored.packet),
            _ => Err(BufferError::NotFound(seq)),
        }
    }

    /// How often `seq` has been sent, first transmission included
    pub fn send_count(&self, seq: SeqNumber) -> Option<u32> {
        if !self.contains(seq) {
            return None;
        }
        match &self.buffer[self.index(seq)] {
            Some(stored) if stored.packet.seq == seq => Some(stored.send_count),
            _ => None,
        }
    }

    /// Release everything below `seq`, the receiver's next expected number
    pub fn acknowledge_up_to(&mut self, seq: SeqNumber) -> usize {
        let mut released = 0;
        while self.oldest.lt(seq) && self.oldest.lt(self.next_seq) {
            let idx = self.index(self.oldest);
            if self.buffer[idx].take().is_some() {
                released += 1;
            }
            self.oldest = self.oldest.next();
        }
        released
    }

    /// Drop packets that outlived the resend budget, oldest first
    pub fn drop_expired(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        while self.oldest.lt(self.next_seq) {
            let idx = self.index(self.oldest);
            let expired = self.buffer[idx]
                .as_ref()
                .map(|stored| now.saturating_duration_since(stored.first_sent) > self.ttl);
            match expired {
                Some(false) => break,
                Some(true) => {
                    self.buffer[idx] = None;
                    dropped += 1;
                }
                None => {}
            }
            self.oldest = self.oldest.next();
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.oldest.distance_to(self.next_seq).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_seq(&self) -> SeqNumber {
        self.next_seq
    }

    pub fn oldest(&self) -> SeqNumber {
        self.oldest
    }

    /// Resends served so far
    pub fn retransmitted(&self) -> u64 {
        self.retransmitted
    }

    pub fn contains(&self, seq: SeqNumber) -> bool {
        seq.ge(self.oldest) && seq.lt(self.next_seq)
    }

    /// Time since `seq` was last put on the wire
    pub fn since_last_sent(&self, seq: SeqNumber, now: Instant) -> Option<Duration> {
        self.get_stored(seq)
            .map(|stored| now.saturating_duration_since(stored.last_sent))
    }

    fn get_stored(&self, seq: SeqNumber) -> Option<&StoredPacket> {
        if !self.contains(seq) {
            return None;
        }
        self.buffer[self.index(seq)]
            .as_ref()
            .filter(|stored| stored.packet.seq == seq)
    }
}
