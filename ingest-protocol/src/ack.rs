//! Receiver reports, loss reports and round-trip estimation

use crate::loss::LossRange;
use crate::packet::PacketError;
use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;

const RANGE_FLAG: u32 = 0x8000_0000;

/// Periodic receiver report
///
/// Sent in an `Ack` control packet whose type-info field holds the report
/// number; the sender echoes that number in an `AckAck` so the receiver can
/// time the round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckInfo {
    /// Highest sequence number received in order
    pub ack_seq: SeqNumber,
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    /// Payload bits per second delivered over the last interval
    pub receive_rate_bps: u32,
    /// Loss before recovery, in parts per thousand
    pub loss_permille: u16,
    /// Packets still missing after recovery, in parts per thousand
    pub residual_permille: u16,
}

impl AckInfo {
    pub const SIZE: usize = 20;

    pub fn new(ack_seq: SeqNumber) -> Self {
        AckInfo {
            ack_seq,
            rtt_us: 0,
            rtt_var_us: 0,
            receive_rate_bps: 0,
            loss_permille: 0,
            residual_permille: 0,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u32(self.ack_seq.as_raw());
        buf.put_u32(self.rtt_us);
        buf.put_u32(self.rtt_var_us);
        buf.put_u32(self.receive_rate_bps);
        buf.put_u16(self.loss_permille);
        buf.put_u16(self.residual_permille);
        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < Self::SIZE {
            return Err(PacketError::InsufficientData {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = bytes;
        Ok(AckInfo {
            ack_seq: SeqNumber::new_unchecked(buf.get_u32()),
            rtt_us: buf.get_u32(),
            rtt_var_us: buf.get_u32(),
            receive_rate_bps: buf.get_u32(),
            loss_permille: buf.get_u16(),
            residual_permille: buf.get_u16(),
        })
    }

    pub fn loss_rate(&self) -> f64 {
        self.loss_permille as f64 / 1000.0
    }
}

/// Loss report body
///
/// Single losses are one word; ranges are two words with bit 31 set on the
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NakInfo {
    pub loss_ranges: Vec<LossRange>,
}

impl NakInfo {
    pub fn new(loss_ranges: Vec<LossRange>) -> Self {
        NakInfo { loss_ranges }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.loss_ranges.len() * 8);

        for range in &self.loss_ranges {
            if range.is_single() {
                buf.put_u32(range.start.as_raw());
            } else {
                buf.put_u32(range.start.as_raw() | RANGE_FLAG);
                buf.put_u32(range.end.as_raw());
            }
        }

        buf.freeze()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let mut loss_ranges = Vec::new();
        let mut buf = bytes;

        while buf.remaining() >= 4 {
            let first = buf.get_u32();

            if first & RANGE_FLAG != 0 {
                if buf.remaining() < 4 {
                    return Err(PacketError::MalformedBody("loss range"));
                }
                let start = SeqNumber::new_unchecked(first);
                let end = SeqNumber::new_unchecked(buf.get_u32());
                loss_ranges.push(LossRange::new(start, end));
            } else {
                loss_ranges.push(LossRange::single(SeqNumber::new_unchecked(first)));
            }
        }

        Ok(NakInfo { loss_ranges })
    }

    /// Number of sequence numbers requested
    pub fn packet_count(&self) -> usize {
        self.loss_ranges.iter().map(LossRange::len).sum()
    }
}

/// Smoothed round-trip estimate (EWMA, 1/8 gain on the mean, 1/4 on variance)
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: f64,
    rtt_var: f64,
    sample_count: u32,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            srtt: 100_000.0,
            rtt_var: 50_000.0,
            sample_count: 0,
        }
    }

    pub fn update(&mut self, rtt_sample_us: u32) {
        let sample = rtt_sample_us as f64;

        if self.sample_count == 0 {
            self.srtt = sample;
            self.rtt_var = sample / 2.0;
        } else {
            let error = sample - self.srtt;
            self.srtt += 0.125 * error;
            self.rtt_var = 0.75 * self.rtt_var + 0.25 * error.abs();
        }

        self.sample_count = self.sample_count.saturating_add(1);
    }

    pub fn has_samples(&self) -> bool {
        self.sample_count > 0
    }

    /// Smoothed RTT in microseconds
    pub fn srtt(&self) -> u32 {
        self.srtt as u32
    }

    pub fn rtt_var(&self) -> u32 {
        self.rtt_var as u32
    }

    pub fn srtt_duration(&self) -> Duration {
        Duration::from_micros(self.srtt as u64)
    }

    /// Retransmission timeout: SRTT + 4 × RTTVAR
    pub fn rto(&self) -> Duration {
        Duration::from_micros((self.srtt + 4.0 * self.rtt_var) as u64)
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}
