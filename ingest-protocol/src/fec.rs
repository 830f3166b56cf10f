//! Forward error correction
//!
//! Systematic Cauchy Reed-Solomon over GF(2^8). A block of `k` source
//! packets produces `m` parity packets and any `k` of the `k + m` symbols
//! rebuild the block. Each source packet is turned into a symbol that also
//! protects its flags, timestamp and length, so a rebuilt packet is
//! bit-identical to the one that was sent:
//!
//! ```text
//! [flags: u8][timestamp: u32][payload length: u16][payload][zero padding]
//! ```
//!
//! All symbols of a block are padded to the longest one.

use crate::gf256;
use crate::packet::{DataFlags, DataPacket, ParityInfo, TS_PACKET_SIZE};
use crate::sequence::SeqNumber;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bytes of per-packet metadata in front of each symbol payload
pub const SYMBOL_HEADER_SIZE: usize = 7;

/// Upper bound on source packets per block
pub const MAX_BLOCK_SOURCES: usize = 100;

const MAX_BLOCK_SYMBOLS: usize = 255;

const SYMBOL_FLAG_END_OF_STREAM: u8 = 0x01;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FecError {
    #[error("block of {source_count} + {parity_count} symbols exceeds {max}")]
    TooManySymbols {
        source_count: usize,
        parity_count: usize,
        max: usize,
    },

    #[error("need {needed} symbols, have {available}")]
    InsufficientSymbols { needed: usize, available: usize },

    #[error("symbol shorter than its header or declared length")]
    MalformedSymbol,

    #[error("empty block")]
    EmptyBlock,
}

/// Serialize a source packet into a symbol of `width` bytes
pub fn source_symbol(packet: &DataPacket, width: usize) -> Vec<u8> {
    let mut symbol = Vec::with_capacity(width);
    let mut flags = 0u8;
    if packet.flags.end_of_stream {
        flags |= SYMBOL_FLAG_END_OF_STREAM;
    }
    symbol.push(flags);
    symbol.extend_from_slice(&packet.timestamp.to_be_bytes());
    symbol.extend_from_slice(&(packet.payload.len() as u16).to_be_bytes());
    symbol.extend_from_slice(&packet.payload);
    symbol.resize(width.max(symbol.len()), 0);
    symbol
}

/// Symbol width needed to carry `payload_len` bytes
pub fn symbol_width(payload_len: usize) -> usize {
    SYMBOL_HEADER_SIZE + payload_len
}

/// Rebuild the packet with sequence number `seq` from its symbol
pub fn packet_from_symbol(
    seq: SeqNumber,
    session_id: u32,
    symbol: &[u8],
) -> Result<DataPacket, FecError> {
    if symbol.len() < SYMBOL_HEADER_SIZE {
        return Err(FecError::MalformedSymbol);
    }
    let flags = symbol[0];
    let timestamp = u32::from_be_bytes([symbol[1], symbol[2], symbol[3], symbol[4]]);
    let len = u16::from_be_bytes([symbol[5], symbol[6]]) as usize;
    if symbol.len() < SYMBOL_HEADER_SIZE + len {
        return Err(FecError::MalformedSymbol);
    }

    Ok(DataPacket {
        seq,
        flags: DataFlags {
            retransmitted: false,
            end_of_stream: flags & SYMBOL_FLAG_END_OF_STREAM != 0,
            parity: None,
        },
        timestamp,
        session_id,
        payload: Bytes::copy_from_slice(&symbol[SYMBOL_HEADER_SIZE..SYMBOL_HEADER_SIZE + len]),
    })
}

/// Compute `parity_count` parity symbols over equal-width source symbols
pub fn encode_parity(sources: &[Vec<u8>], parity_count: usize) -> Result<Vec<Vec<u8>>, FecError> {
    let k = sources.len();
    if k == 0 {
        return Err(FecError::EmptyBlock);
    }
    if k + parity_count > MAX_BLOCK_SYMBOLS {
        return Err(FecError::TooManySymbols {
            source_count: k,
            parity_count,
            max: MAX_BLOCK_SYMBOLS,
        });
    }

    let width = sources.iter().map(Vec::len).max().unwrap_or(0);
    let parities = (0..parity_count)
        .map(|row| {
            let mut parity = vec![0u8; width];
            for (col, source) in sources.iter().enumerate() {
                gf256::mul_add_slice(&mut parity, source, gf256::cauchy(k, row, col));
            }
            parity
        })
        .collect();

    Ok(parities)
}

/// Rebuild missing source symbols
///
/// `sources[i]` is `Some` for every source symbol that arrived and
/// `parities` holds `(row, symbol)` pairs. Returns `(index, symbol)` for
/// every source that was missing.
pub fn reconstruct(
    sources: &[Option<&[u8]>],
    parities: &[(usize, &[u8])],
) -> Result<Vec<(usize, Vec<u8>)>, FecError> {
    let k = sources.len();
    let missing: Vec<usize> = (0..k).filter(|&i| sources[i].is_none()).collect();
    if missing.is_empty() {
        return Ok(Vec::new());
    }
    if parities.len() < missing.len() {
        return Err(FecError::InsufficientSymbols {
            needed: k,
            available: k - missing.len() + parities.len(),
        });
    }

    let width = parities
        .iter()
        .map(|(_, p)| p.len())
        .chain(sources.iter().flatten().map(|s| s.len()))
        .max()
        .unwrap_or(0);
    let used = &parities[..missing.len()];

    // Right-hand side: parity minus the contribution of every known source.
    let mut rhs: Vec<Vec<u8>> = used
        .iter()
        .map(|(row, parity)| {
            let mut acc = vec![0u8; width];
            acc[..parity.len()].copy_from_slice(parity);
            for (col, source) in sources.iter().enumerate() {
                if let Some(source) = source {
                    gf256::mul_add_slice(&mut acc, source, gf256::cauchy(k, *row, col));
                }
            }
            acc
        })
        .collect();

    let mut matrix: Vec<Vec<u8>> = used
        .iter()
        .map(|(row, _)| {
            missing
                .iter()
                .map(|&col| gf256::cauchy(k, *row, col))
                .collect()
        })
        .collect();

    // Gauss-Jordan elimination; Cauchy submatrices are never singular but a
    // zero pivot still gets swapped out.
    let n = missing.len();
    for pivot in 0..n {
        let swap = (pivot..n)
            .find(|&r| matrix[r][pivot] != 0)
            .ok_or(FecError::MalformedSymbol)?;
        matrix.swap(pivot, swap);
        rhs.swap(pivot, swap);

        let scale = gf256::inv(matrix[pivot][pivot]);
        for value in matrix[pivot].iter_mut() {
            *value = gf256::mul(*value, scale);
        }
        gf256::scale_slice(&mut rhs[pivot], scale);

        for r in 0..n {
            if r == pivot || matrix[r][pivot] == 0 {
                continue;
            }
            let factor = matrix[r][pivot];
            let pivot_row = matrix[pivot].clone();
            for (value, p) in matrix[r].iter_mut().zip(&pivot_row) {
                *value ^= gf256::mul(*p, factor);
            }
            let (pivot_rhs, target) = if pivot < r {
                let (head, tail) = rhs.split_at_mut(r);
                (&head[pivot], &mut tail[0])
            } else {
                let (head, tail) = rhs.split_at_mut(pivot);
                (&tail[0], &mut head[r])
            };
            gf256::mul_add_slice(target, pivot_rhs, factor);
        }
    }

    Ok(missing.into_iter().zip(rhs).collect())
}

/// Chooses how many parity symbols protect a closed block
pub trait ParityPolicy: Send {
    fn parity_count(&self, sources: &[DataPacket], overhead_percent: u8) -> usize;
}

/// `ceil(k × overhead / 100)` parity symbols for every block
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformPolicy;

impl ParityPolicy for UniformPolicy {
    fn parity_count(&self, sources: &[DataPacket], overhead_percent: u8) -> usize {
        uniform_parity(sources.len(), overhead_percent)
    }
}

fn uniform_parity(source_count: usize, overhead_percent: u8) -> usize {
    if overhead_percent == 0 || source_count == 0 {
        return 0;
    }
    (source_count * overhead_percent as usize + 99) / 100
}

/// Adds parity to blocks carrying MPEG-TS random access points or PAT
/// sections, where a loss costs a whole group of pictures
#[derive(Debug, Clone, Copy)]
pub struct ContentAwarePolicy {
    /// Extra parity in percent of the uniform amount
    pub boost_percent: u8,
}

impl Default for ContentAwarePolicy {
    fn default() -> Self {
        ContentAwarePolicy { boost_percent: 50 }
    }
}

impl ParityPolicy for ContentAwarePolicy {
    fn parity_count(&self, sources: &[DataPacket], overhead_percent: u8) -> usize {
        let base = uniform_parity(sources.len(), overhead_percent);
        if base > 0 && sources.iter().any(|p| carries_key_content(&p.payload)) {
            base + (base * self.boost_percent as usize + 99) / 100
        } else {
            base
        }
    }
}

/// True when a TS payload holds a PAT section or a random access point
pub fn carries_key_content(payload: &[u8]) -> bool {
    payload
        .chunks_exact(TS_PACKET_SIZE)
        .filter(|ts| ts[0] == 0x47)
        .any(|ts| {
            let pid = ((ts[1] as u16 & 0x1F) << 8) | ts[2] as u16;
            let has_adaptation = ts[3] & 0x20 != 0;
            let random_access = has_adaptation && ts[4] > 0 && ts[5] & 0x40 != 0;
            pid == 0 || random_access
        })
}

/// Sender-side block builder
///
/// Source packets are collected until the block spans `block_span` or
/// reaches [`MAX_BLOCK_SOURCES`]; closing a block yields its parity packets.
pub struct FecEncoder {
    block_span: Duration,
    overhead: u8,
    policy: Box<dyn ParityPolicy>,
    block: Vec<DataPacket>,
    block_start: Option<Instant>,
}

impl FecEncoder {
    pub fn new(block_span: Duration, overhead: u8, content_aware: bool) -> Self {
        let policy: Box<dyn ParityPolicy> = if content_aware {
            Box::new(ContentAwarePolicy::default())
        } else {
            Box::new(UniformPolicy)
        };
        FecEncoder {
            block_span,
            overhead: overhead.min(100),
            policy,
            block: Vec::with_capacity(MAX_BLOCK_SOURCES),
            block_start: None,
        }
    }

    pub fn overhead(&self) -> u8 {
        self.overhead
    }

    /// Takes effect from the next block
    pub fn set_overhead(&mut self, overhead: u8) {
        self.overhead = overhead.min(100);
    }

    pub fn set_block_span(&mut self, block_span: Duration) {
        self.block_span = block_span;
    }

    /// Add a freshly sent source packet, returning parity for a closed block
    pub fn push(&mut self, packet: &DataPacket, now: Instant) -> Vec<DataPacket> {
        let mut parity = Vec::new();
        if let Some(start) = self.block_start {
            let contiguous = self
                .block
                .last()
                .map_or(true, |last| last.seq.next() == packet.seq);
            if now.saturating_duration_since(start) >= self.block_span || !contiguous {
                parity = self.close_block();
            }
        }
        if self.block.is_empty() {
            self.block_start = Some(now);
        }
        self.block.push(packet.clone());
        if self.block.len() >= MAX_BLOCK_SOURCES {
            parity.extend(self.close_block());
        }
        parity
    }

    /// Close the open block once its span has elapsed
    pub fn poll(&mut self, now: Instant) -> Vec<DataPacket> {
        match self.block_start {
            Some(start) if now.saturating_duration_since(start) >= self.block_span => {
                self.close_block()
            }
            _ => Vec::new(),
        }
    }

    /// Close the open block regardless of its age
    pub fn flush(&mut self) -> Vec<DataPacket> {
        self.close_block()
    }

    fn close_block(&mut self) -> Vec<DataPacket> {
        self.block_start = None;
        let sources = std::mem::take(&mut self.block);
        let Some(first) = sources.first() else {
            return Vec::new();
        };

        let k = sources.len();
        let m = self
            .policy
            .parity_count(&sources, self.overhead)
            .min(MAX_BLOCK_SYMBOLS - k);
        if m == 0 {
            return Vec::new();
        }

        let width = sources
            .iter()
            .map(|p| symbol_width(p.payload.len()))
            .max()
            .unwrap_or(SYMBOL_HEADER_SIZE);
        let symbols: Vec<Vec<u8>> = sources.iter().map(|p| source_symbol(p, width)).collect();
        let base = first.seq;
        let session_id = first.session_id;
        let timestamp = sources.last().map_or(first.timestamp, |p| p.timestamp);

        match encode_parity(&symbols, m) {
            Ok(parities) => parities
                .into_iter()
                .enumerate()
                .map(|(index, symbol)| {
                    let mut payload = BytesMut::with_capacity(symbol.len());
                    payload.put_slice(&symbol);
                    DataPacket {
                        seq: base,
                        flags: DataFlags {
                            retransmitted: false,
                            end_of_stream: false,
                            parity: Some(ParityInfo {
                                source_count: k as u8,
                                index: index as u8,
                                parity_count: m as u8,
                            }),
                        },
                        timestamp,
                        session_id,
                        payload: payload.freeze(),
                    }
                })
                .collect(),
            Err(e) => {
                tracing::warn!("parity generation failed for block {}: {}", base, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(seq: u32, payload: &[u8]) -> DataPacket {
        DataPacket::new(SeqNumber::new(seq), seq * 1000, 7, Bytes::copy_from_slice(payload))
    }

    fn symbols(packets: &[DataPacket]) -> Vec<Vec<u8>> {
        let width = packets
            .iter()
            .map(|p| symbol_width(p.payload.len()))
            .max()
            .unwrap();
        packets.iter().map(|p| source_symbol(p, width)).collect()
    }

    #[test]
    fn test_symbol_preserves_packet() {
        let original = packet(5, b"abcdef");
        let symbol = source_symbol(&original, 40);
        assert_eq!(symbol.len(), 40);
        let rebuilt = packet_from_symbol(original.seq, 7, &symbol).unwrap();
        assert_eq!(rebuilt, original);
    }

    #[test]
    fn test_recover_two_losses_with_two_parity() {
        let packets: Vec<DataPacket> = (0..6)
            .map(|i| packet(i, &vec![i as u8 * 17; 10 + i as usize]))
            .collect();
        let syms = symbols(&packets);
        let parity = encode_parity(&syms, 2).unwrap();

        let received: Vec<Option<&[u8]>> = syms
            .iter()
            .enumerate()
            .map(|(i, s)| if i == 1 || i == 4 { None } else { Some(s.as_slice()) })
            .collect();
        let parities = vec![(0, parity[0].as_slice()), (1, parity[1].as_slice())];

        let rebuilt = reconstruct(&received, &parities).unwrap();
        assert_eq!(rebuilt.len(), 2);
        for (index, symbol) in rebuilt {
            let packet = packet_from_symbol(SeqNumber::new(index as u32), 7, &symbol).unwrap();
            assert_eq!(packet, packets[index]);
        }
    }

    #[test]
    fn test_any_parity_row_works() {
        let packets: Vec<DataPacket> = (0..4).map(|i| packet(i, b"xyz")).collect();
        let syms = symbols(&packets);
        let parity = encode_parity(&syms, 3).unwrap();

        let received = vec![Some(syms[0].as_slice()), None, Some(syms[2].as_slice()), Some(syms[3].as_slice())];
        let rebuilt = reconstruct(&received, &[(2, parity[2].as_slice())]).unwrap();
        assert_eq!(rebuilt, vec![(1, syms[1].clone())]);
    }

    #[test]
    fn test_too_few_symbols() {
        let packets: Vec<DataPacket> = (0..3).map(|i| packet(i, b"q")).collect();
        let syms = symbols(&packets);
        let parity = encode_parity(&syms, 1).unwrap();
        let received = vec![None, None, Some(syms[2].as_slice())];
        assert!(matches!(
            reconstruct(&received, &[(0, parity[0].as_slice())]),
            Err(FecError::InsufficientSymbols { .. })
        ));
    }

    #[test]
    fn test_block_limits() {
        let syms = vec![vec![0u8; 8]; 200];
        assert!(matches!(
            encode_parity(&syms, 60),
            Err(FecError::TooManySymbols { .. })
        ));
        assert_eq!(encode_parity(&[], 1), Err(FecError::EmptyBlock));
    }

    #[test]
    fn test_encoder_closes_on_span() {
        let start = Instant::now();
        let mut encoder = FecEncoder::new(Duration::from_millis(30), 50, false);
        for i in 0..4u32 {
            let t = start + Duration::from_millis(i as u64 * 5);
            assert!(encoder.push(&packet(i, b"data"), t).is_empty());
        }
        let parity = encoder.push(&packet(4, b"data"), start + Duration::from_millis(31));
        assert_eq!(parity.len(), 2);
        let info = parity[0].flags.parity.unwrap();
        assert_eq!(info.source_count, 4);
        assert_eq!(info.parity_count, 2);
        assert_eq!(parity[0].seq, SeqNumber::new(0));

        let tail = encoder.poll(start + Duration::from_millis(70));
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, SeqNumber::new(4));
    }

    #[test]
    fn test_uniform_parity_rounds_up() {
        assert_eq!(uniform_parity(10, 15), 2);
        assert_eq!(uniform_parity(10, 0), 0);
        assert_eq!(uniform_parity(1, 1), 1);
    }

    #[test]
    fn test_content_aware_boost() {
        let mut ts = vec![0xFFu8; TS_PACKET_SIZE];
        ts[0] = 0x47;
        ts[1] = 0x01;
        ts[2] = 0x00;
        ts[3] = 0x30;
        ts[4] = 7;
        ts[5] = 0x40;
        let key = DataPacket::new(SeqNumber::new(0), 0, 0, Bytes::from(ts));
        let plain = packet(1, &[0u8; 20]);

        let policy = ContentAwarePolicy::default();
        assert_eq!(policy.parity_count(&[plain.clone()], 20), 1);
        assert_eq!(policy.parity_count(&[key, plain], 20), 2);
    }
}
