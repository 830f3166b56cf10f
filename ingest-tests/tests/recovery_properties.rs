//! Property-based tests for the receive path
//!
//! Parity recovery has to hand back packets bit-identical to what was sent,
//! whatever order symbols arrive in, and the jitter buffer must never hold
//! a packet past its latency budget.

use bytes::Bytes;
use ingest_protocol::fec::{encode_parity, reconstruct, FecEncoder};
use ingest_protocol::{
    DataPacket, JitterBuffer, JitterConfig, LatencyMode, Origin, RecoveredPacket, RecoveryEngine,
    RecoveryMode, SeqNumber,
};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

const SESSION_ID: u32 = 0x5EED;

fn block_strategy() -> impl Strategy<Value = Vec<(u32, Vec<u8>)>> {
    prop::collection::vec(
        (any::<u32>(), prop::collection::vec(any::<u8>(), 0..=300)),
        1..=40,
    )
}

fn source_packets(base: u32, block: &[(u32, Vec<u8>)]) -> Vec<DataPacket> {
    let base = SeqNumber::new(base);
    block
        .iter()
        .enumerate()
        .map(|(i, (timestamp, payload))| {
            DataPacket::new(
                base + i as u32,
                *timestamp,
                SESSION_ID,
                Bytes::copy_from_slice(payload),
            )
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_reconstruct_any_k_of_k_plus_m(
        symbols in prop::collection::vec(prop::collection::vec(any::<u8>(), 64), 1..=50),
        parity_count in 1usize..=12,
        erasures in prop::collection::vec(any::<prop::sample::Index>(), 1..=12),
    ) {
        let parities = encode_parity(&symbols, parity_count).unwrap();
        prop_assert_eq!(parities.len(), parity_count);

        let erased: BTreeSet<usize> = erasures
            .iter()
            .take(parity_count)
            .map(|i| i.index(symbols.len()))
            .collect();
        let sources: Vec<Option<&[u8]>> = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (!erased.contains(&i)).then_some(s.as_slice()))
            .collect();
        // Use the last rows so the decoder is not always handed row 0
        let offered: Vec<(usize, &[u8])> = parities
            .iter()
            .enumerate()
            .rev()
            .take(erased.len())
            .map(|(row, p)| (row, p.as_slice()))
            .collect();

        let rebuilt = reconstruct(&sources, &offered).unwrap();
        prop_assert_eq!(rebuilt.len(), erased.len());
        for (index, symbol) in rebuilt {
            prop_assert!(erased.contains(&index));
            prop_assert_eq!(&symbol, &symbols[index]);
        }
    }

    #[test]
    fn prop_fec_rebuilds_bit_identical_packets(
        base in 0u32..1_000_000,
        block in block_strategy(),
        overhead in 10u8..=100,
        drops in prop::collection::vec(any::<prop::sample::Index>(), 0..=40),
        order_seed in any::<u64>(),
    ) {
        let sent = source_packets(base, &block);
        let now = Instant::now();

        let mut encoder = FecEncoder::new(Duration::from_secs(10), overhead, false);
        for packet in &sent {
            prop_assert!(encoder.push(packet, now).is_empty());
        }
        let parity = encoder.flush();
        let k = sent.len();
        prop_assert_eq!(parity.len(), (k * overhead as usize + 99) / 100);
        prop_assert!(parity.iter().all(|p| p.seq == sent[0].seq && p.is_parity()));

        let dropped: BTreeSet<usize> = drops
            .iter()
            .take(parity.len())
            .map(|i| i.index(k))
            .collect();

        // Everything that survives the link, in a scrambled arrival order
        let mut arrivals: Vec<DataPacket> = sent
            .iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, p)| p.clone())
            .chain(parity.iter().cloned())
            .collect();
        let mut state = order_seed | 1;
        for i in (1..arrivals.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            arrivals.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let mut engine = RecoveryEngine::new(RecoveryMode::Fec, Duration::from_millis(50));
        let mut delivered: BTreeMap<SeqNumber, RecoveredPacket> = BTreeMap::new();
        for packet in arrivals {
            for recovered in engine.on_packet(packet, now) {
                let seq = recovered.packet.seq;
                prop_assert!(delivered.insert(seq, recovered).is_none(), "{} delivered twice", seq);
            }
        }

        prop_assert_eq!(delivered.len(), k);
        for (packet, (_, recovered)) in sent.iter().zip(&delivered) {
            prop_assert_eq!(&recovered.packet, packet);
        }
        for i in &dropped {
            prop_assert_eq!(delivered[&sent[*i].seq].origin, Origin::Fec);
        }
        let counters = engine.counters();
        prop_assert!(counters.fec_recovered >= dropped.len() as u64);
        prop_assert_eq!(counters.fec_recovered + counters.received, k as u64);
    }

    #[test]
    fn prop_jitter_buffer_bounds_latency(
        latency_ms in 20u64..=200,
        packets in prop::collection::vec((any::<bool>(), 0u64..=150), 20..=200),
    ) {
        let latency = Duration::from_millis(latency_ms);
        let mut buffer = JitterBuffer::new(JitterConfig {
            max_latency: latency,
            latency_mode: LatencyMode::Static,
            stuff_null: false,
            max_output_jitter: Duration::ZERO,
            fixed_delay: false,
            output_capacity: 4096,
        });
        let start = Instant::now();
        let base = SeqNumber::new(1000);

        // Packet i leaves the sender at i ms and spends `delay` ms in flight
        let mut schedule: BTreeMap<u64, Vec<u32>> = BTreeMap::new();
        for (i, (lost, delay)) in packets.iter().enumerate() {
            if !lost {
                schedule.entry(i as u64 + delay).or_default().push(i as u32);
            }
        }
        let sent: usize = schedule.values().map(Vec::len).sum();
        let end = packets.len() as u64 + 150 + latency_ms + 5;

        let mut released = Vec::new();
        for ms in 0..=end {
            let now = start + Duration::from_millis(ms);
            for index in schedule.get(&ms).into_iter().flatten() {
                let seq = base + *index;
                buffer.insert(RecoveredPacket {
                    packet: DataPacket::new(seq, *index * 1000, SESSION_ID, Bytes::from(vec![0u8; 16])),
                    origin: Origin::Network,
                    arrival: now,
                });
            }
            buffer.poll(now);
            released.extend(std::iter::from_fn(|| buffer.pop()));
        }

        for delivery in &released {
            prop_assert!(!delivery.is_null());
            prop_assert!(
                delivery.delay() <= latency + Duration::from_millis(1),
                "{} held for {:?}",
                delivery.seq,
                delivery.delay()
            );
        }
        for pair in released.windows(2) {
            prop_assert!(pair[0].seq.lt(pair[1].seq));
        }
        // Anything not released arrived after its slot had been passed
        let stats = buffer.stats();
        prop_assert_eq!(released.len() as u64 + stats.late, sent as u64);
        prop_assert_eq!(buffer.buffered(), 0);
    }
}
