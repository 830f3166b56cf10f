//! Property-based tests for packet serialization and sequence bookkeeping
//!
//! Random packets must survive a serialize/parse cycle unchanged, arbitrary
//! datagrams must never panic the parser, and the loss list must stay a
//! sorted set of disjoint ranges whatever order losses arrive in.

use bytes::Bytes;
use ingest_protocol::packet::{DataFlags, ParityInfo, MAX_PAYLOAD_SIZE};
use ingest_protocol::sequence::MAX_SEQ_NUMBER;
use ingest_protocol::{
    ControlPacket, ControlType, DataPacket, LossList, LossRange, NakInfo, Packet, SeqNumber,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

fn seq_number_strategy() -> impl Strategy<Value = SeqNumber> {
    (0..=MAX_SEQ_NUMBER).prop_map(SeqNumber::new_unchecked)
}

fn parity_strategy() -> impl Strategy<Value = Option<ParityInfo>> {
    prop::option::of((1u8..=255, any::<u8>(), 1u8..=255).prop_map(
        |(source_count, index, parity_count)| ParityInfo {
            source_count,
            index,
            parity_count,
        },
    ))
}

fn flags_strategy() -> impl Strategy<Value = DataFlags> {
    (any::<bool>(), any::<bool>(), parity_strategy()).prop_map(
        |(retransmitted, end_of_stream, parity)| DataFlags {
            retransmitted,
            end_of_stream,
            parity,
        },
    )
}

fn control_type_strategy() -> impl Strategy<Value = ControlType> {
    prop_oneof![
        Just(ControlType::Handshake),
        Just(ControlType::KeepAlive),
        Just(ControlType::Ack),
        Just(ControlType::Nak),
        Just(ControlType::Shutdown),
        Just(ControlType::AckAck),
        Just(ControlType::Reject),
        Just(ControlType::FecUpdate),
        Just(ControlType::BitrateSwitch),
        Just(ControlType::StreamControl),
    ]
}

fn small_payload_strategy() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=256).prop_map(Bytes::from)
}

proptest! {
    #[test]
    fn prop_data_packet_roundtrip(
        seq in seq_number_strategy(),
        flags in flags_strategy(),
        timestamp in any::<u32>(),
        session_id in any::<u32>(),
        payload in small_payload_strategy(),
    ) {
        let mut packet = DataPacket::new(seq, timestamp, session_id, payload);
        packet.flags = flags;

        let parsed = DataPacket::from_bytes(&packet.to_bytes()).unwrap();
        prop_assert_eq!(parsed, packet);
    }

    #[test]
    fn prop_control_packet_roundtrip(
        control_type in control_type_strategy(),
        type_info in any::<u16>(),
        additional_info in any::<u32>(),
        timestamp in any::<u32>(),
        session_id in any::<u32>(),
        body in small_payload_strategy(),
    ) {
        let packet = ControlPacket::new(control_type, session_id, body)
            .with_info(type_info, additional_info)
            .with_timestamp(timestamp);

        let parsed = Packet::from_bytes(&packet.to_bytes()).unwrap();
        prop_assert_eq!(parsed, Packet::Control(packet));
    }

    #[test]
    fn prop_parser_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD_SIZE + 64)) {
        // Only the outcome kind matters; garbage must come back as an error
        if let Ok(packet) = Packet::from_bytes(&bytes) {
            prop_assert_eq!(packet.size(), bytes.len());
        }
    }

    #[test]
    fn prop_nak_roundtrip(
        base in 0u32..=MAX_SEQ_NUMBER,
        gaps in prop::collection::vec((1u32..50, 0u32..20), 1..20),
    ) {
        let mut start = SeqNumber::new(base);
        let mut ranges = Vec::new();
        for (gap, len) in gaps {
            start = start + gap;
            let end = start + len;
            ranges.push(LossRange::new(start, end));
            start = end + 1;
        }
        let nak = NakInfo::new(ranges);
        let expected: usize = nak.loss_ranges.iter().map(LossRange::len).sum();

        let parsed = NakInfo::from_bytes(&nak.to_bytes()).unwrap();
        prop_assert_eq!(parsed.packet_count(), expected);
        prop_assert_eq!(parsed, nak);
    }

    #[test]
    fn prop_sequence_number_distance(
        a in 0u32..=MAX_SEQ_NUMBER,
        b in 0u32..=MAX_SEQ_NUMBER,
    ) {
        let seq_a = SeqNumber::new(a);
        let seq_b = SeqNumber::new(b);
        let dist_ab = seq_a.distance_to(seq_b);

        // Exactly half the space apart has no meaningful direction
        prop_assume!(dist_ab.unsigned_abs() != (MAX_SEQ_NUMBER + 1) / 2);

        prop_assert_eq!(dist_ab, -seq_b.distance_to(seq_a));
        prop_assert_eq!(seq_a + dist_ab as u32, seq_b);
        prop_assert_eq!((seq_a + 100) - 100, seq_a);
    }

    #[test]
    fn prop_sequence_number_comparison(
        a in 0u32..=MAX_SEQ_NUMBER,
        offset in 1u32..=1_000_000,
    ) {
        let seq_a = SeqNumber::new(a);
        let seq_b = seq_a + offset;

        prop_assert!(seq_a.lt(seq_b));
        prop_assert!(seq_b.gt(seq_a));
        prop_assert!(seq_a.le(seq_b));
        prop_assert!(seq_b.ge(seq_a));
        prop_assert!(!seq_b.le(seq_a));
        prop_assert_eq!(seq_a.distance_to(seq_b), offset as i32);

        prop_assert!(seq_a.le(seq_a));
        prop_assert!(seq_a.ge(seq_a));
    }

    #[test]
    fn prop_loss_list_stays_disjoint(
        base in 0u32..=MAX_SEQ_NUMBER,
        added in prop::collection::vec(0u32..400, 1..200),
        removed in prop::collection::vec(0u32..400, 0..100),
    ) {
        let base = SeqNumber::new(base);
        let now = Instant::now();
        let mut list = LossList::new(10, Duration::from_millis(20));
        let mut expected = BTreeSet::new();

        for offset in &added {
            list.add(base + *offset, now);
            expected.insert(*offset);
        }
        for offset in &removed {
            prop_assert_eq!(list.remove(base + *offset), expected.remove(offset));
        }

        let ranges = list.ranges();
        for pair in ranges.windows(2) {
            // Touching ranges would have been merged
            prop_assert!(pair[0].end.next().lt(pair[1].start));
        }
        prop_assert_eq!(list.len(), expected.len());
        for offset in 0u32..400 {
            prop_assert_eq!(list.contains(base + offset), expected.contains(&offset));
        }
        prop_assert_eq!(
            list.first(),
            expected.iter().next().map(|offset| base + *offset)
        );
    }
}
