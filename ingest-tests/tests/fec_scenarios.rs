//! Forward error correction over a lossy simulated link
//!
//! Retransmission is disabled so every repair has to come from parity.

mod common;

use common::*;
use ingest::{ErrorCorrectionConfig, FecMode, FeederConfig, StatsSnapshot};
use ingest_io::{LinkConditions, SimNetwork};
use std::time::Duration;

const FRAMES: u32 = 1000;

fn transfer_with_overhead(overhead: u8, seed: u64) -> (Collected, StatsSnapshot) {
    let network = SimNetwork::new(seed);
    network.set_conditions_from(server_addr(SERVER), LinkConditions::lossy(0.05));
    let context = context();
    let feeder = listening_feeder(&context, &network, SERVER, FeederConfig::default());
    let session = receiver(&context, &network, "receiver-1");
    session
        .configure_error_correction(ErrorCorrectionConfig {
            max_latency: Duration::from_millis(300),
            fec_mode: FecMode::On,
            arq: false,
            fec_overhead: overhead,
            fec_block: Duration::from_millis(50),
            ..ErrorCorrectionConfig::default()
        })
        .unwrap();
    session.connect(url(SERVER), options()).unwrap();

    feed(&[&feeder], 0..FRAMES);
    feeder.close().unwrap();

    // The end-of-stream marker itself may be lost, so bound the wait.
    let collected = collect(&session, usize::MAX, Duration::from_secs(3));
    let stats = session.query_statistics().unwrap();
    (collected, stats)
}

#[test]
fn test_parity_repairs_random_loss() {
    let (collected, stats) = transfer_with_overhead(30, 21);
    let ec = &stats.error_correction;

    assert!(stats.network.packets_lost > 0, "the link dropped nothing");
    assert!(ec.fec_recovered > 20, "only {} packets rebuilt", ec.fec_recovered);
    assert_eq!(ec.arq_recovered, 0);
    assert_eq!(ec.nak_requests, 0);
    assert!(ec.not_recovered <= 5, "{} packets lost for good", ec.not_recovered);
    assert!(ec.parity_received > 0);

    let indices = collected.indices();
    assert!(indices.len() as u64 + ec.not_recovered >= FRAMES as u64);
    assert!(indices.windows(2).all(|w| w[0] < w[1]));
    // Rebuilt frames are byte-for-byte what was sent
    for frame_data in &collected.frames {
        assert_eq!(frame_data, &frame(frame_index(frame_data)));
    }
}

#[test]
fn test_thin_parity_leaves_holes() {
    let (thin, thin_stats) = transfer_with_overhead(2, 21);
    let (_, thick_stats) = transfer_with_overhead(30, 21);

    let thin_lost = thin_stats.error_correction.not_recovered;
    assert!(thin_lost > 20, "2% parity repaired almost everything ({} lost)", thin_lost);
    assert!(thin_lost > thick_stats.error_correction.not_recovered * 4);
    assert!(thin.discontinuities > 0);
}
