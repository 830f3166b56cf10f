//! Failover groups over the simulated network
//!
//! Two feeders on different hosts carry the same frames; the group has to
//! produce one gap-free stream while either path goes away.

mod common;

use common::*;
use ingest::failover::ComponentStats;
use ingest::{
    ConnectionState, Context, ErrorCode, FailoverGroup, Feeder, FeederConfig, GroupConfig,
    MergeMode, Priority,
};
use ingest_io::SimNetwork;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Setup {
    network: Arc<SimNetwork>,
    _context: Context,
    primary: Feeder,
    backup: Feeder,
    group: FailoverGroup,
}

fn setup(seed: u64) -> Setup {
    let network = SimNetwork::new(seed);
    let context = context();
    let feeder_config = || FeederConfig {
        reconnect: fast_reconnect(Duration::from_secs(10)),
        ..FeederConfig::default()
    };
    let primary = listening_feeder(&context, &network, SERVER, feeder_config());
    let backup = listening_feeder(&context, &network, BACKUP_SERVER, feeder_config());

    let group = context
        .create_group(GroupConfig {
            mode: MergeMode::Content,
            ..GroupConfig::default()
        })
        .unwrap();
    for (guid, host, priority) in [
        ("receiver-primary", SERVER, Priority::Primary),
        ("receiver-backup", BACKUP_SERVER, Priority::Backup),
    ] {
        let session = receiver(&context, &network, guid);
        session
            .configure_reconnect(fast_reconnect(Duration::from_secs(10)))
            .unwrap();
        // Group statistics are read right after each phase
        session
            .configure_stats_interval(Duration::from_millis(20))
            .unwrap();
        group.add_component(session, url(host), priority).unwrap();
    }

    group.connect(options()).unwrap();
    assert!(wait_for(Duration::from_secs(3), || {
        components(&group).iter().filter(|c| c.connected).count() == 2
    }));

    Setup {
        network,
        _context: context,
        primary,
        backup,
        group,
    }
}

fn components(group: &FailoverGroup) -> Vec<ComponentStats> {
    group.query_group_statistics().unwrap().components
}

fn settle() {
    thread::sleep(Duration::from_millis(150));
}

#[test]
fn test_backup_covers_primary_outage() {
    let Setup {
        network,
        primary,
        backup,
        group,
        ..
    } = setup(31);
    let both = [&primary, &backup];

    feed(&both, 0..500);
    settle();
    let before = components(&group);

    network.set_down(server_addr(SERVER), true);
    feed(&both, 500..2500);
    settle();
    let during = components(&group);
    assert_eq!(group.status(), Ok(ConnectionState::Connected));

    network.set_down(server_addr(SERVER), false);
    assert!(wait_for(Duration::from_secs(3), || components(&group)[0].connected));

    feed(&both, 2500..3000);
    primary.close().unwrap();
    backup.close().unwrap();

    let got = collect(&group, usize::MAX, Duration::from_secs(5));
    let after = components(&group);

    let unique: BTreeSet<u32> = got.indices().into_iter().collect();
    assert_eq!(unique.len(), got.frames.len(), "merged stream repeats frames");
    assert_eq!(unique, (0..3000).collect::<BTreeSet<_>>());
    for frame_data in &got.frames {
        assert_eq!(frame_data, &frame(frame_index(frame_data)));
    }

    let backup_gain = during[1].contributed_packets - before[1].contributed_packets;
    assert!(backup_gain >= 1500, "backup only filled {} frames", backup_gain);
    assert!(after[0].contributed_packets > during[0].contributed_packets);
    assert!(after[0].duplicates + after[1].duplicates > 0);

    thread::sleep(Duration::from_millis(30));
    let stats = group.query_group_statistics().unwrap();
    assert_eq!(stats.merger.forwarded, 3000);
    assert_eq!(stats.merger.mismatches, 0);
    assert!(stats.merged.connection.reconnects >= 1);
}

#[test]
fn test_group_survives_losing_either_path() {
    let Setup {
        network,
        primary,
        backup,
        group,
        ..
    } = setup(32);
    let both = [&primary, &backup];

    network.set_down(server_addr(BACKUP_SERVER), true);
    feed(&both, 0..300);
    network.set_down(server_addr(BACKUP_SERVER), false);
    assert!(wait_for(Duration::from_secs(3), || components(&group)[1].connected));

    feed(&both, 300..600);
    let got = collect(&group, 600, Duration::from_secs(3));
    assert_eq!(got.indices(), (0..600).collect::<Vec<_>>());
}

#[test]
fn test_group_reads_fail_once_every_path_is_gone() {
    let Setup { network, group, .. } = setup(33);
    // Reconnecting components keep the group alive until their window ends
    for host in [SERVER, BACKUP_SERVER] {
        network.set_down(server_addr(host), true);
    }
    assert!(wait_for(Duration::from_secs(2), || {
        group.status() == Ok(ConnectionState::Reconnecting)
    }));
    assert_eq!(group.last_error(), Ok(None));

    group.disconnect().unwrap();
    assert_eq!(group.status(), Ok(ConnectionState::Disconnected));
    assert_eq!(
        group.read(&mut [0u8; FRAME_SIZE], true),
        Err(ErrorCode::NotConnected)
    );
}
