//! Statistics display and formatting

use ingest::failover::ComponentStats;
use ingest::{FeederStats, GroupStats, StatsSnapshot};
use std::io::Write;
use std::time::Duration;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format bandwidth in human-readable form
pub fn format_bandwidth(bps: u64) -> String {
    const KBPS: u64 = 1000;
    const MBPS: u64 = KBPS * 1000;
    const GBPS: u64 = MBPS * 1000;

    if bps >= GBPS {
        format!("{:.2} Gbps", bps as f64 / GBPS as f64)
    } else if bps >= MBPS {
        format!("{:.2} Mbps", bps as f64 / MBPS as f64)
    } else if bps >= KBPS {
        format!("{:.2} Kbps", bps as f64 / KBPS as f64)
    } else {
        format!("{} bps", bps)
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn format_percent(ratio: f64) -> String {
    format!("{:.2}%", ratio * 100.0)
}

/// One status line for a session or the merged view of a group
pub fn session_line(stats: &StatsSnapshot) -> String {
    let (n, e, c) = (&stats.network, &stats.error_correction, &stats.connection);
    format!(
        "[{:>8}] {:?} | Rate: {} | Recv: {} | Loss: {} | ARQ {} FEC {} lost {} | RTT {} ms | Latency {} ms",
        format_duration(c.connected_for),
        c.state,
        format_bandwidth(n.bitrate_bps),
        format_bytes(n.bytes_received),
        format_percent(n.loss_rate),
        e.arq_recovered,
        e.fec_recovered,
        e.not_recovered,
        n.rtt_ms,
        c.latency_ms,
    )
}

pub fn feeder_line(stats: &FeederStats, bitrate: u32) -> String {
    format!(
        "Sent: {} in {} packets | Parity {} | Retransmitted {} | NAKs {} | Rejected frames {} | RTT {} ms | FEC {}% | Target {}",
        format_bytes(stats.bytes_sent),
        stats.packets_sent,
        stats.parity_sent,
        stats.retransmitted,
        stats.naks_received,
        stats.frames_rejected,
        stats.rtt_ms,
        stats.fec_overhead,
        format_bandwidth(u64::from(bitrate)),
    )
}

/// Display failover group statistics
pub fn display_group_stats(stats: &GroupStats) {
    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{}", session_line(&stats.merged));
    let _ = writeln!(
        err,
        "  merged: forwarded {} | duplicates {} | mismatches {} | switches {}",
        stats.merger.forwarded, stats.merger.duplicates, stats.merger.mismatches, stats.merger.switches
    );
    for (index, component) in stats.components.iter().enumerate() {
        let _ = writeln!(err, "{}", component_row(index, component));
    }
}

fn component_row(index: usize, stats: &ComponentStats) -> String {
    format!(
        "  #{} {:?} {:<12} | contributed {} ({} packets) | dup {} | trailing {} ms{}",
        index,
        stats.priority,
        if stats.connected { "connected" } else { "disconnected" },
        format_bytes(stats.contributed_bytes),
        stats.contributed_packets,
        stats.duplicates,
        stats.last_packet_latency_ms,
        if stats.reached_end { " | ended" } else { "" },
    )
}

/// Display a session line, overwriting the previous one on a terminal
pub fn display_compact_stats(stats: &StatsSnapshot) {
    let mut err = std::io::stderr().lock();
    let _ = write!(err, "\r{}   ", session_line(stats));
    let _ = err.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest::failover::Priority;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(2 * 1024 * 1024), "2.00 MB");
    }

    #[test]
    fn test_format_bandwidth() {
        assert_eq!(format_bandwidth(500), "500 bps");
        assert_eq!(format_bandwidth(10_000), "10.00 Kbps");
        assert_eq!(format_bandwidth(10_000_000), "10.00 Mbps");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }

    #[test]
    fn test_session_line() {
        let mut stats = StatsSnapshot::default();
        stats.network.loss_rate = 0.05;
        stats.network.bitrate_bps = 4_000_000;
        let line = session_line(&stats);
        assert!(line.contains("Disconnected"));
        assert!(line.contains("5.00%"));
        assert!(line.contains("4.00 Mbps"));
    }

    #[test]
    fn test_component_row() {
        let stats = ComponentStats {
            priority: Priority::Primary,
            connected: true,
            reached_end: true,
            ..ComponentStats::default()
        };
        let row = component_row(1, &stats);
        assert!(row.contains("#1 Primary"));
        assert!(row.ends_with("| ended"));
    }
}
