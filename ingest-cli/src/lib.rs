//! Ingest CLI library
//!
//! Shared functionality for the ingest command-line tools.

pub mod config;
pub mod output;
pub mod stats;

pub use config::{ConfigError, IngestConfig};
pub use output::{open_output, UdpWriter};
pub use stats::{display_compact_stats, display_group_stats, format_bandwidth, format_bytes};

use tracing_subscriber::EnvFilter;

/// `tracing` directive matching a numeric library log level
pub fn level_directive(log_level: i32) -> &'static str {
    match log_level {
        i32::MIN..=-1 => "off",
        0 => "trace",
        1 => "debug",
        2 => "info",
        3 => "warn",
        _ => "error",
    }
}

/// Log to stderr; `RUST_LOG` takes precedence over `log_level`
pub fn init_logging(log_level: i32) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
