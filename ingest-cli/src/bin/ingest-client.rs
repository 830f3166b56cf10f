//! Ingest client - pull one live stream
//!
//! Connects to an ingest server and writes the received media to stdout or
//! relays it over UDP.

use anyhow::Context as _;
use clap::Parser;
use ingest::{ConnectOptions, Context, ContextConfig, ErrorCode, SessionEvent};
use ingest_cli::{display_compact_stats, open_output, IngestConfig};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_LATENCY_MS: u64 = 300;
const READ_BUFFER: usize = 1316 * 8;

#[derive(Parser, Debug)]
#[command(name = "ingest-client")]
#[command(about = "Pull a live stream over the ingest protocol", long_about = None)]
struct Args {
    /// ingest://[user[:session]@]host[:port]/channel
    url: String,

    /// Maximum latency in milliseconds
    latency_ms: Option<u64>,

    /// -1 disables logging, 0 is the most verbose, 5 the least
    #[arg(allow_negative_numbers = true)]
    log_level: Option<i32>,

    /// Relay to this UDP host instead of writing to stdout
    host_out: Option<String>,

    port_out: Option<u16>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = IngestConfig::load_or_default(args.config.as_deref())?;
    let log_level = args.log_level.unwrap_or(config.client.log_level);
    ingest_cli::init_logging(log_level);

    let version = Context::version();
    tracing::info!(
        "ingest-client {}.{}.{} starting",
        version.major,
        version.minor,
        version.patch
    );

    let context = Context::init(ContextConfig {
        log_level,
        ..ContextConfig::default()
    })?;
    let session = context.create_session()?;

    let guid = if config.client.guid.is_empty() {
        format!("ingest-client-{}", std::process::id())
    } else {
        config.client.guid.clone()
    };
    session.configure_id(&guid, &config.client.session_token)?;

    let mut error_correction = config.error_correction.to_config();
    match args.latency_ms {
        Some(ms) => error_correction.max_latency = Duration::from_millis(ms),
        None if args.config.is_none() => {
            error_correction.max_latency = Duration::from_millis(DEFAULT_LATENCY_MS)
        }
        None => {}
    }
    session
        .configure_error_correction(error_correction)
        .context("invalid error correction settings")?;
    session
        .configure_adaptive(config.adaptive.to_config())
        .context("invalid adaptive settings")?;
    session.configure_reconnect(config.client.reconnect_policy())?;

    let mut writer = open_output(args.host_out.as_deref(), args.port_out)?;

    let options = ConnectOptions {
        low_latency: config.client.low_latency,
        connect_timeout: Duration::from_millis(config.client.connect_timeout_ms),
        ..ConnectOptions::default()
    };
    session
        .connect(args.url.as_str(), options)
        .with_context(|| format!("cannot connect to {}", args.url))?;
    tracing::info!("Connected to {}", args.url);

    let events = session.events();
    let stats_interval = config.client.stats_interval();
    let mut last_stats = Instant::now();
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        match session.read(&mut buf, false) {
            Ok(outcome) => {
                if outcome.discontinuity {
                    tracing::warn!("Discontinuity in received stream");
                }
                writer.write_all(&buf[..outcome.bytes])?;
                if outcome.eof {
                    break;
                }
            }
            Err(ErrorCode::NotReady) => thread::sleep(Duration::from_millis(5)),
            Err(ErrorCode::EndOfFile) => break,
            Err(code) => {
                let cause = session.last_error().ok().flatten().unwrap_or(code);
                anyhow::bail!("stream lost: {}", cause);
            }
        }

        for event in events.try_iter() {
            match event {
                SessionEvent::Status { state, error } => {
                    tracing::info!("Status {:?} ({:?})", state, error)
                }
                SessionEvent::NewStream(info) => tracing::info!("New stream {:?}", info),
                SessionEvent::BitrateChanged(bitrate) => {
                    tracing::info!("Switched to {} bps", bitrate)
                }
            }
        }

        if let Some(interval) = stats_interval {
            if last_stats.elapsed() >= interval {
                display_compact_stats(&session.query_statistics()?);
                last_stats = Instant::now();
            }
        }
    }

    writer.flush()?;
    tracing::info!("End of stream");
    let _ = session.disconnect();
    context.destroy();
    Ok(())
}
