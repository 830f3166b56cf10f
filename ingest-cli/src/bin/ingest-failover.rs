//! Ingest failover - pull one stream over several redundant paths
//!
//! Components alternate between primary and backup priority in the order
//! their URLs are given.

use anyhow::Context as _;
use clap::Parser;
use ingest::{ConnectOptions, Context, ContextConfig, ErrorCode, Priority};
use ingest_cli::{display_group_stats, open_output, IngestConfig};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

const READ_BUFFER: usize = 1316 * 8;

#[derive(Parser, Debug)]
#[command(name = "ingest-failover")]
#[command(about = "Merge redundant ingest streams into one", long_about = None)]
struct Args {
    /// How long a packet waits for its copies on other components
    search_window_ms: u64,

    /// -1 disables logging, 0 is the most verbose, 5 the least
    #[arg(allow_negative_numbers = true)]
    log_level: i32,

    out_host: String,

    out_port: u16,

    /// 0 = none, 1 = header, 2 = content
    mode: u8,

    /// Component URLs, at least two
    #[arg(num_args = 2.., required = true)]
    urls: Vec<String>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.urls.len() < 2 {
        anyhow::bail!("a failover group needs at least two URLs");
    }
    let mut config = IngestConfig::load_or_default(args.config.as_deref())?;
    ingest_cli::init_logging(args.log_level);

    config.failover.search_window_ms = args.search_window_ms;
    config.failover.mode = args.mode;
    let group_config = config.failover.to_config()?;

    let context = Context::init(ContextConfig {
        log_level: args.log_level,
        ..ContextConfig::default()
    })?;
    let group = context.create_group(group_config)?;

    for (index, url) in args.urls.iter().enumerate() {
        let session = context.create_session()?;
        let guid = if config.client.guid.is_empty() {
            format!("ingest-failover-{}-{}", std::process::id(), index)
        } else {
            format!("{}-{}", config.client.guid, index)
        };
        session.configure_id(&guid, &config.client.session_token)?;
        session.configure_error_correction(config.error_correction.to_config())?;
        session.configure_adaptive(config.adaptive.to_config())?;
        session.configure_reconnect(config.client.reconnect_policy())?;

        let priority = if index % 2 == 0 {
            Priority::Primary
        } else {
            Priority::Backup
        };
        group
            .add_component(session, url.as_str(), priority)
            .with_context(|| format!("bad component URL {}", url))?;
        tracing::info!("Component {}: {} ({:?})", index, url, priority);
    }

    let mut writer = open_output(Some(&args.out_host), Some(args.out_port))?;
    let options = ConnectOptions {
        low_latency: config.client.low_latency,
        connect_timeout: Duration::from_millis(config.client.connect_timeout_ms),
        ..ConnectOptions::default()
    };
    group
        .connect(options)
        .context("no component could connect")?;

    let stats_interval = config.client.stats_interval();
    let mut last_stats = Instant::now();
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        match group.read(&mut buf, false) {
            Ok(outcome) => {
                writer.write_all(&buf[..outcome.bytes])?;
                if outcome.eof {
                    break;
                }
            }
            Err(ErrorCode::NotReady) => thread::sleep(Duration::from_millis(5)),
            Err(ErrorCode::EndOfFile) => break,
            Err(code) => {
                let cause = group.last_error().ok().flatten().unwrap_or(code);
                anyhow::bail!("all components lost: {}", cause);
            }
        }

        if let Some(interval) = stats_interval {
            if last_stats.elapsed() >= interval {
                display_group_stats(&group.query_group_statistics()?);
                last_stats = Instant::now();
            }
        }
    }

    writer.flush()?;
    tracing::info!("End of stream");
    let _ = group.disconnect();
    context.destroy();
    Ok(())
}
