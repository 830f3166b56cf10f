//! Ingest feeder - push a UDP transport stream to an accepting receiver

use anyhow::Context as _;
use clap::Parser;
use ingest::{ConnectTarget, Context, ContextConfig, ErrorCode};
use ingest_cli::stats::feeder_line;
use ingest_cli::IngestConfig;
use std::io;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "ingest-feeder")]
#[command(about = "Feed a UDP stream into an ingest receiver", long_about = None)]
struct Args {
    /// UDP port the encoder sends to
    in_port: u16,

    channel: String,

    out_host: String,

    out_port: u16,

    /// Latency in milliseconds
    latency_ms: Option<u64>,

    /// Maximum bitrate in kbps
    kbps: Option<u32>,

    /// Drop frames above the maximum bitrate
    #[arg(long)]
    enforce: bool,

    /// -1 disables logging, 0 is the most verbose, 5 the least
    #[arg(allow_negative_numbers = true)]
    log_level: Option<i32>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = IngestConfig::load_or_default(args.config.as_deref())?;
    let log_level = args.log_level.unwrap_or(config.client.log_level);
    ingest_cli::init_logging(log_level);

    let mut feeder_config = config.feeder.to_config();
    feeder_config.channel = args.channel.clone();
    if let Some(ms) = args.latency_ms {
        feeder_config.latency = Duration::from_millis(ms);
    }
    if let Some(kbps) = args.kbps {
        feeder_config.max_bitrate = kbps.saturating_mul(1000);
    }
    feeder_config.enforce_bitrate |= args.enforce;
    feeder_config.reconnect = config.client.reconnect_policy();
    feeder_config.connect_timeout = Duration::from_millis(config.client.connect_timeout_ms);

    let input = UdpSocket::bind(("0.0.0.0", args.in_port))
        .with_context(|| format!("cannot bind input port {}", args.in_port))?;
    input.set_read_timeout(Some(Duration::from_millis(100)))?;
    tracing::info!("Reading from udp://0.0.0.0:{}", args.in_port);

    let context = Context::init(ContextConfig {
        log_level,
        ..ContextConfig::default()
    })?;
    let feeder = context
        .open_feeder(feeder_config)
        .context("invalid feeder settings")?;
    let target = ConnectTarget::Host {
        host: args.out_host.clone(),
        port: args.out_port,
        channel: args.channel.clone(),
    };
    feeder
        .connect(target)
        .with_context(|| format!("cannot reach {}:{}", args.out_host, args.out_port))?;
    tracing::info!("Feeding {:?} to {}:{}", args.channel, args.out_host, args.out_port);

    let feedback = feeder.encoder_feedback();
    let stats_interval = config.client.stats_interval();
    let mut last_stats = Instant::now();
    let mut buf = vec![0u8; 65536];

    loop {
        match input.recv(&mut buf) {
            Ok(n) => match feeder.send_frame(&buf[..n]) {
                Ok(()) => {}
                Err(ErrorCode::NotReady) => tracing::debug!("Frame over rate limit dropped"),
                Err(ErrorCode::NotConnected) => match feeder.status()? {
                    ingest::ConnectionState::Disconnected => {
                        anyhow::bail!("receiver connection lost")
                    }
                    state => tracing::debug!("Frame dropped while {:?}", state),
                },
                Err(code) => return Err(code.into()),
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                if feeder.status()? == ingest::ConnectionState::Disconnected {
                    anyhow::bail!("receiver connection lost");
                }
            }
            Err(e) => return Err(e).context("input socket failed"),
        }

        while let Some(command) = feeder.take_stream_command() {
            tracing::info!("Receiver requested {:?}", command);
        }
        for update in feedback.try_iter() {
            tracing::info!("Encoder feedback {:?}", update);
        }

        if let Some(interval) = stats_interval {
            if last_stats.elapsed() >= interval {
                eprintln!("{}", feeder_line(&feeder.query_statistics()?, feeder.current_bitrate()));
                last_stats = Instant::now();
            }
        }
    }
}
