use clap::{Parser, ValueEnum};
use layercast::session::BandwidthEstimate;
use layercast::source::{SourceKind, SyntheticConfig, SyntheticMode};
use layercast::{Server, ServerConfig};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "layercast-server",
    about = "Adaptive layered frame streaming server"
)]
struct Args {
    /// Relay port for a remote frame producer; layered files are used when absent
    #[arg(long, short = 'p')]
    proxy_port: Option<u16>,

    /// Layered content directory (layer_0, layer_1, layer_2)
    #[arg(long, short = 'd', default_value = "content")]
    content_dir: PathBuf,

    /// Frame rate of the tick loop
    #[arg(long, short = 'f', default_value_t = 30)]
    fps: u32,

    /// Signaling address (host:port)
    #[arg(long, short = 's', default_value = "127.0.0.1:5678")]
    signaling: String,

    /// Viewers to wait for before greeting the relay producer
    #[arg(long, short = 'c', default_value_t = 1)]
    clients: u64,

    /// Telemetry path prefix (<prefix>_cont.csv, <prefix>_frames.csv)
    #[arg(long, short = 'm')]
    results: Option<PathBuf>,

    /// Bitrate the UDP transport assigns to every viewer (bits/s)
    #[arg(long, default_value_t = 75_000_000)]
    bitrate: u64,

    /// Stream random payloads of this many bits/s instead of content
    #[arg(long)]
    synthetic: Option<u64>,

    /// How synthetic payloads are sized
    #[arg(long, value_enum, default_value_t = Mode::Fixed, requires = "synthetic")]
    synthetic_mode: Mode,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Always the configured bitrate
    Fixed,
    /// Whatever each viewer's budget allows
    FollowBudget,
    /// Never send; frame counters still advance
    Silent,
}

impl From<Mode> for SyntheticMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Fixed => SyntheticMode::Fixed,
            Mode::FollowBudget => SyntheticMode::FollowBudget,
            Mode::Silent => SyntheticMode::Silent,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let source = match (args.proxy_port, args.synthetic) {
        (Some(port), _) => SourceKind::Relay {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        },
        (None, Some(bitrate_bps)) => SourceKind::Synthetic(SyntheticConfig {
            bitrate_bps,
            mode: args.synthetic_mode.into(),
        }),
        (None, None) => SourceKind::Files {
            dir: args.content_dir,
        },
    };

    let config = ServerConfig {
        signaling_addr: args.signaling.clone(),
        fps: args.fps,
        required_viewers: args.clients,
        source,
        telemetry_prefix: args.results,
        static_estimate: BandwidthEstimate::fixed(args.bitrate),
        ..ServerConfig::default()
    };

    let mut server = Server::new(config);

    if let Err(e) = server.start() {
        eprintln!("Failed to start server: {}", e);
        return ExitCode::FAILURE;
    }

    if let Ok(relay) = server.relay_addr() {
        println!("Relay listening on {relay}, waiting for producer");
    }
    println!("Signaling on {} - press Enter to stop", args.signaling);
    let mut input = String::new();
    if let Err(e) = io::stdin().read_line(&mut input) {
        eprintln!("Failed to read stdin: {}", e);
    }

    server.stop();
    ExitCode::SUCCESS
}
