use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::assembly::AssemblyConfig;
use crate::error::{Result, StreamError};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::relay::RelayConnection;
use crate::session::{BandwidthEstimate, SessionConfig, SessionRegistry};
use crate::source::{FileSource, FrameSource, RelaySource, SourceKind, SyntheticSource};
use crate::streamer::{DEFAULT_STATS_INTERVAL, Streamer};
use crate::telemetry::{CsvTelemetry, NullTelemetry, TelemetrySink};
use crate::transport::{TransportFactory, UdpTransportFactory, tcp};

/// Server-level configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the signaling TCP listener (host:port).
    pub signaling_addr: String,
    /// Local address viewer media sockets bind to.
    pub media_bind_ip: IpAddr,
    /// Host advertised in offers and candidates.
    /// When `None`, the media socket's own address is used.
    pub public_host: Option<String>,
    /// Frame rate of the tick loop; also divides bitrates into budgets.
    pub fps: u32,
    /// Ticks between statistics samples.
    pub stats_interval: u32,
    /// Viewers that must join before the relay producer is greeted.
    pub required_viewers: u64,
    /// Capacity of completed-frame queues (relay and per-viewer upstream).
    pub queue_capacity: usize,
    /// Bounds for every fragment assembler.
    pub assembly: AssemblyConfig,
    pub source: SourceKind,
    /// `<prefix>_cont.csv` and `<prefix>_frames.csv` are written when set.
    pub telemetry_prefix: Option<PathBuf>,
    /// Estimate the reference UDP transport assigns to every viewer.
    pub static_estimate: BandwidthEstimate,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            signaling_addr: "127.0.0.1:5678".to_string(),
            media_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_host: None,
            fps: 30,
            stats_interval: DEFAULT_STATS_INTERVAL,
            required_viewers: 1,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            assembly: AssemblyConfig::default(),
            source: SourceKind::default(),
            telemetry_prefix: None,
            static_estimate: BandwidthEstimate::fixed(75_000_000),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(StreamError::InvalidConfig(msg.to_string()));
        if self.fps == 0 {
            return invalid("fps must be positive");
        }
        if self.stats_interval == 0 {
            return invalid("stats interval must be positive");
        }
        if self.required_viewers == 0 {
            return invalid("at least one viewer is required");
        }
        if self.queue_capacity == 0 {
            return invalid("queue capacity must be positive");
        }
        if self.assembly.max_in_flight == 0 {
            return invalid("assembler must allow at least one in-flight frame");
        }
        Ok(())
    }
}

/// High-level streaming server orchestrator.
///
/// Owns the session registry, the frame source and the threads around
/// them: the signaling accept loop, the tick loop and, for relay sources,
/// the producer handshake. Signaling connections are handled by
/// [`transport::tcp`](crate::transport::tcp).
pub struct Server {
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    running: Arc<AtomicBool>,
    factory: Arc<dyn TransportFactory>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    source: Option<Box<dyn FrameSource>>,
    relay: Option<Arc<RelayConnection>>,
    local_addr: Option<SocketAddr>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    /// Create a server using the reference UDP transport.
    pub fn new(config: ServerConfig) -> Self {
        let factory = Arc::new(UdpTransportFactory::new(
            config.media_bind_ip,
            config.public_host.clone(),
            config.static_estimate,
        ));
        Self::with_transport_factory(config, factory)
    }

    /// Create a server backed by another transport engine.
    pub fn with_transport_factory(config: ServerConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let registry = SessionRegistry::with_config(SessionConfig {
            assembly: config.assembly.clone(),
            upstream_capacity: config.queue_capacity,
        });
        Self {
            config: Arc::new(config),
            registry,
            running: Arc::new(AtomicBool::new(false)),
            factory,
            telemetry: None,
            source: None,
            relay: None,
            local_addr: None,
            threads: Vec::new(),
        }
    }

    /// Send telemetry to `sink` instead of the configured CSV files.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    /// Use an already constructed frame source instead of `config.source`.
    pub fn with_source(mut self, source: Box<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(StreamError::AlreadyRunning);
        }
        self.config.validate()?;

        let source = match self.source.take() {
            Some(source) => source,
            None => self.open_source()?,
        };
        let telemetry: Arc<dyn TelemetrySink> = match (&self.telemetry, &self.config.telemetry_prefix) {
            (Some(sink), _) => sink.clone(),
            (None, Some(prefix)) => Arc::new(CsvTelemetry::create(prefix)?),
            (None, None) => Arc::new(NullTelemetry),
        };

        let listener = TcpListener::bind(&self.config.signaling_addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let registry = self.registry.clone();
        let factory = self.factory.clone();
        self.threads.push(thread::spawn(move || {
            tcp::accept_loop(listener, registry, factory, running);
        }));

        if let Some(relay) = self.relay.clone() {
            let running = self.running.clone();
            let registry = self.registry.clone();
            let required = self.config.required_viewers;
            self.threads.push(thread::spawn(move || {
                relay_handshake(relay, registry, required, running);
            }));
        }

        let mut streamer = Streamer::new(source, self.registry.clone(), telemetry, self.config.fps)
            .with_stats_interval(self.config.stats_interval);
        let running = self.running.clone();
        self.threads.push(thread::spawn(move || streamer.run(&running)));

        tracing::info!(addr = %local_addr, fps = self.config.fps, "signaling server listening");
        Ok(())
    }

    fn open_source(&mut self) -> Result<Box<dyn FrameSource>> {
        let fps = self.config.fps;
        let source: Box<dyn FrameSource> = match &self.config.source {
            SourceKind::Files { dir } => Box::new(FileSource::open(dir, fps)?),
            SourceKind::Synthetic(synthetic) => Box::new(SyntheticSource::new(*synthetic, fps)?),
            SourceKind::Relay { bind } => {
                let relay = Arc::new(RelayConnection::bind(
                    bind,
                    self.config.queue_capacity,
                    self.config.assembly.clone(),
                )?);
                self.relay = Some(relay.clone());
                Box::new(RelaySource::new(relay))
            }
        };
        Ok(source)
    }

    /// Stop all loops, close the relay and tear down every session.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");

        if let Some(relay) = &self.relay {
            relay.close();
        }
        let terminated = self.registry.terminate_all();

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("server thread panicked");
            }
        }
        tracing::info!(terminated, "server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound signaling address, available after [`start`](Self::start).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local_addr.ok_or(StreamError::NotStarted)
    }

    /// Relay socket address, for relay sources after [`start`](Self::start).
    pub fn relay_addr(&self) -> Result<SocketAddr> {
        self.relay.as_ref().ok_or(StreamError::NotStarted)?.local_addr()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for the producer, then for enough viewers, then greet it.
fn relay_handshake(
    relay: Arc<RelayConnection>,
    registry: SessionRegistry,
    required: u64,
    running: Arc<AtomicBool>,
) {
    if let Err(e) = relay.accept_producer() {
        if running.load(Ordering::SeqCst) {
            tracing::error!(error = %e, "relay producer never connected");
        }
        return;
    }

    tracing::info!(required, "waiting for viewers before greeting producer");
    while !registry.wait_for_viewers(required, Some(Duration::from_millis(200))) {
        if !running.load(Ordering::SeqCst) {
            return;
        }
    }

    if let Err(e) = relay.start(registry) {
        tracing::error!(error = %e, "relay start failed");
    }
}
