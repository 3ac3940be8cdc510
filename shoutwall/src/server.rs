//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── outbound channel ── Client A
//!             ├── per-conn task ────┤
//! Client B ──┘        │             └── outbound channel ── Client B
//!                     ▼
//!              IngestionPipeline
//!        Sanitizer → RateLimiter → Enricher
//!                     │
//!              MessageLog (RocksDB / memory)
//!                     │
//!              ConnectionRegistry (fan-out)
//! ```
//!
//! Each connection runs one task: frames from the same client are processed
//! strictly in order, while distinct clients proceed concurrently. A new
//! connection first receives the recent history (oldest first), then joins
//! the live broadcast set.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::enrich::{
    ConnContext, Enricher, HeaderLookup, HttpLookup, DEFAULT_LOOKUP_TIMEOUT_MS,
};
use crate::identity::{IdentitySalt, SenderIdentity};
use crate::pipeline::{Pipeline, SenderContext};
use crate::protocol::ServerFrame;
use crate::rate_limit::{RateLimiter, DEFAULT_RATE_MS};
use crate::registry::ConnectionRegistry;
use crate::sanitize::{Sanitizer, DEFAULT_MAX_LEN};
use crate::store::{MemoryLog, MessageLog, RocksLog, StoreConfig, StoreError};

/// How the country annotation is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoMode {
    /// No enrichment; messages carry no country field.
    Off,
    /// Trust a reverse-proxy-supplied country header.
    Header,
    /// Reverse-lookup the client IP against an external service.
    Http,
}

impl GeoMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "off" | "none" | "disabled" => Some(GeoMode::Off),
            "header" => Some(GeoMode::Header),
            "http" => Some(GeoMode::Http),
            _ => None,
        }
    }
}

/// Enrichment configuration.
#[derive(Debug, Clone)]
pub struct GeoConfig {
    pub mode: GeoMode,
    /// Trusted country header, for [`GeoMode::Header`]
    pub header: String,
    /// Endpoint template with `{ip}` placeholder, for [`GeoMode::Http`]
    pub url: String,
    /// Lookup timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            mode: GeoMode::Off,
            header: "cf-ipcountry".to_string(),
            url: "https://ipapi.co/{ip}/json/".to_string(),
            timeout_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum post length in characters
    pub max_len: usize,
    /// Cooldown between accepted posts per identity, in milliseconds
    pub rate_ms: u64,
    /// Messages replayed to a newly connected client
    pub history_limit: usize,
    /// Outbound channel capacity per connection
    pub broadcast_capacity: usize,
    /// Persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Country enrichment
    pub geo: GeoConfig,
    /// Rate-limit eviction sweep interval in seconds
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            max_len: DEFAULT_MAX_LEN,
            rate_ms: DEFAULT_RATE_MS,
            history_limit: 200,
            broadcast_capacity: 256,
            storage_path: None,
            geo: GeoConfig::default(),
            sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Build configuration from the environment.
    ///
    /// Recognized: `BIND_ADDR` (or `PORT`), `DATA_DIR`, `MAX_LEN`,
    /// `RATE_MS`, `HISTORY_LIMIT`, `GEO_MODE` (off|header|http),
    /// `GEO_HEADER`, `GEO_URL`, `GEO_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bind) = std::env::var("BIND_ADDR") {
            config.bind_addr = bind;
        } else if let Some(port) = env_parse_opt::<u16>("PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }

        config.storage_path = std::env::var("DATA_DIR").ok().map(PathBuf::from);
        config.max_len = env_parse("MAX_LEN", config.max_len);
        config.rate_ms = env_parse("RATE_MS", config.rate_ms);
        config.history_limit = env_parse("HISTORY_LIMIT", config.history_limit);
        config.geo.timeout_ms = env_parse("GEO_TIMEOUT_MS", config.geo.timeout_ms);

        if let Ok(raw) = std::env::var("GEO_MODE") {
            match GeoMode::parse(&raw) {
                Some(mode) => config.geo.mode = mode,
                None => log::warn!("unknown GEO_MODE {raw:?}, enrichment stays off"),
            }
        }
        if let Ok(header) = std::env::var("GEO_HEADER") {
            config.geo.header = header;
        }
        if let Ok(url) = std::env::var("GEO_URL") {
            config.geo.url = url;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_parse_opt(key).unwrap_or(default)
}

fn env_parse_opt<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub accepted_messages: u64,
    pub dropped_frames: u64,
}

/// The relay server.
///
/// All mutable state lives in components constructed here and shared by
/// handle: independent server instances never interfere, which is also
/// what makes them cheap to stand up in tests.
pub struct RelayServer {
    config: ServerConfig,
    pipeline: Arc<Pipeline>,
    registry: Arc<ConnectionRegistry>,
    limiter: Arc<RateLimiter>,
    log: Arc<dyn MessageLog>,
    enricher: Arc<Enricher>,
    salt: IdentitySalt,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    /// Create a server. Fails only on storage initialization — running
    /// with a broken log would silently violate the durability contract,
    /// so that aborts startup instead.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let log: Arc<dyn MessageLog> = match &config.storage_path {
            Some(path) => Arc::new(RocksLog::open(StoreConfig::new(path.clone()))?),
            None => {
                log::warn!("no storage path configured, messages will not survive restart");
                Arc::new(MemoryLog::new())
            }
        };

        let timeout = Duration::from_millis(config.geo.timeout_ms);
        let enricher = match config.geo.mode {
            GeoMode::Off => Enricher::disabled(),
            GeoMode::Header => Enricher::new(Arc::new(HeaderLookup), timeout),
            GeoMode::Http => match HttpLookup::new(config.geo.url.clone(), timeout) {
                Ok(lookup) => Enricher::new(Arc::new(lookup), timeout),
                Err(e) => {
                    log::warn!("geo lookup client unavailable ({e}), enrichment disabled");
                    Enricher::disabled()
                }
            },
        };

        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(config.rate_ms)));
        let registry = Arc::new(ConnectionRegistry::new(config.broadcast_capacity));
        let pipeline = Arc::new(Pipeline::new(
            Sanitizer::new(config.max_len),
            limiter.clone(),
            log.clone(),
            registry.clone(),
        ));

        Ok(Self {
            config,
            pipeline,
            registry,
            limiter,
            log,
            enricher: Arc::new(enricher),
            salt: IdentitySalt::generate(),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Create with default configuration (in-memory, no enrichment).
    pub fn with_defaults() -> Self {
        // Default config has no storage path, so construction cannot fail
        Self::new(ServerConfig::default()).expect("in-memory server construction")
    }

    /// Start listening for WebSocket connections.
    ///
    /// Runs the accept loop forever; call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        // Periodic rate-limit eviction, so the identity map is bounded by
        // active senders instead of all senders ever seen.
        let limiter = self.limiter.clone();
        let sweep_every = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                let evicted = limiter.sweep(Instant::now());
                if evicted > 0 {
                    log::debug!("rate-limit sweep evicted {evicted} idle identities");
                }
            }
        });

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let pipeline = self.pipeline.clone();
            let registry = self.registry.clone();
            let log_handle = self.log.clone();
            let enricher = self.enricher.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let salt = self.salt;

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream, addr, pipeline, registry, log_handle, enricher, salt,
                    stats, config,
                )
                .await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handshake, enrich, then hand over to the relay loop.
    #[allow(clippy::too_many_arguments)]
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        pipeline: Arc<Pipeline>,
        registry: Arc<ConnectionRegistry>,
        log_handle: Arc<dyn MessageLog>,
        enricher: Arc<Enricher>,
        salt: IdentitySalt,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Capture the two headers we care about during the handshake.
        let mut forwarded_for: Option<String> = None;
        let mut country_header: Option<String> = None;
        let geo_header = config.geo.header.clone();

        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| {
                forwarded_for = header_value(req, "x-forwarded-for");
                country_header = header_value(req, &geo_header);
                Ok(resp)
            },
        )
        .await?;

        let mut ctx = ConnContext::new(addr);
        ctx.forwarded_for = forwarded_for;
        ctx.country_header = country_header;

        let identity = SenderIdentity::derive(&salt, &ctx.client_ip());
        // Connection-scoped enrichment: one lookup, cached for the lifetime
        let country = enricher.annotate(&ctx).await;
        let sender = SenderContext { identity, country };

        log::info!("websocket connection established from {addr} (sender {identity})");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::relay_loop(
            ws_stream, addr, sender, pipeline, registry, log_handle, stats.clone(),
            config.history_limit,
        )
        .await;

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }
        log::info!("connection closed from {addr}");

        result
    }

    /// History replay, then the select loop between inbound frames and
    /// outbound broadcasts. The connection is always unregistered on the
    /// way out, whatever ended the loop.
    #[allow(clippy::too_many_arguments)]
    async fn relay_loop(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        sender: SenderContext,
        pipeline: Arc<Pipeline>,
        registry: Arc<ConnectionRegistry>,
        log_handle: Arc<dyn MessageLog>,
        stats: Arc<RwLock<ServerStats>>,
        history_limit: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Replay recent history, oldest first, before joining the live set.
        // A failed read degrades to an empty backlog rather than refusing
        // the connection.
        match log_handle.recent(history_limit) {
            Ok(history) => {
                for msg in history {
                    let payload = ServerFrame::message(msg).encode()?;
                    ws_sender.send(WsMessage::Text(payload.into())).await?;
                }
            }
            Err(e) => log::error!("history replay failed for {addr}: {e}"),
        }

        let (conn_id, mut outbound_rx) = registry.register().await;

        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(raw))) => {
                            match pipeline.ingest(&sender, raw.as_str()).await {
                                Ok(_) => {
                                    stats.write().await.accepted_messages += 1;
                                }
                                Err(reason) => {
                                    // Fire-and-forget: nothing goes back
                                    log::debug!(
                                        "dropped frame from {}: {reason}",
                                        sender.identity
                                    );
                                    stats.write().await.dropped_frames += 1;
                                }
                            }
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            log::debug!("dropped binary frame from {}", sender.identity);
                            stats.write().await.dropped_frames += 1;
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            if ws_sender.send(WsMessage::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::debug!("websocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                outbound = outbound_rx.recv() => {
                    match outbound {
                        Some(payload) => {
                            let frame = WsMessage::Text(payload.to_string().into());
                            if ws_sender.send(frame).await.is_err() {
                                break;
                            }
                        }
                        // Registry dropped us (send failure path)
                        None => break,
                    }
                }
            }
        }

        registry.unregister(&conn_id).await;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the connection registry handle.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Get the message log handle.
    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }
}

fn header_value(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
