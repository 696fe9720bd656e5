use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::{stream::FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camrtc::camera::{ConfigCameraDirectory, LocalPathSigner, SignedUrlCache};
use camrtc::config::{self, ConfigStore};
use camrtc::events::{EventBus, SystemEvent};
use camrtc::state::AppState;
use camrtc::stream::{run_reaper, HttpPipelineClient, SessionRegistry, StreamDispatcher};
use camrtc::video::{SystemCaptureOpener, VideoSource};
use camrtc::web;
use camrtc::webrtc::mdns::mdns_mode_label;
use camrtc::webrtc::{SessionContext, WebRtcConfig};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// camrtc command line arguments
#[derive(Parser, Debug)]
#[command(name = "camrtc")]
#[command(version, about = "WebRTC streaming for managed cameras", long_about = None)]
struct CliArgs {
    /// Configuration file (TOML), created with defaults when missing
    #[arg(
        short = 'c',
        long,
        value_name = "FILE",
        env = "CAMRTC_CONFIG",
        default_value = "/etc/camrtc/camrtc.toml"
    )]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camrtc v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Configuration: {}", args.config.display());

    let config_store = ConfigStore::new(&args.config).await?;
    let config = config_store.get();
    tracing::info!(
        "{} cameras, {} gateways configured",
        config.cameras.len(),
        config.gateways.len()
    );

    let mut web_config = config.web.clone();
    if let Some(address) = args.address {
        web_config.bind_addresses = vec![address];
    }
    let bind_port = args.http_port.unwrap_or(web_config.http_port);
    let bind_ips = resolve_bind_addresses(&web_config)?;

    let events = Arc::new(EventBus::new());
    let shutdown = CancellationToken::new();

    // Capture and signing
    let signer = SignedUrlCache::new(LocalPathSigner::new(&config.storage.media_root));
    let video_source = VideoSource::new(
        Arc::new(SystemCaptureOpener::new()),
        Arc::new(signer),
        Duration::from_secs(config.storage.sign_expires_secs),
    );

    // Local sessions
    let webrtc_config = WebRtcConfig::from_settings(&config.webrtc);
    tracing::info!(
        "WebRTC: {} STUN servers, mDNS {}",
        webrtc_config.stun_servers.len(),
        mdns_mode_label(webrtc_config.mdns_mode)
    );
    let ctx = SessionContext::new(video_source.clone(), webrtc_config)
        .with_events(events.clone())
        .with_close_timeout(Duration::from_millis(config.stream.close_timeout_ms));

    let registry = Arc::new(
        SessionRegistry::new(config.stream.max_sessions).with_events(events.clone()),
    );
    let dispatcher = Arc::new(StreamDispatcher::new(
        ctx,
        registry.clone(),
        Arc::new(HttpPipelineClient::new()?),
        Duration::from_millis(config.stream.negotiation_timeout_ms),
    ));

    let state = AppState::new(
        config_store.clone(),
        Arc::new(ConfigCameraDirectory::new(config_store.clone())),
        video_source,
        dispatcher,
        events.clone(),
        shutdown.clone(),
    );

    // Terminal session reaper
    tokio::spawn(run_reaper(
        registry,
        events.clone(),
        Duration::from_secs(config.stream.reap_interval_secs.max(1)),
        shutdown.clone(),
    ));
    tracing::info!("Session reaper started");

    spawn_config_change_forwarder(config_store, events, shutdown.clone());

    let app = web::create_router(state.clone());

    let listeners = bind_tcp_listeners(&bind_ips, bind_port).await?;

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    let mut servers = FuturesUnordered::new();
    for listener in listeners {
        let local_addr = listener.local_addr()?;
        tracing::info!("Starting HTTP server on {}", local_addr);

        let token = shutdown.clone();
        let server = axum::serve(listener, app.clone())
            .with_graceful_shutdown(async move { token.cancelled().await });
        servers.push(async move { server.await });
    }

    tokio::select! {
        _ = shutdown_signal => {}
        result = servers.next() => {
            if let Some(Err(e)) = result {
                tracing::error!("HTTP server error: {}", e);
            }
        }
    }

    state.shutdown().await;
    // Let servers finish in-flight requests
    while servers.next().await.is_some() {}

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Republish configuration changes on the event bus
fn spawn_config_change_forwarder(
    config_store: ConfigStore,
    events: Arc<EventBus>,
    shutdown: CancellationToken,
) {
    let mut rx = config_store.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = rx.recv() => match change {
                    Ok(change) => events.publish(SystemEvent::ConfigChanged { key: change.key }),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camrtc=error,tower_http=error",
        LogLevel::Warn => "camrtc=warn,tower_http=warn",
        LogLevel::Info => "camrtc=info,tower_http=info",
        LogLevel::Verbose => "camrtc=debug,tower_http=info",
        LogLevel::Debug => "camrtc=debug,tower_http=debug,webrtc=info",
        LogLevel::Trace => "camrtc=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Resolve bind IPs from config, dropping duplicates
fn resolve_bind_addresses(web: &config::WebConfig) -> anyhow::Result<Vec<IpAddr>> {
    let mut seen = HashSet::new();
    let mut addrs = Vec::new();
    for addr in &web.bind_addresses {
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", addr))?;
        if seen.insert(ip) {
            addrs.push(ip);
        }
    }
    if addrs.is_empty() {
        anyhow::bail!("No bind address configured");
    }
    Ok(addrs)
}

async fn bind_tcp_listeners(
    addrs: &[IpAddr],
    port: u16,
) -> anyhow::Result<Vec<tokio::net::TcpListener>> {
    let mut listeners = Vec::new();
    for ip in addrs {
        let addr = SocketAddr::new(*ip, port);
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listeners.push(listener),
            Err(err) => {
                tracing::warn!("Failed to bind {}: {}", addr, err);
            }
        }
    }

    if listeners.is_empty() {
        anyhow::bail!("Failed to bind any addresses on port {}", port);
    }

    Ok(listeners)
}
