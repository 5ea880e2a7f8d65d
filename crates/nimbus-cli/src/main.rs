//! nimbus - expose a local HTTP server through a QUIC tunnel edge.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nimbus_client::{QuickTunnelClient, Tunnel, TunnelConfig};
use nimbus_proto::{DEFAULT_EDGE_HOST, DEFAULT_EDGE_PORT};

/// Expose a local HTTP origin through a tunnel edge
#[derive(Parser, Debug)]
#[command(name = "nimbus")]
#[command(about = "Proxy HTTP requests from a tunnel edge to a local origin", long_about = None)]
#[command(version)]
struct Cli {
    /// Edge hostname to dial
    #[arg(long, env = "NIMBUS_EDGE_HOST", default_value = DEFAULT_EDGE_HOST)]
    edge_host: String,

    /// Edge UDP port
    #[arg(long, env = "NIMBUS_EDGE_PORT", default_value_t = DEFAULT_EDGE_PORT)]
    edge_port: u16,

    /// Local origin URL requests are proxied to
    #[arg(long, env = "NIMBUS_ORIGIN", default_value = "http://localhost:8080")]
    origin: String,

    /// Tunnel UUID (hex, with or without dashes)
    #[arg(long, env = "NIMBUS_TUNNEL_ID")]
    tunnel_id: Option<String>,

    /// Account tag the tunnel belongs to
    #[arg(long, env = "NIMBUS_ACCOUNT_TAG")]
    account_tag: Option<String>,

    /// Base64-encoded tunnel secret
    #[arg(long, env = "NIMBUS_TUNNEL_SECRET")]
    tunnel_secret: Option<String>,

    /// Request an ephemeral quick tunnel instead of using credentials
    #[arg(long)]
    quick: bool,

    /// Quick-tunnel service URL
    #[arg(long, env = "NIMBUS_QUICK_URL", default_value = nimbus_client::quick_tunnel::DEFAULT_QUICK_TUNNEL_URL)]
    quick_url: String,

    /// Origin TCP connect timeout in milliseconds
    #[arg(long, default_value_t = 5_000)]
    connect_timeout_ms: u32,

    /// Origin read timeout in milliseconds
    #[arg(long, default_value_t = 30_000)]
    read_timeout_ms: u32,

    /// Replace an existing connection registered with the same client
    #[arg(long)]
    replace_existing: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // QUIC and the bootstrap TLS client both need a process-wide provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = build_config(&cli).await?;

    info!(
        edge = %config.edge_host,
        port = config.edge_port,
        origin = %config.origin_url,
        "starting tunnel"
    );

    let tunnel = Tunnel::connect(config).await?;
    let shutdown = tunnel.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.shutdown().await;
        }
    });

    match tunnel.run().await {
        Ok(()) => {
            info!("tunnel closed");
            Ok(())
        }
        Err(e) => {
            error!("tunnel failed: {e}");
            Err(e.into())
        }
    }
}

/// Resolves credentials (quick tunnel or flags) into a tunnel configuration.
async fn build_config(cli: &Cli) -> Result<TunnelConfig> {
    let (tunnel_id, account_tag, tunnel_secret) = if cli.quick || cli.tunnel_id.is_none() {
        let credentials = QuickTunnelClient::new()
            .with_service_url(&cli.quick_url)
            .request_tunnel()
            .await
            .context("quick-tunnel bootstrap failed")?;
        info!(
            hostname = %credentials.hostname,
            "serving at https://{}",
            credentials.hostname
        );
        (
            credentials.tunnel_id,
            credentials.account_tag,
            credentials.tunnel_secret,
        )
    } else {
        let id_text = cli.tunnel_id.as_deref().context("--tunnel-id is required")?;
        let tunnel_id = uuid::Uuid::parse_str(id_text)
            .context("invalid --tunnel-id")?
            .into_bytes();
        let account_tag = cli
            .account_tag
            .clone()
            .context("--account-tag is required with --tunnel-id")?;
        let secret_text = cli
            .tunnel_secret
            .as_deref()
            .context("--tunnel-secret is required with --tunnel-id")?;
        let tunnel_secret = BASE64
            .decode(secret_text.trim())
            .context("invalid --tunnel-secret (expected base64)")?;
        (tunnel_id, account_tag, tunnel_secret)
    };

    Ok(TunnelConfig::new(tunnel_id, account_tag, tunnel_secret)
        .with_edge(cli.edge_host.clone(), cli.edge_port)
        .with_origin(cli.origin.clone())
        .with_timeouts(
            Duration::from_millis(cli.connect_timeout_ms as u64),
            Duration::from_millis(cli.read_timeout_ms as u64),
        )
        .with_replace_existing(cli.replace_existing))
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
