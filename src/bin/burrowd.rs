//! Burrow daemon
//!
//! Runs one endpoint role from a TOML configuration:
//! - establishes links (dialing with backoff, or accepting)
//! - serves the process-wide router
//! - drains inbound circuits by resolving their destination against the
//!   router and splicing bytes both ways
//!
//! Two daemons, one client and one server, form a working relay: the
//! client advertises the domains it can reach, the server routes matching
//! requests back through the link.

use anyhow::{anyhow, Context, Result};
use burrow::config::{generate_example_config, Config};
use burrow::endpoint::Endpoint;
use burrow::router::Router;
use burrow::tunnel::{Incoming, INCOMING_CAPACITY};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Burrow - reverse-tunnel multiplexer daemon
#[derive(Parser, Debug)]
#[command(name = "burrowd")]
#[command(about = "Burrow - reverse-tunnel multiplexer daemon")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "burrow.toml")]
    config: String,

    /// Write an example configuration and exit
    #[arg(long)]
    init_config: bool,

    /// Address override (host:port)
    #[arg(short, long)]
    address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    if args.init_config {
        generate_example_config()
            .save(&args.config)
            .context("Failed to write example configuration")?;
        info!("example configuration written to {}", args.config);
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;
    let mode = config
        .endpoint
        .mode()
        .map_err(|e| anyhow!("invalid configuration: {}", e))?;

    let address = args.address.unwrap_or(config.endpoint.address);
    let router = Arc::new(Router::new());

    let mut endpoint = Endpoint::new(mode, address.clone())
        .with_router(Arc::clone(&router))
        .with_verify_server(config.endpoint.verify)
        .with_router_item(config.endpoint.domains)
        .with_default_domains(config.endpoint.default_domains);
    if !config.endpoint.secpath.is_empty() {
        endpoint = endpoint.with_secpath(config.endpoint.secpath.as_str());
    }

    let shutdown = endpoint.shutdown_token();
    let (stream_tx, mut stream_rx) = mpsc::channel(INCOMING_CAPACITY);

    info!("burrowd v{} running as {:?} for {}", burrow::VERSION, mode, address);
    let mut endpoint_task = tokio::spawn(endpoint.run(stream_tx));

    loop {
        tokio::select! {
            incoming = stream_rx.recv() => match incoming {
                Some(incoming) => {
                    let router = Arc::clone(&router);
                    tokio::spawn(async move {
                        if let Err(e) = forward(router, incoming).await {
                            debug!("forward: {:#}", e);
                        }
                    });
                }
                None => {
                    warn!("endpoint stopped delivering streams");
                    break;
                }
            },
            res = &mut endpoint_task => {
                res.context("endpoint task panicked")??;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                shutdown.cancel();
                break;
            }
        }
    }

    let _ = endpoint_task.await;
    Ok(())
}

/// Resolve an inbound circuit's destination and splice bytes both ways.
async fn forward(router: Arc<Router>, incoming: Incoming) -> Result<()> {
    let Incoming { loc, mut conn } = incoming;

    let network = router.resolve(&loc);
    let mut upstream = network
        .dial(&loc)
        .await
        .with_context(|| format!("dial {}", loc))?;

    let (sent, received) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    debug!("{}: {} bytes out, {} bytes in", loc, sent, received);
    Ok(())
}
