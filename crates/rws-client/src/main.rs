//! rws-client command-line entry point.
//!
//! Connects to a jsonRWS relay, asks for its own socket id, then logs every
//! event until Ctrl-C.  Route messages are dispatched through a small
//! [`Router`].
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config_from() + CLI overrides
//!  └─ RwsClient::new()      -- event pump
//!  └─ connect()             -- upgrade + supervisor (read loop, reconnect)
//!  └─ event loop
//!       ├─ Route            -> Router::dispatch
//!       ├─ Message          -> log
//!       └─ Ctrl-C           -> shutdown()
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rws_core::{DispatchOutcome, RouteError, RouteTransaction, Router};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rws_client::infrastructure::storage::config::{config_file_path, load_config_from};
use rws_client::{ClientEvent, RwsClient};

/// jsonRWS websocket client.
#[derive(Debug, Parser)]
#[command(name = "rws-client", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory).
    #[arg(long, env = "RWS_CONFIG")]
    config: Option<PathBuf>,

    /// Relay URL, e.g. `ws://localhost:3211?authkey=TRTmrt`.
    #[arg(long, env = "RWS_URL")]
    url: Option<String>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "RWS_LOG_LEVEL")]
    log_level: Option<String>,

    /// Send a PING every N milliseconds.
    #[arg(long)]
    ping_interval_ms: Option<u64>,

    /// Nickname to register after connecting.
    #[arg(long)]
    nick: Option<String>,

    /// Rooms to enter after connecting.
    #[arg(long = "room")]
    rooms: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = match cli.config {
        Some(path) => path,
        None => config_file_path().context("locating config file")?,
    };
    let mut config = load_config_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(url) = cli.url {
        config.connection.url = url;
    }
    if let Some(level) = cli.log_level {
        config.logging.log_level = level;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level)),
        )
        .init();

    info!("rws-client starting, relay {}", config.connection.url);

    let client = RwsClient::new(&config.connection).context("invalid connection settings")?;
    let mut events = client.subscribe();

    client.connect().await.context("connecting to relay")?;
    match client.info_socket_id().await {
        Ok(id) => info!(socket_id = id, "relay confirmed socket id"),
        Err(e) => warn!("could not confirm socket id: {e}"),
    }
    if let Some(nick) = &cli.nick {
        client.set_nick(nick).await?;
    }
    for room in &cli.rooms {
        client.room_enter(room).await?;
    }

    let ping_task = cli
        .ping_interval_ms
        .map(|ms| client.ping(Duration::from_millis(ms), None));

    let router = build_router()?;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("could not listen for Ctrl-C: {e}");
                }
                info!("shutdown signal received");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Connected { socket_id, subprotocol } => {
                        info!(socket_id, ?subprotocol, "connected");
                    }
                    ClientEvent::Route(envelope) => {
                        match RwsClient::dispatch_route(&router, &envelope, envelope.from).await {
                            Ok(DispatchOutcome::Matched(pattern)) => info!(%pattern, "route handled"),
                            Ok(outcome) => warn!(?outcome, "route not handled"),
                            Err(e) => warn!("route failed: {e}"),
                        }
                    }
                    ClientEvent::Message(envelope) => {
                        info!(cmd = %envelope.cmd, from = envelope.from, payload = ?envelope.payload, "message");
                    }
                    ClientEvent::MessageError { raw, error } => warn!(%raw, "bad message: {error}"),
                    ClientEvent::Ping => info!("ping from relay"),
                    ClientEvent::Pong => info!("pong from relay"),
                    ClientEvent::ClosedByServer => warn!("relay closed the connection"),
                    ClientEvent::Disconnected { reconnecting } => {
                        warn!(reconnecting, "disconnected");
                        if !reconnecting {
                            break;
                        }
                    }
                    ClientEvent::TransportError(message) => error!("transport error: {message}"),
                }
            }
        }
    }

    client.shutdown().await;
    if let Some(task) = ping_task {
        let _ = task.await;
    }
    info!("rws-client stopped");
    Ok(())
}

/// Routes served by this client.  The context is the sender's socket id.
fn build_router() -> Result<Router<u64>, RouteError> {
    let mut router = Router::new();
    router.register("/returned/back/:n", |trx: RouteTransaction<u64>| async move {
        info!(from = trx.context, params = ?trx.params, body = ?trx.body, "returned back");
        Ok::<(), RouteError>(())
    })?;
    router.set_not_found(|trx: RouteTransaction<u64>| async move {
        warn!(uri = %trx.uri, from = trx.context, "no route");
        Ok::<(), RouteError>(())
    });
    Ok(router)
}
