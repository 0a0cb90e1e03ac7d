//! CLI for PubHub
//!
//! Subcommands:
//! - `server`: run the WebSocket broker and the admin API
//! - `client`: subscribe and publish once against a running server (smoke test)

use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser};
use pubhub::broker::Broker;
use pubhub::config::load_config_from;
use pubhub::transport::rest::{AdminState, start_admin_server};
use pubhub::transport::websocket::start_websocket_server;
use pubhub::utils::error::ServerError;
use pubhub::utils::logging;
use tokio::task::JoinError;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pubhub", version, about = "In-memory WebSocket pub/sub broker")]
enum Command {
    /// Start the broker
    Server(ServerArgs),
    /// Run the example client against a running broker
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        /// Topic to subscribe and publish to; it must already exist
        #[arg(long, default_value = "chat")]
        topic: String,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// Configuration file, overriding `config/default.toml`
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    admin_port: Option<u16>,
    /// Log level when `RUST_LOG` is not set
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    match Command::parse() {
        Command::Server(args) => run_server(args).await,
        Command::Client { url, topic } => {
            logging::init("info", "text");
            run_client(&url, &topic).await
        }
    }
}

fn flatten(joined: Result<Result<(), ServerError>, JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok(result) => result.map_err(Into::into),
        Err(e) => Err(e.into()),
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let mut settings =
        load_config_from(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(admin_port) = args.admin_port {
        settings.server.admin_port = admin_port;
    }
    if let Some(level) = args.log_level {
        settings.logging.level = level;
    }

    logging::init(&settings.logging.level, &settings.logging.format);
    info!(
        max_queue_size = settings.broker.max_queue_size,
        replay_buffer_size = settings.broker.replay_buffer_size,
        "starting pubhub"
    );

    let settings = Arc::new(settings);
    let broker = Broker::new(&settings);
    let handle = broker.handle();
    let coordinator = tokio::spawn(broker.run());

    let ws_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let admin_addr = format!("{}:{}", settings.server.host, settings.server.admin_port);
    let mut websocket = {
        let (handle, settings) = (handle.clone(), settings.clone());
        tokio::spawn(async move { start_websocket_server(&ws_addr, handle, settings).await })
    };
    let mut admin = {
        let state = AdminState::new(handle.clone(), settings.security.clone());
        tokio::spawn(async move { start_admin_server(&admin_addr, state).await })
    };

    let outcome = tokio::select! {
        joined = &mut websocket => {
            error!("WebSocket server exited unexpectedly");
            flatten(joined)
        }
        joined = &mut admin => {
            error!("admin server exited unexpectedly");
            flatten(joined)
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining connections");
            Ok(())
        }
    };

    handle.shutdown();
    let report = coordinator.await.context("broker coordinator panicked")?;
    info!(
        flushed = report.flushed,
        closed = report.closed,
        remaining = report.remaining,
        "shutdown complete"
    );
    websocket.abort();
    admin.abort();

    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn run_client(url: &str, topic: &str) -> anyhow::Result<()> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    let subscribe = json!({
        "type": "subscribe",
        "topic": topic,
        "client_id": "pubhub-cli",
        "last_n": 5,
        "request_id": "sub-1"
    });
    ws_stream.send(WsMessage::text(subscribe.to_string())).await?;

    let publish = json!({
        "type": "publish",
        "topic": topic,
        "message": { "id": uuid::Uuid::new_v4().to_string(), "payload": "Hello from pubhub" },
        "request_id": "pub-1"
    });
    ws_stream.send(WsMessage::text(publish.to_string())).await?;

    // Replayed events, two acks and our own event.
    let deadline = tokio::time::sleep(std::time::Duration::from_secs(2));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            frame = ws_stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => println!("{text}"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => break,
            },
        }
    }

    ws_stream.close(None).await?;
    Ok(())
}
