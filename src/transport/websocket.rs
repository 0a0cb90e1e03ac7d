use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::accept_hdr_async_with_config;
use tracing::{debug, info, warn};
use tungstenite::Error as WsError;
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::{StatusCode, header::ORIGIN};
use tungstenite::protocol::{Message as WsMessage, WebSocketConfig};

use crate::broker::BrokerHandle;
use crate::client::Client;
use crate::config::{ConnectionSettings, SecuritySettings, Settings};
use crate::transport::handler;
use crate::transport::message::ServerMessage;
use crate::utils::error::{ProtocolError, ServerError};

const API_KEY_HEADER: &str = "x-api-key";

/// Bind `addr` and serve WebSocket connections until the task is dropped.
pub async fn start_websocket_server(
    addr: &str,
    broker: BrokerHandle,
    settings: Arc<Settings>,
) -> Result<(), ServerError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);

    serve(listener, broker, settings).await;
    Ok(())
}

/// Accept connections from an already bound listener.
pub async fn serve(listener: TcpListener, broker: BrokerHandle, settings: Arc<Settings>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    broker.clone(),
                    settings.clone(),
                ));
            }
            Err(e) => warn!(error = %e, "failed to accept connection"),
        }
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Origin and API key checks applied before the upgrade completes.
fn check_handshake(
    security: &SecuritySettings,
    request: &Request,
    response: Response,
) -> Result<Response, ErrorResponse> {
    let headers = request.headers();
    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !security.origin_allowed(origin) {
        warn!(origin = origin.unwrap_or_default(), "rejected handshake from disallowed origin");
        return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
    }

    let key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if !security.key_matches(key) {
        warn!("rejected handshake with invalid API key");
        return Err(reject(StatusCode::UNAUTHORIZED, "Invalid or missing API key"));
    }

    Ok(response)
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: BrokerHandle,
    settings: Arc<Settings>,
) {
    let security = settings.security.clone();
    let callback =
        move |request: &Request, response: Response| check_handshake(&security, request, response);
    let max_size = settings.connection.max_message_size;
    let config = WebSocketConfig::default()
        .max_message_size(Some(max_size))
        .max_frame_size(Some(max_size));

    let ws_stream = match accept_hdr_async_with_config(stream, callback, Some(config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut sink, source) = ws_stream.split();

    if broker.is_draining() {
        if let Some(frame) = ServerMessage::info("Server is shutting down").to_frame() {
            let _ = sink.send(frame).await;
        }
        let _ = sink.close().await;
        return;
    }

    let client = Arc::new(Client::new(
        settings.broker.max_queue_size,
        settings.broker.slow_consumer_grace(),
    ));
    info!(client_id = %client.id, %peer, "client connected");
    broker.register(client.clone());

    let writer = tokio::spawn(write_pump(
        client.clone(),
        sink,
        settings.connection.clone(),
    ));
    read_pump(&client, source, &broker, &settings.connection).await;

    broker.unregister(&client.id);
    client.close();
    let _ = writer.await;
    info!(client_id = %client.id, "client disconnected");
}

/// Read frames until the peer goes away, the read deadline passes or the
/// client is closed. Any inbound frame, pongs included, extends the deadline.
async fn read_pump<S>(
    client: &Arc<Client>,
    mut source: S,
    broker: &BrokerHandle,
    connection: &ConnectionSettings,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let pong_wait = connection.pong_wait();
    loop {
        let next = tokio::select! {
            biased;
            _ = client.closed() => break,
            next = time::timeout(pong_wait, source.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(client_id = %client.id, "read deadline exceeded");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(client_id = %client.id, error = %e, "read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => handler::handle_text(client, broker, text.as_str()),
            WsMessage::Binary(_) => handler::reject(client, None, &ProtocolError::BinaryFrame),
            WsMessage::Close(_) => break,
            // Pings are answered by tungstenite itself.
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}

/// Write queued frames and heartbeat pings until the client is closed or a
/// write fails. Every write is bounded by `write_wait`.
async fn write_pump<S>(client: Arc<Client>, mut sink: S, connection: ConnectionSettings)
where
    S: Sink<WsMessage, Error = WsError> + Unpin,
{
    let write_wait = connection.write_wait();
    let period = connection.ping_interval();
    let mut heartbeat = time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = client.closed() => {
                let _ = time::timeout(write_wait, sink.send(WsMessage::Close(None))).await;
                break;
            }
            _ = heartbeat.tick() => {
                let ping = WsMessage::Ping(Default::default());
                if !matches!(time::timeout(write_wait, sink.send(ping)).await, Ok(Ok(()))) {
                    debug!(client_id = %client.id, "heartbeat failed");
                    break;
                }
            }
            frame = client.next_frame() => {
                let written = time::timeout(write_wait, sink.send(frame)).await;
                client.frame_written();
                match written {
                    Ok(Ok(())) => heartbeat.reset(),
                    Ok(Err(e)) => {
                        debug!(client_id = %client.id, error = %e, "write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(client_id = %client.id, "write deadline exceeded");
                        break;
                    }
                }
            }
        }
    }

    client.close();
    let _ = time::timeout(write_wait, sink.close()).await;
}
