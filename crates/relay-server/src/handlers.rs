//! Connection handlers for the relay server.
//!
//! This module owns the HTTP router and the WebSocket session loop: it
//! decodes inbound frames, hands events to the relay, and drains the
//! connection's outbound queue back onto the socket.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::users;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use relay_core::{
    ConnectionId, MemoryStore, MessageStore, Multiplexer, PresenceRegistry, Relay, RelayConfig,
};
use relay_protocol::{codec, InboundEvent, OutboundEvent, ProtocolError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The relay core.
    pub relay: Arc<Relay>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state over the given store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let relay_config = RelayConfig {
            remove_presence_on_close: config.presence.remove_on_disconnect,
            ..RelayConfig::default()
        };

        let relay = Relay::new(
            Arc::new(PresenceRegistry::new()),
            Arc::new(Multiplexer::with_capacity(config.transport.outbox_capacity)),
            store,
            relay_config,
        );

        Self {
            relay: Arc::new(relay),
            config,
        }
    }
}

/// Wire encoding used for a connection's outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Json,
    MessagePack,
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone(), Arc::new(MemoryStore::new())));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, state).await
}

/// Serve the relay on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops with an I/O error.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    spawn_failure_monitor(&state.relay);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/register", post(users::register))
        .route("/users", get(users::list_users))
        .route("/usersall", get(users::list_usernames))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Count store failures published by the relay.
fn spawn_failure_monitor(relay: &Relay) {
    let mut failures = relay.subscribe_failures();
    tokio::spawn(async move {
        loop {
            match failures.recv().await {
                Ok(failure) => metrics::record_persistence_failure(failure.operation),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Failure monitor lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.relay.multiplexer().stats();
    let online = state.relay.presence().snapshot().await.len();

    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.open_connections,
        "online": online,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let max_message_size = state.config.limits.max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let max_message_size = state.config.limits.max_message_size;

    let (connection_id, mut outbox) = state.relay.multiplexer().open();
    info!(connection = %connection_id, "Client connected");

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut encoding = Encoding::Json;

    loop {
        tokio::select! {
            biased;

            // Events queued for this connection by the relay
            Some(event) = outbox.recv() => {
                if let Err(e) = send_event(&mut sender, &event, encoding).await {
                    debug!(connection = %connection_id, error = %e, "Failed to deliver event");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        if text.len() > max_message_size {
                            warn!(
                                connection = %connection_id,
                                size = text.len(),
                                "Message too large"
                            );
                            metrics::record_protocol_error("too_large");
                            continue;
                        }

                        match codec::decode_text(&text) {
                            Ok(event) => {
                                dispatch_event(&state, &connection_id, event, text.len()).await;
                            }
                            Err(e) => reject_frame(&connection_id, &e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        if data.len() > max_message_size {
                            warn!(
                                connection = %connection_id,
                                size = data.len(),
                                "Message too large"
                            );
                            metrics::record_protocol_error("too_large");
                            continue;
                        }

                        read_buffer.extend_from_slice(&data);
                        drain_binary_frames(&state, &connection_id, &mut read_buffer).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_protocol_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    state.relay.connection_closed(&connection_id).await;
    metrics::set_presence_online(state.relay.presence().snapshot().await.len());
}

/// Decode every complete MessagePack frame in the buffer.
async fn drain_binary_frames(state: &AppState, connection_id: &ConnectionId, buf: &mut BytesMut) {
    loop {
        let buffered = buf.len();
        match codec::decode_from::<InboundEvent>(buf) {
            Ok(Some(event)) => {
                dispatch_event(state, connection_id, event, buffered - buf.len()).await;
            }
            Ok(None) => break,
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                // The length prefix cannot be trusted; drop everything buffered.
                reject_frame(connection_id, &e);
                buf.clear();
                break;
            }
            // The bad frame was consumed; keep going with the rest
            Err(e) => reject_frame(connection_id, &e),
        }
    }
}

/// Hand a decoded event to the relay.
async fn dispatch_event(
    state: &AppState,
    connection_id: &ConnectionId,
    event: InboundEvent,
    size: usize,
) {
    let start = Instant::now();
    let name = event.name();
    let changes_presence = matches!(
        event,
        InboundEvent::UserConnected(_) | InboundEvent::UserDisconnected(_)
    );

    debug!(connection = %connection_id, event = %name, "Inbound event");
    metrics::record_event(name.as_str(), "inbound", size);

    match state.relay.dispatch(connection_id, event).await {
        Ok(Some(task)) => {
            tokio::spawn(async move {
                if let Some(elapsed) = completion_latency(start, task).await {
                    metrics::record_latency(elapsed.as_secs_f64());
                }
            });
        }
        Ok(None) => {
            if changes_presence {
                metrics::set_presence_online(state.relay.presence().snapshot().await.len());
            }
            metrics::record_latency(start.elapsed().as_secs_f64());
        }
        Err(e) => {
            warn!(connection = %connection_id, event = %name, error = %e, "Event rejected");
            metrics::record_protocol_error("misuse");
        }
    }
}

/// Time from `start` until a spawned relay task finishes.
///
/// `None` if the task panicked or was cancelled.
async fn completion_latency(start: Instant, task: JoinHandle<()>) -> Option<Duration> {
    task.await.ok().map(|()| start.elapsed())
}

fn reject_frame(connection_id: &ConnectionId, error: &ProtocolError) {
    let kind = match error {
        ProtocolError::Misuse(_) => "misuse",
        ProtocolError::Json(_) => "json",
        ProtocolError::Decode(_) => "msgpack",
        ProtocolError::FrameTooLarge(_) => "too_large",
        ProtocolError::Incomplete(_) | ProtocolError::Encode(_) => "other",
    };
    warn!(connection = %connection_id, error = %error, "Dropping malformed frame");
    metrics::record_protocol_error(kind);
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &OutboundEvent,
    encoding: Encoding,
) -> Result<()> {
    let message = match encoding {
        Encoding::Json => Message::Text(codec::encode_text(event)?),
        Encoding::MessagePack => Message::Binary(codec::encode(event)?.to_vec()),
    };

    let size = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_event(event.name().as_str(), "outbound", size);

    sender.send(message).await?;
    Ok(())
}
