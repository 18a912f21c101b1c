//! Connection handlers for Murmur server.
//!
//! This module handles the connection lifecycle:
//!
//! 1. The first frame must be a connect frame, within the connect timeout.
//!    Bad credentials close the socket without registering anything.
//! 2. A writer task drains the connection's outbound queue and sends pings.
//!    The client's first message type picks the encoding: text frames get
//!    JSON, binary frames get length-prefixed MessagePack.
//! 3. The read loop handles action frames until the client leaves, a read
//!    fails, or no pong arrives within the pong wait.

use crate::config::{Config, HeartbeatConfig};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_core::{outbound_queue, Directories, Hub, Instance, MemoryStore, Outbound, OutboundReceiver};
use murmur_protocol::{codec, AckFrame, ActionFrame, ConnectFrame, Encoded, Encoding, ProtocolError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

/// Why a session ended.
#[derive(Debug, Error)]
enum SessionError {
    #[error("No connect frame within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Invalid frame: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No pong within {0:?}")]
    PongTimeout(Duration),

    #[error("Ping failed: {0}")]
    Ping(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("Connection closed")]
    Closed,
}

impl SessionError {
    fn kind(&self) -> &'static str {
        match self {
            SessionError::ConnectTimeout(_) => "connect_timeout",
            SessionError::Protocol(_) => "protocol",
            SessionError::PongTimeout(_) => "pong_timeout",
            SessionError::Ping(_) => "ping",
            SessionError::WebSocket(_) => "websocket",
            SessionError::Closed => "closed",
        }
    }
}

/// Shared server state.
pub struct AppState {
    /// The engine.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create the state over an in-memory store loaded with the seed records.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed records are invalid.
    pub fn new(config: Config) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        config.seed.apply(&store)?;
        Ok(Self {
            hub: Hub::new(Directories::from_store(store)),
            config,
        })
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler));
    if state.config.diagnostics.enabled {
        router = router.route("/state", get(state_handler));
    }
    router.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Murmur server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );
    if config.diagnostics.enabled {
        info!("Diagnostics endpoint: http://{}/state", addr);
    }

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.registry().len(),
    }))
}

/// Diagnostic dump of connections and subscriptions.
async fn state_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, axum::Json(state.hub.dump_state()))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sink, mut stream) = socket.split();

    let connect_timeout = Duration::from_millis(state.config.transport.connect_timeout_ms);
    let connect = match timeout(connect_timeout, read_connect(&mut stream)).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::ConnectTimeout(connect_timeout)),
    };
    let (frame, encoding) = match connect {
        Ok(connect) => connect,
        Err(e) => {
            debug!(error = %e, "Connection dropped before connect");
            metrics::record_error(e.kind());
            let _ = sink.close().await;
            return;
        }
    };

    let (tx, rx) = outbound_queue(state.config.transport.outbound_capacity);
    let instance = match state.hub.connect(&frame, tx).await {
        Ok(instance) => instance,
        Err(e) => {
            metrics::record_auth_failure();
            debug!(user = %frame.username, error = %e, "Connect rejected");
            let _ = sink.close().await;
            return;
        }
    };
    metrics::record_connection();
    debug!(connection = %instance, ?encoding, "WebSocket connected");

    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        encoding,
        state.config.heartbeat.clone(),
        instance.clone(),
    ));

    let outcome = tokio::select! {
        result = read_loop(&mut stream, &state, &instance) => result,
        joined = &mut writer => joined.unwrap_or(Err(SessionError::Closed)),
    };
    match &outcome {
        Ok(()) => debug!(connection = %instance, "Client closed connection"),
        Err(e) => {
            debug!(connection = %instance, error = %e, "Connection ended");
            metrics::record_error(e.kind());
        }
    }

    // Dropping the registry's sender lets the writer send a close frame.
    state.hub.disconnect(&instance);
    if !writer.is_finished() {
        let write_wait = state.config.heartbeat.write_wait();
        if timeout(write_wait, &mut writer).await.is_err() {
            writer.abort();
        }
    }
    metrics::set_router_stats(state.hub.router().stats());

    debug!(connection = %instance, "WebSocket disconnected");
}

/// Wait for the connect frame.
async fn read_connect(
    stream: &mut SplitStream<WebSocket>,
) -> Result<(ConnectFrame, Encoding), SessionError> {
    loop {
        let (data, encoding) = match stream.next().await {
            Some(Ok(Message::Text(text))) => (text.into_bytes(), Encoding::Json),
            Some(Ok(Message::Binary(data))) => (data, Encoding::MessagePack),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(SessionError::Closed),
            Some(Err(e)) => return Err(e.into()),
        };
        metrics::record_frame(data.len(), "inbound", "connect");
        let frame: ConnectFrame = codec::decode(&data, encoding)?;
        return Ok((frame, encoding));
    }
}

/// Handle inbound frames until the session ends.
async fn read_loop(
    stream: &mut SplitStream<WebSocket>,
    state: &AppState,
    instance: &Instance,
) -> Result<(), SessionError> {
    let pong_wait = state.config.heartbeat.pong_wait();
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let message = match timeout_at(deadline, stream.next()).await {
            Err(_) => return Err(SessionError::PongTimeout(pong_wait)),
            Ok(None) => return Ok(()),
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => handle_action(state, instance, text.as_bytes(), Encoding::Json).await,
            Message::Binary(data) => handle_action(state, instance, &data, Encoding::MessagePack).await,
            Message::Pong(_) => {
                state.hub.pong(instance);
                deadline = Instant::now() + pong_wait;
                trace!(connection = %instance, "Pong");
            }
            // Pings are answered by the WebSocket layer.
            Message::Ping(_) => {}
            Message::Close(_) => return Ok(()),
        }
    }
}

/// Decode and handle one action frame, queueing its acknowledgements.
async fn handle_action(state: &AppState, instance: &Instance, data: &[u8], encoding: Encoding) {
    let start = std::time::Instant::now();
    metrics::record_frame(data.len(), "inbound", "action");

    let acks = match codec::decode::<ActionFrame>(data, encoding) {
        Ok(frame) => {
            trace!(connection = %instance, action = %frame.action, "Action frame");
            state.hub.handle_action(instance, &frame).await
        }
        Err(e) => {
            warn!(connection = %instance, error = %e, "Undecodable action frame");
            metrics::record_error("decode");
            vec![AckFrame::new("", e.to_string(), 400)]
        }
    };

    for ack in acks {
        metrics::record_ack(ack.status);
        if let Err(e) = state.hub.registry().send(instance, Outbound::Ack(ack)) {
            warn!(connection = %instance, error = %e, "Failed to queue ack");
            metrics::record_error("queue");
        }
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
    metrics::set_router_stats(state.hub.router().stats());
}

/// Drain the outbound queue and keep the connection alive.
///
/// A frame that cannot be serialized or written in time is logged and
/// skipped. A failed ping ends the session.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: OutboundReceiver,
    encoding: Encoding,
    heartbeat: HeartbeatConfig,
    instance: Instance,
) -> Result<(), SessionError> {
    let write_wait = heartbeat.write_wait();
    let ping_period = heartbeat.ping_period();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_period, ping_period);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    // Unregistered.
                    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                    return Ok(());
                };
                let kind = frame.kind();
                let message = match frame.encode(encoding) {
                    Ok(Encoded::Text(text)) => Message::Text(text),
                    Ok(Encoded::Binary(data)) => Message::Binary(data.to_vec()),
                    Err(e) => {
                        warn!(connection = %instance, kind, error = %e, "Failed to serialize frame");
                        metrics::record_error("serialize");
                        continue;
                    }
                };
                let size = match &message {
                    Message::Text(text) => text.len(),
                    Message::Binary(data) => data.len(),
                    _ => 0,
                };
                match timeout(write_wait, sink.send(message)).await {
                    Ok(Ok(())) => metrics::record_frame(size, "outbound", kind),
                    Ok(Err(e)) => {
                        warn!(connection = %instance, kind, error = %e, "Failed to write frame");
                        metrics::record_error("write");
                    }
                    Err(_) => {
                        warn!(connection = %instance, kind, "Write deadline exceeded");
                        metrics::record_error("write_timeout");
                    }
                }
            }
            _ = ping.tick() => {
                match timeout(write_wait, sink.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => trace!(connection = %instance, "Ping"),
                    Ok(Err(e)) => return Err(SessionError::Ping(e.to_string())),
                    Err(_) => return Err(SessionError::Ping("write deadline exceeded".into())),
                }
            }
        }
    }
}
