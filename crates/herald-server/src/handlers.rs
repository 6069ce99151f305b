//! Connection handlers for Herald server.
//!
//! This module handles the connection lifecycle and frame processing. Each
//! WebSocket gets an outbound queue registered with the [`RoomRegistry`];
//! everything the engine and relay deliver to the connection flows through
//! it, while inbound frames are handed to the [`ChannelEngine`].

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::session::Session;
use crate::subscriber::RedisSubscriber;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use herald_core::{
    AppServer, BroadcastRelay, ChannelEngine, ConnectionId, ConnectionInfo, HttpAppServer,
    RoomRegistry,
};
use herald_protocol::{codec, ClientFrame, Encoding, ProtocolError, ServerFrame};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Connections and room membership.
    pub registry: Arc<RoomRegistry>,
    /// The channel protocol engine.
    pub engine: Arc<ChannelEngine>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the application server client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let app = HttpAppServer::new(config.app_server())
            .context("Failed to build application server client")?;
        Ok(Self::with_app_server(config, Arc::new(app)))
    }

    /// Create app state talking to the given application server.
    #[must_use]
    pub fn with_app_server(config: Config, app: Arc<dyn AppServer>) -> Self {
        let registry = Arc::new(RoomRegistry::new());
        let engine = ChannelEngine::new(registry.clone(), app, config.engine());

        Self {
            registry,
            engine: Arc::new(engine),
            config,
        }
    }

    /// Relay fed by the pub/sub subscriber.
    #[must_use]
    pub fn relay(&self) -> BroadcastRelay {
        BroadcastRelay::new(self.registry.clone(), self.config.redis.key_prefix.clone())
    }
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

    let subscriber = RedisSubscriber::new(config.redis.clone(), Arc::new(state.relay()));
    tokio::spawn(subscriber.run());

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Herald server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "channels": stats.room_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let connection = connection_info(ConnectionId::generate(), &headers);
    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, connection, state))
}

/// Describe a connection by the request headers it was opened with.
fn connection_info(id: ConnectionId, headers: &HeaderMap) -> ConnectionInfo {
    let mut info = ConnectionInfo::new(id);
    if let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        info = info.with_host(host);
    }
    if let Some(cookie) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        info = info.with_cookie(cookie);
    }
    info
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, connection: ConnectionInfo, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();
    let id = connection.id.clone();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Arc<ServerFrame>>();
    if !state.registry.connect(id.clone(), outbound_tx) {
        error!(connection = %id, "Connection id already registered");
        return;
    }

    debug!(connection = %id, "WebSocket connected");
    state.engine.connect(&connection);

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();
    let mut encoding = Encoding::Json;
    let mut session = Session::new(connection.clone(), Arc::clone(&state));

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            // Frames queued by the engine and relay
            Some(frame) = outbound_rx.recv() => {
                match outbound_message(&frame, encoding) {
                    Ok(message) => {
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %id, event = %frame.event, error = %e, "Failed to encode frame");
                        metrics::record_error("encode");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => decode_inbound(text.as_bytes(), Encoding::Json),
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        decode_inbound(&data, Encoding::MessagePack)
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %id, "WebSocket stream ended");
                        break;
                    }
                };

                match frame {
                    Ok(frame) => session.handle_frame(frame),
                    Err(e) => {
                        warn!(connection = %id, error = %e, "Ignoring undecodable frame");
                        metrics::record_error("decode");
                    }
                }
            }
        }
    }

    state.engine.disconnect(&connection, "closed").await;
    debug!(connection = %id, "WebSocket disconnected");
}

fn decode_inbound(data: &[u8], encoding: Encoding) -> Result<ClientFrame, ProtocolError> {
    codec::decode(data, encoding)
}

/// Encode a frame as a WebSocket message in the connection's encoding.
fn outbound_message(frame: &ServerFrame, encoding: Encoding) -> Result<Message, ProtocolError> {
    let data = codec::encode(frame, encoding)?;
    match encoding {
        Encoding::Json => String::from_utf8(data.to_vec())
            .map(Message::Text)
            .map_err(|e| ProtocolError::Invalid(e.to_string())),
        Encoding::MessagePack => Ok(Message::Binary(data.to_vec())),
    }
}
