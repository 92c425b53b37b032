//! WritePad Server - Real-Time Collaborative Document Editor
//!
//! A collaboration server using:
//! - Named-event JSON protocol over axum WebSockets
//! - Per-document rooms with presence and cursor tracking
//! - Debounced last-writer-wins persistence into an embedded sled store

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

mod session;
mod store;

use session::identity::Authenticator;
use session::protocol::{self, Decoded, ServerEvent};
use session::{CollabServer, Identity, SessionConfig};
use store::{DocumentStore, SledStore, StorageConfig};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Collaboration gateway
    collab: Arc<CollabServer>,
    /// JWT validator; absent when no secret is configured, which disables
    /// the authenticated endpoint
    authenticator: Option<Authenticator>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Self {
        let authenticator = match std::env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => Some(Authenticator::from_secret(&secret)),
            _ => {
                warn!("JWT_SECRET not set - authenticated endpoint is disabled");
                None
            }
        };

        Self {
            collab: Arc::new(CollabServer::new(store, config)),
            authenticator,
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_documents: usize,
    active_connections: usize,
}

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.collab.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_documents: stats.active_documents,
        active_connections: stats.active_connections,
    })
}

// ============================================================================
// WEBSOCKET HANDLERS
// ============================================================================

#[derive(Debug, Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

/// Authenticated-principal endpoint: the JWT is validated before the
/// upgrade; a rejected connection never joins a room.
async fn ws_authenticated(
    ws: WebSocketUpgrade,
    Query(query): Query<AuthQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, StatusCode> {
    let Some(authenticator) = &state.authenticator else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    let token = query.token.ok_or(StatusCode::UNAUTHORIZED)?;
    let identity = authenticator.authenticate(&token).map_err(|e| {
        warn!("WebSocket handshake rejected: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    Ok(ws.on_upgrade(move |socket| handle_connection(socket, Some(identity), state)))
}

#[derive(Debug, Deserialize)]
struct AnonQuery {
    email: Option<String>,
}

/// Anonymous-email endpoint: the email may arrive as a handshake
/// parameter or later with the join event.
async fn ws_anonymous(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    Query(query): Query<AnonQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    debug!("Anonymous WebSocket upgrade for document: {}", document_id);

    let identity = query
        .email
        .filter(|email| !email.is_empty())
        .map(Identity::anonymous);

    ws.on_upgrade(move |socket| handle_connection(socket, identity, state))
}

/// Drive one WebSocket connection: an outbox pump and a receive loop,
/// torn down together, with deterministic cleanup on disconnect.
async fn handle_connection(socket: WebSocket, identity: Option<Identity>, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let connection_id = uuid::Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.collab.register(&connection_id, identity, tx);

    // Forward outbox events to the socket as JSON text frames.
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match protocol::encode_server(&event) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode event: {}", e);
                }
            }
        }
    });

    // Decode and dispatch inbound frames. Malformed payloads and unknown
    // event names are logged and skipped, never fatal to the connection.
    let recv_task = {
        let collab = state.collab.clone();
        let connection_id = connection_id.clone();

        tokio::spawn(async move {
            while let Some(Ok(msg)) = ws_receiver.next().await {
                match msg {
                    Message::Text(text) => match protocol::decode_client(&text) {
                        Ok(Decoded::Event(event)) => {
                            collab.dispatch(&connection_id, event).await;
                        }
                        Ok(Decoded::Unknown(name)) => {
                            debug!("Ignoring unknown event '{}' from {}", name, connection_id);
                        }
                        Err(e) => {
                            warn!("Malformed frame from {}: {}", connection_id, e);
                        }
                    },
                    Message::Close(_) => {
                        debug!("WebSocket closed by client: {}", connection_id);
                        break;
                    }
                    // Ping/pong is handled by the transport.
                    _ => {}
                }
            }
        })
    };

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.collab.disconnect(&connection_id).await;
    info!("Connection {} disconnected", connection_id);
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "writepad_server=info,tower_http=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();

    let storage_path =
        std::env::var("STORAGE_PATH").unwrap_or_else(|_| "./data/documents.sled".to_string());
    info!("Initializing storage at: {}", storage_path);

    let store: Arc<dyn DocumentStore> =
        Arc::new(SledStore::open(StorageConfig::new(&storage_path))?);

    let mut config = SessionConfig::default();
    if let Some(ms) = std::env::var("DEBOUNCE_MS").ok().and_then(|v| v.parse().ok()) {
        config = config.with_quiet_period(Duration::from_millis(ms));
    }

    let state = Arc::new(AppState::new(store, config));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_check))
        // Authenticated-principal mode: document id arrives with the join event
        .route("/ws", get(ws_authenticated))
        // Anonymous-email mode: document id in the path, email in the query
        .route("/ws/documents/:document_id", get(ws_anonymous))
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("WritePad server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket (authenticated): ws://{}/ws", addr);
    info!(
        "   WebSocket (anonymous): ws://{}/ws/documents/:document_id",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Flush pending debounced writes before the process exits.
    state.collab.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
