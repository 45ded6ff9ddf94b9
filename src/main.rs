//! UpDown - continuously repeating timed betting game backend
//!
//! One engine task drives the round lifecycle; axum serves the snapshot
//! endpoint and the WebSocket fan-out of engine events.

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use updown_backend::{
    api,
    engine::{EngineConfig, RoundLifecycleEngine},
    models::{Config, WsServerEvent},
    storage::GameDb,
    AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("load configuration")?;
    info!("🎲 UpDown backend starting");

    let db = Arc::new(GameDb::new(&config.database_path).context("open game database")?);
    info!("📊 Database initialized at: {}", config.database_path);

    let handle = RoundLifecycleEngine::spawn(db, EngineConfig::from_config(&config));

    let app_state = AppState { engine: handle };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/game-state", get(api::get_game_state))
        .route("/ws", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "updown_backend=debug,updown=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// WebSocket handler for real-time game state streaming
async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.engine.subscribe();

    // Push the committed snapshot on connect so the client is never empty
    // while waiting for the next tick.
    if let Some(snapshot) = state.engine.state() {
        let msg = serde_json::to_string(&WsServerEvent::GameState(snapshot))
            .unwrap_or_else(|_| "{}".to_string());
        if socket.send(Message::Text(msg)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            // Forward engine events to the client
            Ok(event) = rx.recv() => {
                let msg = serde_json::to_string(&event)
                    .unwrap_or_else(|e| {
                        warn!("Failed to serialize ws event: {}", e);
                        "{}".to_string()
                    });
                if socket.send(Message::Text(msg)).await.is_err() {
                    break;
                }
            }
            // Handle incoming messages from client
            Some(Ok(msg)) = socket.recv() => {
                match msg {
                    Message::Text(text) => {
                        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                            match json.get("type").and_then(|t| t.as_str()) {
                                Some("getGameState") => {
                                    if let Some(snapshot) = state.engine.state() {
                                        let msg = serde_json::to_string(
                                            &WsServerEvent::GameState(snapshot),
                                        )
                                        .unwrap_or_else(|_| "{}".to_string());
                                        let _ = socket.send(Message::Text(msg)).await;
                                    }
                                }
                                Some("ping") => {
                                    // Echo back pong with the same timestamp for latency calculation
                                    let timestamp = json.get("data")
                                        .and_then(|d| d.get("timestamp"))
                                        .and_then(|t| t.as_i64())
                                        .unwrap_or(0);
                                    let pong = serde_json::json!({
                                        "type": "pong",
                                        "data": { "timestamp": timestamp }
                                    });
                                    let _ = socket.send(Message::Text(pong.to_string())).await;
                                }
                                _ => {}
                            }
                        } else if text == "ping" {
                            let _ = socket.send(Message::Text("pong".to_string())).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "🎲 UpDown Operational"
}
