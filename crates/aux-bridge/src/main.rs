//! AUX air conditioner bridge - HTTP/WebSocket API over the serial link

use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use aux_protocol::{AuxTransport, Command, ProtocolError};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod websocket;

use config::BridgeConfig;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub transport: Arc<AuxTransport>,
}

/// API response wrapper using serde_json::Value for flexibility
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ApiResponse {
    fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: Some(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// System info response
#[derive(Serialize)]
struct SystemInfo {
    name: String,
    version: String,
}

/// A transaction already in flight is a conflict, anything else means the
/// link itself is unusable.
fn error_status(err: &ProtocolError) -> StatusCode {
    match err {
        ProtocolError::Sequence(_) => StatusCode::CONFLICT,
        ProtocolError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn queued(result: Result<(), ProtocolError>, action: &str) -> (StatusCode, Json<ApiResponse>) {
    match result {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(serde_json::json!({
                "action": action,
                "queued": true
            }))),
        ),
        Err(e) => {
            tracing::debug!("{} rejected: {}", action, e);
            (error_status(&e), Json(ApiResponse::error(e.to_string())))
        }
    }
}

/// Get system info
async fn system_info() -> impl IntoResponse {
    Json(ApiResponse::success(SystemInfo {
        name: "AUX Bridge".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Last known unit state plus link status
async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    match state.transport.snapshot().await {
        Ok(snapshot) => (StatusCode::OK, Json(ApiResponse::success(snapshot))),
        Err(e) => (error_status(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

/// Change settings on the unit
async fn send_command(
    State(state): State<AppState>,
    Json(command): Json<Command>,
) -> impl IntoResponse {
    if command.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Command sets no fields")),
        );
    }
    queued(state.transport.send_command(command).await, "command")
}

/// Ask the unit for fresh small and big status
async fn refresh_status(State(state): State<AppState>) -> impl IntoResponse {
    queued(state.transport.request_status().await, "refresh")
}

async fn power_on(State(state): State<AppState>) -> impl IntoResponse {
    queued(state.transport.set_power(true).await, "on")
}

async fn power_off(State(state): State<AppState>) -> impl IntoResponse {
    queued(state.transport.set_power(false).await, "off")
}

/// Health check
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aux_bridge=debug,aux_protocol=debug,info".into()),
        )
        .init();

    tracing::info!("Starting AUX bridge");

    let config = BridgeConfig::from_env()?;
    let transport = AuxTransport::connect(&config.serial, config.link.clone(), config.tick).await?;

    match config.link.poll_interval_ms {
        Some(ms) => tracing::info!("Polling status every {}ms", ms),
        None => tracing::info!("Periodic status polling disabled"),
    }

    let state = AppState {
        transport: Arc::new(transport),
    };

    // Build the router
    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/system/info", get(system_info))
        .route("/api/v1/state", get(get_state))
        .route("/api/v1/command", post(send_command))
        .route("/api/v1/status/refresh", post(refresh_status))
        .route("/api/v1/power/on", post(power_on))
        .route("/api/v1/power/off", post(power_off))
        // WebSocket
        .route("/ws", get(ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!("Listening on http://{}", config.bind);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
