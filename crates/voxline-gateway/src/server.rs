//! Axum HTTP + WebSocket server.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use voxline_core::protocol::{HealthResponse, StartSessionResponse};
use voxline_core::session::{SessionConfig, new_session_id};

use crate::connection::handle_session_socket;
use crate::error::ApiError;
use crate::state::AppState;

const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/api/start-session", post(start_session_handler))
        .route("/ws/{session_id}", get(ws_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway and serve until Ctrl-C.
pub async fn start_gateway(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    serve(state, port, shutdown_signal()).await
}

/// Serve until `shutdown` resolves, then stop every live session.
pub async fn serve(
    state: Arc<AppState>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr();
    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");

    let reaper = CancellationToken::new();
    tokio::spawn(reap_pending_sessions(state.clone(), reaper.clone()));

    let result = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown)
        .await;

    reaper.cancel();
    state.runner.shutdown().await;
    info!("Gateway stopped");
    Ok(result?)
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "message": "Voxline voice gateway",
        "status": "running",
        "version": env!("CARGO_PKG_VERSION"),
        "services": ["stt", "llm", "tts"],
    }))
}

async fn start_session_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StartSessionResponse>, ApiError> {
    let config: SessionConfig = if body.iter().all(u8::is_ascii_whitespace) {
        SessionConfig::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid session config: {e}")))?
    };
    state
        .resolver
        .validate(&config)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let session_id = new_session_id();
    state.registry.register(session_id.clone(), config.clone()).await?;

    #[cfg(feature = "metrics")]
    crate::metrics::record_session_registered();

    let websocket_url = websocket_url(&state, &headers, &session_id);
    info!(session_id = %session_id, stt = %config.stt, llm = %config.llm, tts = %config.tts, "Session created");
    Ok(Json(StartSessionResponse {
        session_id,
        status: "ready".into(),
        websocket_url,
        config,
    }))
}

/// `ws(s)://` URL for a session, from the configured public URL or the request's Host.
fn websocket_url(state: &AppState, headers: &HeaderMap, session_id: &str) -> String {
    if let Some(public) = state.config.public_url() {
        let base = public.trim_end_matches('/');
        let base = base
            .strip_prefix("https://")
            .map(|rest| format!("wss://{rest}"))
            .or_else(|| base.strip_prefix("http://").map(|rest| format!("ws://{rest}")))
            .unwrap_or_else(|| base.to_string());
        return format!("{base}/ws/{session_id}");
    }
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| format!("localhost:{}", state.config.gateway_port()));
    format!("ws://{host}/ws/{session_id}")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(session) = state.registry.lookup(&session_id).await else {
        debug!(session_id = %session_id, "WebSocket for unknown session");
        return Err(ApiError::SessionNotFound(session_id));
    };
    Ok(ws.on_upgrade(move |socket| handle_session_socket(state, session, socket)))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".into(),
        active_sessions: state.registry.len().await,
    })
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.prometheus {
        Some(handle) => (axum::http::StatusCode::OK, handle.render()),
        None => (
            axum::http::StatusCode::NOT_FOUND,
            "metrics recorder not installed".to_string(),
        ),
    }
}

async fn reap_pending_sessions(state: Arc<AppState>, stop: CancellationToken) {
    let ttl = Duration::from_secs(state.config.pending_ttl_secs());
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                let reaped = state.registry.reap_pending(ttl).await;
                if reaped > 0 {
                    info!(reaped, "Removed sessions that never connected");
                }
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
