use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Query, State,
    },
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, VlogsError};
use crate::mcp::{process_request, RpcRequest};
use crate::server::ToolServer;

type Sessions = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Event>>>>;

#[derive(Clone)]
pub struct AppState {
    pub server: ToolServer,
    sessions: Sessions,
    next_session: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ToolCallBody {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Tool failures are still 200; only a malformed body is 400.
async fn call_tool_handler(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ToolCallBody>, JsonRejection>,
) -> impl IntoResponse {
    let body = match payload {
        Ok(Json(body)) => body,
        Err(e) => {
            return ErrorResponse {
                error: format!("invalid request body: {e}"),
            }
            .into_response()
        }
    };
    let result = state
        .server
        .call(&body.name, body.arguments, state.shutdown.child_token())
        .await;
    (StatusCode::OK, Json(result)).into_response()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "name": state.server.name(),
        "version": state.server.version(),
        "pipeline": state.server.pipeline().status(),
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "metrics": state.server.observability().snapshot(),
        "circuit_breaker": state.server.pipeline().circuit_breaker.metrics(),
        "sse_sessions": state.sessions.read().len(),
    }))
}

async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let session_id = format!(
        "{:x}-{}",
        chrono::Utc::now().timestamp_millis(),
        state.next_session.fetch_add(1, Ordering::Relaxed)
    );

    let endpoint_url = format!("/message?session_id={session_id}");
    let _ = tx.send(Event::default().event("endpoint").data(endpoint_url));
    state.sessions.write().insert(session_id.clone(), tx);
    debug!(session = %session_id, "sse session opened");

    let shutdown = state.shutdown.clone();
    let stream = UnboundedReceiverStream::new(rx)
        .map(Ok::<_, axum::Error>)
        .take_until(async move { shutdown.cancelled().await });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct MessageQuery {
    session_id: String,
}

async fn message_handler(
    State(state): State<AppState>,
    q: std::result::Result<Query<MessageQuery>, QueryRejection>,
    payload: std::result::Result<Json<RpcRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(Query(q)) = q else {
        return ErrorResponse {
            error: "missing session_id".into(),
        }
        .into_response();
    };
    let req = match payload {
        Ok(Json(req)) => req,
        Err(e) => {
            return ErrorResponse {
                error: format!("invalid message: {e}"),
            }
            .into_response()
        }
    };

    let sender = state.sessions.read().get(&q.session_id).cloned();
    let Some(sender) = sender else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if sender.is_closed() {
        state.sessions.write().remove(&q.session_id);
        debug!(session = %q.session_id, "sse session closed");
        return StatusCode::NOT_FOUND.into_response();
    }

    let server = state.server.clone();
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        if let Some(resp) = process_request(&server, req, cancel).await {
            if let Ok(json_str) = serde_json::to_string(&resp) {
                let _ = sender.send(Event::default().event("message").data(json_str));
            }
        }
    });
    StatusCode::ACCEPTED.into_response()
}

pub fn build_router(server: ToolServer, shutdown: CancellationToken) -> Router {
    let state = AppState {
        server,
        sessions: Arc::default(),
        next_session: Arc::default(),
        shutdown,
    };
    Router::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/tools/call", post(call_tool_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve_http(server: ToolServer, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
    let router = build_router(server, shutdown.clone());
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| VlogsError::ConfigError(format!("bind {addr} failed: {e}")))?;
    info!(%addr, "http transport listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("http transport stopped");
    Ok(())
}
