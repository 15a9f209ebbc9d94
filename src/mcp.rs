//! MCP stdio 传输：每行一个 JSON-RPC 2.0 消息。
//!
//! Requests run concurrently; responses are written by a single task so lines
//! never interleave. `notifications/cancelled` cancels the matching in-flight
//! call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::server::ToolServer;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const INVALID_REQUEST: i32 = -32600;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

/// Handle one message. Notifications yield `None`.
pub async fn process_request(
    server: &ToolServer,
    req: RpcRequest,
    cancel: CancellationToken,
) -> Option<RpcResponse> {
    if req.is_notification() {
        debug!(method = %req.method, "notification");
        return None;
    }
    let id = req.id.clone().unwrap_or(Value::Null);

    if req.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        return Some(RpcResponse::err(id, INVALID_REQUEST, "jsonrpc must be \"2.0\""));
    }

    let resp = match req.method.as_str() {
        "initialize" => RpcResponse::ok(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": server.name(),
                    "version": server.version()
                }
            }),
        ),
        "ping" => RpcResponse::ok(id, json!({})),
        "tools/list" => RpcResponse::ok(id, json!({ "tools": server.tools() })),
        "tools/call" => match serde_json::from_value::<CallParams>(req.params) {
            Ok(p) => {
                let result = server
                    .call(&p.name, p.arguments.unwrap_or_default(), cancel)
                    .await;
                match serde_json::to_value(&result) {
                    Ok(v) => RpcResponse::ok(id, v),
                    Err(e) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
                }
            }
            Err(e) => RpcResponse::err(id, INVALID_PARAMS, format!("invalid params: {e}")),
        },
        other => RpcResponse::err(id, METHOD_NOT_FOUND, format!("method not found: {other}")),
    };
    Some(resp)
}

fn id_key(id: &Value) -> String {
    id.to_string()
}

/// Serve stdin/stdout until EOF or `shutdown`.
pub async fn run_stdio(server: ToolServer, shutdown: CancellationToken) -> Result<()> {
    serve_lines(
        server,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown,
    )
    .await
}

/// Line transport over any reader/writer pair.
pub async fn serve_lines<R, W>(
    server: ToolServer,
    reader: R,
    mut writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    info!("stdio transport started");
    let (tx, mut rx) = mpsc::unbounded_channel::<RpcResponse>();
    let in_flight: Arc<Mutex<HashMap<String, CancellationToken>>> = Arc::default();

    let writer_task = tokio::spawn(async move {
        while let Some(resp) = rx.recv().await {
            let line = match serde_json::to_string(&resp) {
                Ok(l) => l,
                Err(e) => {
                    warn!(error = %e, "failed to encode response");
                    continue;
                }
            };
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let req: RpcRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                let _ = tx.send(RpcResponse::err(
                    Value::Null,
                    PARSE_ERROR,
                    format!("parse error: {e}"),
                ));
                continue;
            }
        };

        if req.method == "notifications/cancelled" {
            if let Some(id) = req.params.get("requestId") {
                if let Some(token) = in_flight.lock().remove(&id_key(id)) {
                    debug!(request_id = %id, "request cancelled by client");
                    token.cancel();
                }
            }
            continue;
        }

        let cancel = shutdown.child_token();
        let key = req.id.as_ref().map(id_key);
        if let Some(k) = &key {
            in_flight.lock().insert(k.clone(), cancel.clone());
        }

        let server = server.clone();
        let tx = tx.clone();
        let in_flight = in_flight.clone();
        tokio::spawn(async move {
            let resp = process_request(&server, req, cancel).await;
            if let Some(k) = key {
                in_flight.lock().remove(&k);
            }
            if let Some(resp) = resp {
                let _ = tx.send(resp);
            }
        });
    }

    // Pending calls still hold senders; the writer ends once they finish.
    drop(tx);
    match writer_task.await {
        Ok(r) => r?,
        Err(e) => warn!(error = %e, "stdio writer task failed"),
    }
    info!("stdio transport stopped");
    Ok(())
}
