//! MCP 工具定义、参数解析与处理函数。
//!
//! Arguments are parsed into a [`ToolCall`] before the request enters the
//! guard chain, so malformed input never reaches a guard or the upstream.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::allowlist::{stream_selector, Allowlist};
use crate::client::Client;
use crate::error::{Result, VlogsError};
use crate::model::{
    deserialize_opt_count, QueryParams, QueryResponse, SchemaKind, SchemaParams, StatsParams,
    ToolResult,
};
use crate::tail::{TailOptions, TailOutcome};
use crate::time::parse_time;

pub const QUERY_TOOL: &str = "vlogs-query";
pub const STATS_TOOL: &str = "vlogs-stats";
pub const SCHEMA_TOOL: &str = "vlogs-schema";
pub const TAIL_TOOL: &str = "vlogs-tail";
pub const EXPLAIN_TOOL: &str = "vlogs-explain";
pub const HEALTH_TOOL: &str = "vlogs-health";

const DEFAULT_QUERY_LIMIT: usize = 1000;
const DEFAULT_SCHEMA_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

pub fn definitions() -> Vec<ToolDefinition> {
    let stream_prop = json!({
        "type": "string",
        "description": "Stream as <label>/<value>, e.g. 'app/api' for {app=\"api\"}. Checked against the stream allowlist and applied as an extra stream filter; required when the allowlist has allow rules"
    });
    vec![
        ToolDefinition {
            name: QUERY_TOOL,
            description: "Execute a LogsQL query against VictoriaLogs and return matching log entries.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "LogsQL query string, e.g. 'error' or '_stream:{app=\"myapp\"}'"},
                    "limit": {"type": "number", "description": "Maximum number of entries to return (default 1000, capped by victorialogs.max_results)"},
                    "start": {"type": "string", "description": "Start time: RFC3339, unix seconds or relative like '5m', '1h', '24h', '7d'"},
                    "end": {"type": "string", "description": "End time: RFC3339, unix seconds or relative (default: now)"},
                    "stream": stream_prop
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: STATS_TOOL,
            description: "Get log hit counts over a time range.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Optional LogsQL filter"},
                    "start": {"type": "string", "description": "Start time: RFC3339, unix seconds or relative"},
                    "end": {"type": "string", "description": "End time (default: now)"},
                    "stream": stream_prop
                },
                "required": ["start"]
            }),
        },
        ToolDefinition {
            name: SCHEMA_TOOL,
            description: "Explore log streams, field names or the values of one field.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "type": {"type": "string", "enum": ["streams", "fields", "values"], "description": "What to list"},
                    "query": {"type": "string", "description": "Optional LogsQL filter"},
                    "field": {"type": "string", "description": "Field name, required when type is 'values'"},
                    "limit": {"type": "number", "description": "Maximum number of results (default 100)"},
                    "stream": stream_prop
                },
                "required": ["type"]
            }),
        },
        ToolDefinition {
            name: TAIL_TOOL,
            description: "Stream live log entries matching a query for a bounded time.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "LogsQL query string"},
                    "limit": {"type": "number", "description": "Maximum entries to collect (default 100, max 1000)"},
                    "timeout": {"type": "number", "description": "Seconds to wait for entries (default 5, max 30)"},
                    "stream": stream_prop
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: EXPLAIN_TOOL,
            description: "Validate a LogsQL query and explain its filters and pipes.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "LogsQL query string"},
                    "stream": stream_prop
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: HEALTH_TOOL,
            description: "Check VictoriaLogs server health.",
            input_schema: json!({"type": "object", "properties": {}}),
        },
    ]
}

#[derive(Debug, Deserialize)]
struct QueryArgs {
    query: String,
    #[serde(default, deserialize_with = "deserialize_opt_count")]
    limit: Option<u64>,
    #[serde(default)]
    start: Option<String>,
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    stream: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsArgs {
    start: String,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    end: Option<String>,
    #[serde(default)]
    stream: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SchemaArgs {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    field: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_count")]
    limit: Option<u64>,
    #[serde(default)]
    stream: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TailArgs {
    query: String,
    #[serde(default, deserialize_with = "deserialize_opt_count")]
    limit: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_opt_count")]
    timeout: Option<u64>,
    #[serde(default)]
    stream: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExplainArgs {
    query: String,
    #[serde(default)]
    stream: Option<String>,
}

/// 解析后的工具调用，可以直接执行。
#[derive(Debug, Clone)]
pub enum ToolCall {
    Query {
        params: QueryParams,
        stream: Option<String>,
    },
    Stats {
        params: StatsParams,
        stream: Option<String>,
    },
    Schema {
        params: SchemaParams,
        stream: Option<String>,
    },
    Tail {
        query: String,
        opts: TailOptions,
        stream: Option<String>,
    },
    Explain {
        query: String,
        stream_filter: Option<String>,
        stream: Option<String>,
    },
    Health,
}

fn args<T: DeserializeOwned>(tool: &str, arguments: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(arguments.clone()))
        .map_err(|e| VlogsError::InvalidRequest(format!("{tool}: {e}")))
}

fn non_empty(tool: &str, name: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(VlogsError::InvalidRequest(format!(
            "{tool}: missing required parameter: {name}"
        )));
    }
    Ok(value)
}

fn opt_time(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_time)
        .transpose()
}

fn opt_string(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// The `stream` argument and the selector it stands for.
fn stream_scope(tool: &str, stream: Option<String>) -> Result<(Option<String>, Option<String>)> {
    let Some(stream) = opt_string(stream) else {
        return Ok((None, None));
    };
    let stream = stream.trim().to_string();
    let selector = stream_selector(&stream).map_err(|e| match e {
        VlogsError::InvalidRequest(msg) => VlogsError::InvalidRequest(format!("{tool}: {msg}")),
        other => other,
    })?;
    Ok((Some(stream), Some(selector)))
}

fn check_range(start: Option<&DateTime<Utc>>, end: Option<&DateTime<Utc>>) -> Result<()> {
    match (start, end) {
        (Some(s), Some(e)) if s > e => Err(VlogsError::InvalidRequest(
            "start time must not be after end time".into(),
        )),
        _ => Ok(()),
    }
}

/// Validate arguments for `tool` and build the call.
pub fn parse_call(tool: &str, arguments: &Map<String, Value>, max_results: usize) -> Result<ToolCall> {
    match tool {
        QUERY_TOOL => {
            let a: QueryArgs = args(tool, arguments)?;
            let query = non_empty(tool, "query", a.query)?;
            let start = opt_time(a.start.as_deref())?;
            let end = opt_time(a.end.as_deref())?;
            check_range(start.as_ref(), end.as_ref())?;
            let limit = match a.limit {
                None => DEFAULT_QUERY_LIMIT.min(max_results),
                Some(n) => (n as usize).min(max_results),
            };
            let (stream, selector) = stream_scope(tool, a.stream)?;
            Ok(ToolCall::Query {
                params: QueryParams {
                    query,
                    start,
                    end,
                    limit,
                    extra_stream_filters: selector,
                },
                stream,
            })
        }
        STATS_TOOL => {
            let a: StatsArgs = args(tool, arguments)?;
            let start = non_empty(tool, "start", a.start)?;
            let start = parse_time(start.trim())?;
            let end = opt_time(a.end.as_deref())?;
            check_range(Some(&start), end.as_ref())?;
            let (stream, selector) = stream_scope(tool, a.stream)?;
            Ok(ToolCall::Stats {
                params: StatsParams {
                    query: opt_string(a.query),
                    start,
                    end,
                    step: None,
                    extra_stream_filters: selector,
                },
                stream,
            })
        }
        SCHEMA_TOOL => {
            let a: SchemaArgs = args(tool, arguments)?;
            let kind: SchemaKind = a.kind.trim().parse()?;
            let field = opt_string(a.field);
            if kind == SchemaKind::Values && field.is_none() {
                return Err(VlogsError::InvalidRequest(format!(
                    "{tool}: field is required when type is 'values'"
                )));
            }
            let (stream, selector) = stream_scope(tool, a.stream)?;
            Ok(ToolCall::Schema {
                params: SchemaParams {
                    kind,
                    query: opt_string(a.query),
                    field,
                    limit: Some(a.limit.map_or(DEFAULT_SCHEMA_LIMIT, |n| n as usize)),
                    extra_stream_filters: selector,
                },
                stream,
            })
        }
        TAIL_TOOL => {
            let a: TailArgs = args(tool, arguments)?;
            let query = non_empty(tool, "query", a.query)?;
            let (stream, selector) = stream_scope(tool, a.stream)?;
            Ok(ToolCall::Tail {
                query,
                opts: TailOptions::new(a.limit, a.timeout).with_stream_filter(selector),
                stream,
            })
        }
        EXPLAIN_TOOL => {
            let a: ExplainArgs = args(tool, arguments)?;
            let query = non_empty(tool, "query", a.query)?;
            let (stream, stream_filter) = stream_scope(tool, a.stream)?;
            Ok(ToolCall::Explain {
                query,
                stream_filter,
                stream,
            })
        }
        HEALTH_TOOL => Ok(ToolCall::Health),
        other => Err(VlogsError::InvalidRequest(format!("unknown tool: {other}"))),
    }
}

/// What a tool handler needs at run time.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub client: Arc<Client>,
    pub allowlist: Arc<Allowlist>,
}

impl ToolCall {
    pub fn stream(&self) -> Option<&str> {
        match self {
            ToolCall::Query { stream, .. }
            | ToolCall::Stats { stream, .. }
            | ToolCall::Schema { stream, .. }
            | ToolCall::Tail { stream, .. }
            | ToolCall::Explain { stream, .. } => stream.as_deref(),
            ToolCall::Health => None,
        }
    }

    /// LogsQL text sent upstream, if any.
    pub fn query_text(&self) -> Option<&str> {
        match self {
            ToolCall::Query { params, .. } => Some(params.query.as_str()),
            ToolCall::Stats { params, .. } => params.query.as_deref(),
            ToolCall::Schema { params, .. } => params.query.as_deref(),
            ToolCall::Tail { query, .. } | ToolCall::Explain { query, .. } => Some(query.as_str()),
            ToolCall::Health => None,
        }
    }

    /// Run the call. Expected failures come back as error results; only
    /// internal failures are `Err`.
    pub async fn execute(&self, ctx: &ToolContext, cancel: &CancellationToken) -> Result<ToolResult> {
        if !matches!(self, ToolCall::Health) {
            if let Err(e) = ctx.allowlist.authorize(self.stream(), self.query_text()) {
                return Ok(ToolResult::policy(e));
            }
        }

        let client = &ctx.client;
        let result = match self {
            ToolCall::Query { params, .. } => client
                .query(params, cancel)
                .await
                .map(|r| ToolResult::text(format_query_result(&r))),
            ToolCall::Stats { params, .. } => match client.stats(params, cancel).await {
                Ok(r) => Ok(ToolResult::json(serde_json::to_value(r)?)),
                Err(e) => Err(e),
            },
            ToolCall::Schema { params, .. } => match client.schema(params, cancel).await {
                Ok(r) => Ok(ToolResult::json(serde_json::to_value(r)?)),
                Err(e) => Err(e),
            },
            ToolCall::Tail { query, opts, .. } => {
                match client.tail_collect(query, opts, cancel).await {
                    Ok(report) if report.outcome == TailOutcome::Cancelled => {
                        Err(VlogsError::Cancelled)
                    }
                    Ok(report) => Ok(ToolResult::json(json!({
                        "count": report.entries.len(),
                        "outcome": report.outcome,
                        "entries": report.entries,
                    }))),
                    Err(e) => Err(e),
                }
            }
            ToolCall::Explain {
                query,
                stream_filter,
                ..
            } => match client.explain(query, stream_filter.as_deref(), cancel).await {
                Ok(r) => Ok(ToolResult::json(serde_json::to_value(r)?)),
                Err(e) => Err(e),
            },
            ToolCall::Health => match client.health(cancel).await {
                Ok(r) => Ok(ToolResult::json(serde_json::to_value(r)?)),
                Err(e) => Err(e),
            },
        };

        Ok(result.unwrap_or_else(|e| ToolResult::from_error(&e)))
    }
}

pub fn format_query_result(result: &QueryResponse) -> String {
    let mut out = format!("Found {} log entries", result.total);
    if result.truncated {
        out.push_str(" (results truncated)");
    }
    out.push_str("\n\n");

    for (i, entry) in result.entries.iter().enumerate() {
        let time = entry
            .time
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(out, "--- [{}] {} ---", i + 1, time);
        if !entry.stream.is_empty() {
            let _ = writeln!(out, "Stream: {}", entry.stream);
        }
        let _ = writeln!(out, "Message: {}", entry.message);
        if !entry.fields.is_empty() {
            out.push_str("Fields:\n");
            for (k, v) in &entry.fields {
                match v {
                    Value::String(s) => {
                        let _ = writeln!(out, "  {k}: {s}");
                    }
                    other => {
                        let _ = writeln!(out, "  {k}: {other}");
                    }
                }
            }
        }
        out.push('\n');
    }
    out
}
