use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::AuditConfig;
use crate::error::VlogsError;
use crate::model::ToolResult;

const QUERY_PREVIEW_CHARS: usize = 50;
const ERROR_SUMMARY_CHARS: usize = 200;

/// 每次调用生成一条，写入日志后即丢弃，不做持久化。
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub params_summary: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct AuditRecorder {
    enabled: bool,
}

impl AuditRecorder {
    pub fn new(config: &AuditConfig) -> Self {
        Self {
            enabled: config.enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn entry(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        outcome: &Result<ToolResult, VlogsError>,
    ) -> AuditEntry {
        let (success, error) = match outcome {
            Ok(r) if r.is_success() => (true, None),
            Ok(r) => (
                false,
                Some(truncate(
                    &r.first_text().unwrap_or_else(|| "tool returned error".into()),
                    ERROR_SUMMARY_CHARS,
                )),
            ),
            Err(e) => (false, Some(truncate(&e.to_string(), ERROR_SUMMARY_CHARS))),
        };

        AuditEntry {
            timestamp: started_at,
            tool_name: tool_name.to_string(),
            duration_ms: elapsed.as_millis() as u64,
            success,
            error,
            params_summary: summarize_params(arguments),
        }
    }

    pub fn record(&self, entry: &AuditEntry) {
        if !self.enabled {
            return;
        }
        if entry.success {
            info!(
                tool = %entry.tool_name,
                duration_ms = entry.duration_ms,
                success = true,
                params = ?entry.params_summary,
                "tool call"
            );
        } else {
            warn!(
                tool = %entry.tool_name,
                duration_ms = entry.duration_ms,
                success = false,
                error = entry.error.as_deref().unwrap_or_default(),
                params = ?entry.params_summary,
                "tool call failed"
            );
        }
    }
}

/// Only these keys are summarized; everything else is left out of the log.
pub fn summarize_params(arguments: &Map<String, Value>) -> BTreeMap<String, String> {
    let mut summary = BTreeMap::new();

    if let Some(q) = arguments.get("query").and_then(Value::as_str) {
        summary.insert("query_preview".to_string(), truncate(q, QUERY_PREVIEW_CHARS));
    }
    for key in ["start", "end", "type", "stream"] {
        if let Some(v) = arguments.get(key).and_then(Value::as_str) {
            summary.insert(key.to_string(), v.to_string());
        }
    }
    if let Some(n) = arguments.get("limit").and_then(Value::as_f64) {
        summary.insert("limit".to_string(), (n as i64).to_string());
    }

    summary
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
