use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{PolicyError, VlogsError};

/// 单条日志。`_time`/`_msg`/`_stream` 之外的字段平铺在 `fields` 中。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(rename = "_time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(rename = "_msg", default)]
    pub message: String,
    #[serde(rename = "_stream", default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub entries: Vec<LogEntry>,
    pub total: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HitEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub count: u64,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub hits: Vec<HitEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    #[serde(rename = "_stream")]
    pub stream: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamsResponse {
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldInfo {
    pub name: String,
    pub hits: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldsResponse {
    pub fields: Vec<FieldInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldValuesResponse {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SchemaResponse {
    Streams(StreamsResponse),
    Fields(FieldsResponse),
    Values(FieldValuesResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// 静态的 LogsQL 分析结果，`valid` 表示上游接受了该查询。
#[derive(Debug, Clone, Serialize)]
pub struct ExplainResponse {
    pub query: String,
    pub valid: bool,
    pub filters: Vec<String>,
    pub pipes: Vec<String>,
    pub has_stream_filter: bool,
    pub has_time_filter: bool,
    pub has_stats: bool,
    pub warnings: Vec<String>,
    pub tips: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub query: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// 0 means "use the client's cap".
    pub limit: usize,
    pub extra_stream_filters: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatsParams {
    pub query: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub step: Option<String>,
    pub extra_stream_filters: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaKind {
    Streams,
    Fields,
    Values,
}

impl FromStr for SchemaKind {
    type Err = VlogsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "streams" => Ok(SchemaKind::Streams),
            "fields" => Ok(SchemaKind::Fields),
            "values" => Ok(SchemaKind::Values),
            other => Err(VlogsError::InvalidRequest(format!(
                "unsupported schema type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaParams {
    pub kind: SchemaKind,
    pub query: Option<String>,
    pub field: Option<String>,
    pub limit: Option<usize>,
    pub extra_stream_filters: Option<String>,
}

/// 一次工具调用。`cancel` 由传输层持有，取消后正在进行的上游请求会尽快返回。
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub cancel: CancellationToken,
}

impl ToolRequest {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected by a guard; the upstream was never called.
    Policy,
    InvalidInput,
    Upstream,
    Cancelled,
    Internal,
}

impl FailureKind {
    /// Outcomes the circuit breaker counts against the upstream. A caller's
    /// own cancellation says nothing about upstream health.
    pub fn counts_as_failure(self) -> bool {
        matches!(self, FailureKind::Upstream | FailureKind::Internal)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Json(Value),
}

impl Serialize for Content {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let text = match self {
            Content::Text(t) => t.clone(),
            Content::Json(v) => serde_json::to_string_pretty(v)
                .map_err(<S::Error as serde::ser::Error>::custom)?,
        };
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", "text")?;
        map.serialize_entry("text", &text)?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub content: Vec<Content>,
    #[serde(rename = "isError")]
    pub is_error: bool,
    #[serde(skip)]
    pub kind: Option<FailureKind>,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text(text.into())],
            is_error: false,
            kind: None,
        }
    }

    pub fn json(value: Value) -> Self {
        Self {
            content: vec![Content::Json(value)],
            is_error: false,
            kind: None,
        }
    }

    pub fn error(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::Text(message.into())],
            is_error: true,
            kind: Some(kind),
        }
    }

    pub fn policy(err: PolicyError) -> Self {
        Self::error(FailureKind::Policy, err.to_string())
    }

    pub fn from_error(err: &VlogsError) -> Self {
        let kind = match err {
            VlogsError::Policy(_) => FailureKind::Policy,
            VlogsError::InvalidRequest(_) | VlogsError::TimeParseError { .. } => {
                FailureKind::InvalidInput
            }
            VlogsError::ApiError { .. } | VlogsError::DecodeError(_) => FailureKind::Upstream,
            VlogsError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Internal,
        };
        Self::error(kind, err.to_string())
    }

    pub fn is_success(&self) -> bool {
        !self.is_error
    }

    /// First text block, or the compact JSON of the first JSON block.
    pub fn first_text(&self) -> Option<String> {
        self.content.first().map(|c| match c {
            Content::Text(t) => t.clone(),
            Content::Json(v) => v.to_string(),
        })
    }
}

impl fmt::Display for ToolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.content.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match c {
                Content::Text(t) => write!(f, "{t}")?,
                Content::Json(v) => write!(f, "{v}")?,
            }
        }
        Ok(())
    }
}

/// 兼容整数、浮点数和数字字符串，例如 `10`、`10.0`、`"10"`。
pub fn deserialize_opt_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                Ok(Some(u))
            } else if let Some(f) = n.as_f64().filter(|f| *f >= 0.0 && f.is_finite()) {
                Ok(Some(f as u64))
            } else {
                Err(de::Error::custom(format!("expected a non-negative number, got {n}")))
            }
        }
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a number, got '{s}'"))),
        Some(other) => Err(de::Error::custom(format!("expected a number, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_wire_shape() {
        let ok = ToolResult::json(json!({"status": "healthy"}));
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["isError"], false);
        assert_eq!(v["content"][0]["type"], "text");
        assert!(v["content"][0]["text"].as_str().unwrap().contains("healthy"));
        assert!(v.get("kind").is_none());

        let denied = ToolResult::policy(PolicyError::StreamDenied);
        assert_eq!(denied.kind, Some(FailureKind::Policy));
        assert_eq!(denied.first_text().as_deref(), Some("stream access denied"));
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            ToolResult::from_error(&VlogsError::api(502, "bad gateway")).kind,
            Some(FailureKind::Upstream)
        );
        assert_eq!(
            ToolResult::from_error(&VlogsError::InvalidRequest("x".into())).kind,
            Some(FailureKind::InvalidInput)
        );
        assert_eq!(
            ToolResult::from_error(&VlogsError::Cancelled).kind,
            Some(FailureKind::Cancelled)
        );
        assert!(!FailureKind::Policy.counts_as_failure());
        assert!(!FailureKind::InvalidInput.counts_as_failure());
        assert!(FailureKind::Upstream.counts_as_failure());
        assert!(FailureKind::Internal.counts_as_failure());
        assert!(!FailureKind::Cancelled.counts_as_failure());
    }

    #[test]
    fn log_entry_flattens_fields() {
        let mut fields = Map::new();
        fields.insert("level".into(), json!("error"));
        let entry = LogEntry {
            time: None,
            message: "boom".into(),
            stream: String::new(),
            fields,
        };
        let v = serde_json::to_value(&entry).unwrap();
        assert_eq!(v, json!({"_msg": "boom", "level": "error"}));
    }

    #[derive(Deserialize)]
    struct Counted {
        #[serde(default, deserialize_with = "deserialize_opt_count")]
        limit: Option<u64>,
    }

    #[test]
    fn counts_accept_loose_numbers() {
        let parse = |v: Value| serde_json::from_value::<Counted>(v).map(|c| c.limit);
        assert_eq!(parse(json!({"limit": 10})).unwrap(), Some(10));
        assert_eq!(parse(json!({"limit": 10.0})).unwrap(), Some(10));
        assert_eq!(parse(json!({"limit": "25"})).unwrap(), Some(25));
        assert_eq!(parse(json!({})).unwrap(), None);
        assert!(parse(json!({"limit": -1})).is_err());
        assert!(parse(json!({"limit": true})).is_err());
    }
}
