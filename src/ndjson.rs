//! 上游响应解析。
//!
//! Line-oriented bodies are decoded one line at a time and malformed lines
//! are skipped. Schema endpoints also accept the single-document
//! `{"values": [{"value": .., "hits": ..}]}` shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::model::{FieldInfo, HitEntry, LogEntry, StreamInfo};

const TIME_KEY: &str = "_time";
const MSG_KEY: &str = "_msg";
const STREAM_KEY: &str = "_stream";

fn objects(body: &str) -> impl Iterator<Item = Map<String, Value>> + '_ {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|l| match serde_json::from_str::<Value>(l) {
            Ok(Value::Object(m)) => Some(m),
            _ => None,
        })
}

pub fn parse_time_value(v: &Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

pub fn log_entry_from_map(mut raw: Map<String, Value>) -> LogEntry {
    let time = raw.remove(TIME_KEY).as_ref().and_then(parse_time_value);
    let message = match raw.remove(MSG_KEY) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    };
    let stream = match raw.remove(STREAM_KEY) {
        Some(Value::String(s)) => s,
        _ => String::new(),
    };
    LogEntry {
        time,
        message,
        stream,
        fields: raw,
    }
}

/// One line of a query or tail body. `None` for blank or malformed lines.
pub fn decode_log_line(line: &str) -> Option<LogEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(m)) => Some(log_entry_from_map(m)),
        _ => None,
    }
}

pub fn parse_log_entries(body: &str) -> Vec<LogEntry> {
    objects(body).map(log_entry_from_map).collect()
}

/// Whole-document `{"hits": [...]}` first, NDJSON otherwise.
pub fn parse_hits(body: &str) -> Vec<HitEntry> {
    if let Ok(Value::Object(doc)) = serde_json::from_str::<Value>(body.trim()) {
        if let Some(Value::Array(series)) = doc.get("hits") {
            return series
                .iter()
                .filter_map(Value::as_object)
                .flat_map(hits_from_series)
                .collect();
        }
    }

    objects(body)
        .map(|mut raw| {
            let count = raw.remove("hits").as_ref().and_then(as_count).unwrap_or(0);
            let timestamp = raw.remove("timestamp").as_ref().and_then(parse_time_value);
            HitEntry {
                timestamp,
                count,
                fields: raw,
            }
        })
        .collect()
}

fn hits_from_series(series: &Map<String, Value>) -> Vec<HitEntry> {
    let fields = series
        .get("fields")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let (Some(Value::Array(ts)), Some(Value::Array(values))) =
        (series.get("timestamps"), series.get("values"))
    {
        return ts
            .iter()
            .zip(values)
            .map(|(t, v)| HitEntry {
                timestamp: parse_time_value(t),
                count: as_count(v).unwrap_or(0),
                fields: fields.clone(),
            })
            .collect();
    }

    let count = ["count", "total", "hits"]
        .iter()
        .find_map(|k| series.get(*k).and_then(as_count))
        .unwrap_or(0);
    vec![HitEntry {
        timestamp: series.get("timestamp").and_then(parse_time_value),
        count,
        fields,
    }]
}

pub fn parse_streams(body: &str) -> Vec<StreamInfo> {
    if let Some(values) = values_document(body) {
        return values
            .into_iter()
            .map(|(value, _)| StreamInfo {
                stream: value,
                labels: BTreeMap::new(),
            })
            .collect();
    }

    objects(body)
        .map(|raw| {
            let stream = raw
                .get(STREAM_KEY)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let labels = raw
                .iter()
                .filter(|(k, _)| k.as_str() != STREAM_KEY)
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect();
            StreamInfo { stream, labels }
        })
        .collect()
}

/// Each `name: hits` pair on a line becomes one [`FieldInfo`].
pub fn parse_field_names(body: &str) -> Vec<FieldInfo> {
    if let Some(values) = values_document(body) {
        return values
            .into_iter()
            .map(|(name, hits)| FieldInfo { name, hits })
            .collect();
    }

    objects(body)
        .flat_map(|raw| {
            raw.into_iter()
                .map(|(name, hits)| FieldInfo {
                    name,
                    hits: as_count(&hits).unwrap_or(0),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

pub fn parse_field_values(body: &str) -> Vec<String> {
    if let Some(values) = values_document(body) {
        return values.into_iter().map(|(v, _)| v).collect();
    }

    body.lines()
        .map(|l| l.trim().trim_matches('"'))
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn values_document(body: &str) -> Option<Vec<(String, u64)>> {
    let Ok(Value::Object(doc)) = serde_json::from_str::<Value>(body.trim()) else {
        return None;
    };
    let Some(Value::Array(values)) = doc.get("values") else {
        return None;
    };
    Some(
        values
            .iter()
            .filter_map(|v| {
                let value = v.get("value")?.as_str()?.to_string();
                let hits = v.get("hits").and_then(as_count).unwrap_or(0);
                Some((value, hits))
            })
            .collect(),
    )
}

fn as_count(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// 把流式响应的字节块拼成完整的行。
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Whatever is left after the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_lines_are_skipped() {
        let body = concat!(
            r#"{"_time":"2024-05-01T10:00:00.123456789Z","_msg":"first","_stream":"{app=\"api\"}","level":"error"}"#,
            "\n",
            "not json at all\n",
            "\n",
            "[1,2,3]\n",
            r#"{"_msg":"second","_time":"garbage"}"#,
            "\n",
        );
        let entries = parse_log_entries(body);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "first");
        assert_eq!(entries[0].stream, r#"{app="api"}"#);
        assert_eq!(entries[0].fields["level"], json!("error"));
        assert!(entries[0].time.is_some());
        assert!(!entries[0].fields.contains_key("_msg"));
        assert_eq!(entries[1].message, "second");
        assert!(entries[1].time.is_none());
    }

    #[test]
    fn hits_document_and_ndjson() {
        let doc = r#"{"hits":[{"fields":{"app":"api"},"timestamps":["2024-05-01T00:00:00Z","2024-05-01T01:00:00Z"],"values":[3,5],"total":8}]}"#;
        let hits = parse_hits(doc);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].count, 3);
        assert_eq!(hits[1].count, 5);
        assert_eq!(hits[1].fields["app"], json!("api"));

        let flat = r#"{"hits":[{"timestamp":"2024-05-01T00:00:00Z","count":42}]}"#;
        assert_eq!(parse_hits(flat)[0].count, 42);

        let nd = "{\"hits\":7,\"app\":\"web\"}\nbroken\n{\"hits\":2}\n";
        let hits = parse_hits(nd);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].count, 7);
        assert_eq!(hits[0].fields["app"], json!("web"));
        assert!(!hits[0].fields.contains_key("hits"));
    }

    #[test]
    fn streams_and_fields() {
        let streams = parse_streams("{\"_stream\":\"{app=\\\"api\\\"}\",\"app\":\"api\",\"n\":1}\n");
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].labels.len(), 1);
        assert_eq!(streams[0].labels["app"], "api");

        let fields = parse_field_names("{\"_msg\":10,\"level\":4}\n{oops\n");
        assert_eq!(fields.len(), 2);
        assert!(fields.contains(&FieldInfo { name: "level".into(), hits: 4 }));

        let values = parse_field_values("\"error\"\n\ninfo\n\"warn\"\n");
        assert_eq!(values, vec!["error", "info", "warn"]);
    }

    #[test]
    fn values_documents() {
        let body = r#"{"values":[{"value":"level","hits":12},{"value":"_msg","hits":30}]}"#;
        assert_eq!(
            parse_field_names(body),
            vec![
                FieldInfo { name: "level".into(), hits: 12 },
                FieldInfo { name: "_msg".into(), hits: 30 },
            ]
        );
        assert_eq!(parse_field_values(body), vec!["level", "_msg"]);
        assert_eq!(parse_streams(body)[1].stream, "_msg");
    }

    #[test]
    fn line_buffer_reassembles_chunks() {
        let mut lb = LineBuffer::new();
        assert!(lb.push(b"{\"_msg\":\"a").is_empty());
        assert_eq!(lb.push(b"\"}\n{\"_msg\":"), vec![r#"{"_msg":"a"}"#]);
        assert_eq!(lb.push(b"\"b\"}\r\n\n"), vec!["{\"_msg\":\"b\"}\r", ""]);
        assert_eq!(lb.push(b"tail"), Vec::<String>::new());
        assert_eq!(lb.finish().as_deref(), Some("tail"));
        assert_eq!(lb.finish(), None);

        assert_eq!(decode_log_line("{\"_msg\":\"b\"}\r").unwrap().message, "b");
        assert!(decode_log_line("").is_none());
    }
}
