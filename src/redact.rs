use std::borrow::Cow;

use parking_lot::RwLock;
use regex::{NoExpand, Regex};
use serde_json::Value;
use tracing::warn;

use crate::config::{RedactConfig, RedactPatternConfig};
use crate::error::{Result, VlogsError};
use crate::observability::Observability;

/// 默认遮罩规则，按顺序执行。
pub const DEFAULT_PATTERNS: &[(&str, &str, &str)] = &[
    (
        "ipv4",
        r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b",
        "[REDACTED_IP]",
    ),
    (
        "auth_header",
        r#"(?i)\b(?:authorization[:\s=]+(?:bearer|basic)?\s*|bearer\s+|token[:\s=]+)[^\s",;]+"#,
        "[REDACTED_AUTH]",
    ),
    (
        "email",
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        "[REDACTED_EMAIL]",
    ),
    ("cookie", r"(?i)\bcookie[:\s=]+[^\s;]+", "[REDACTED_COOKIE]"),
    (
        "api_key",
        r#"(?i)\b(?:api[_-]?key|apikey)[:\s=]+[^\s"]+"#,
        "[REDACTED_API_KEY]",
    ),
    (
        "password",
        r#"(?i)\b(?:password|passwd|pwd)[:\s=]+[^\s"]+"#,
        "[REDACTED_PASSWORD]",
    ),
];

#[derive(Debug, Clone)]
pub struct RedactPattern {
    pub name: String,
    pub regex: Regex,
    pub replacement: String,
}

impl RedactPattern {
    pub fn new(name: &str, pattern: &str, replacement: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| VlogsError::ConfigError(format!(
            "invalid redact pattern {name}: {e}"
        )))?;
        Ok(Self {
            name: name.to_string(),
            regex,
            replacement: replacement.to_string(),
        })
    }
}

pub fn default_patterns() -> Vec<RedactPatternConfig> {
    DEFAULT_PATTERNS
        .iter()
        .map(|(name, pattern, replacement)| RedactPatternConfig {
            name: name.to_string(),
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        })
        .collect()
}

/// Ordered regex substitution over outgoing payloads. Each pattern runs on
/// the previous pattern's output.
#[derive(Debug)]
pub struct Redactor {
    enabled: bool,
    patterns: RwLock<Vec<RedactPattern>>,
    obs: Observability,
}

impl Redactor {
    /// Invalid patterns are skipped, not fatal. An empty list means the
    /// default set.
    pub fn new(config: &RedactConfig, obs: Observability) -> Self {
        let source = if config.patterns.is_empty() {
            default_patterns()
        } else {
            config.patterns.clone()
        };

        let patterns = source
            .iter()
            .filter_map(|p| match RedactPattern::new(&p.name, &p.pattern, &p.replacement) {
                Ok(compiled) => Some(compiled),
                Err(e) => {
                    warn!(pattern = %p.name, error = %e, "skipping redact pattern");
                    None
                }
            })
            .collect();

        Self {
            enabled: config.enabled,
            patterns: RwLock::new(patterns),
            obs,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn apply(&self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }
        let patterns = self.patterns.read();
        if patterns.is_empty() {
            return text.to_string();
        }

        let mut out = text.to_string();
        let mut changed = false;
        for p in patterns.iter() {
            let next = match p.regex.replace_all(&out, NoExpand(&p.replacement)) {
                Cow::Borrowed(_) => continue,
                Cow::Owned(s) => s,
            };
            out = next;
            changed = true;
        }
        if changed {
            self.obs.record_redaction();
        }
        out
    }

    /// Redact every string inside a JSON value. Numbers, bools and null pass
    /// through untouched.
    pub fn apply_to_value(&self, value: Value) -> Value {
        if !self.enabled {
            return value;
        }
        match value {
            Value::String(s) => Value::String(self.apply(&s)),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.apply_to_value(v)))
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.apply_to_value(v)).collect())
            }
            other => other,
        }
    }

    pub fn add_pattern(&self, name: &str, pattern: &str, replacement: &str) -> Result<()> {
        let p = RedactPattern::new(name, pattern, replacement)?;
        self.patterns.write().push(p);
        Ok(())
    }

    pub fn pattern_names(&self) -> Vec<String> {
        self.patterns.read().iter().map(|p| p.name.clone()).collect()
    }
}
