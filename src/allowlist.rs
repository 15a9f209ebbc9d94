use globset::{GlobBuilder, GlobMatcher};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::AllowlistConfig;
use crate::error::{PolicyError, Result, VlogsError};
use crate::observability::Observability;

/// 单个 stream 匹配规则。
///
/// - exact: `app/logs`
/// - shell glob, `*` never crosses `/`: `app/*-prod`
/// - `prefix/*`: immediate children of `prefix`
/// - `prefix/**`: `prefix` itself or anything below it
#[derive(Debug, Clone)]
pub struct StreamPattern {
    raw: String,
    glob: GlobMatcher,
}

impl StreamPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| VlogsError::ConfigError(format!("invalid stream pattern {pattern}: {e}")))?
            .compile_matcher();
        Ok(Self {
            raw: pattern.to_string(),
            glob,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, stream: &str) -> bool {
        if stream == self.raw {
            return true;
        }
        if let Some(prefix) = self.raw.strip_suffix("/**") {
            if stream == prefix
                || stream
                    .strip_prefix(prefix)
                    .is_some_and(|rest| rest.starts_with('/'))
            {
                return true;
            }
        }
        self.glob.is_match(stream)
    }
}

#[derive(Debug, Default)]
struct Rules {
    allow: Vec<StreamPattern>,
    deny: Vec<StreamPattern>,
}

/// Stream allow/deny list. Deny is always evaluated first.
#[derive(Debug)]
pub struct Allowlist {
    enabled: bool,
    rules: RwLock<Rules>,
    obs: Observability,
}

impl Allowlist {
    pub fn new(config: &AllowlistConfig, obs: Observability) -> Result<Self> {
        let allow = compile_all(&config.streams)?;
        let deny = compile_all(&config.deny)?;
        Ok(Self {
            enabled: config.enabled,
            rules: RwLock::new(Rules { allow, deny }),
            obs,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(&self, stream: &str) -> std::result::Result<(), PolicyError> {
        if !self.enabled {
            return Ok(());
        }

        let rules = self.rules.read();
        if let Some(p) = rules.deny.iter().find(|p| p.matches(stream)) {
            debug!(stream, pattern = p.as_str(), "stream denied");
            self.obs.record_allowlist_block();
            return Err(PolicyError::StreamDenied);
        }

        if rules.allow.is_empty() || rules.allow.iter().any(|p| p.matches(stream)) {
            return Ok(());
        }

        debug!(stream, "stream not in allowlist");
        self.obs.record_allowlist_block();
        Err(PolicyError::StreamNotAllowed)
    }

    pub fn is_allowed(&self, stream: &str) -> bool {
        self.check(stream).is_ok()
    }

    /// Allow rules confine every call to a named stream.
    pub fn requires_stream(&self) -> bool {
        self.enabled && !self.rules.read().allow.is_empty()
    }

    /// Gate for one tool call.
    ///
    /// `stream` is the caller's scope and is sent upstream as an extra stream
    /// filter, so the allow rules are enforced on it alone. Selectors written
    /// into `query` can only narrow that scope further; they are checked
    /// against the deny rules.
    pub fn authorize(
        &self,
        stream: Option<&str>,
        query: Option<&str>,
    ) -> std::result::Result<(), PolicyError> {
        if !self.enabled {
            return Ok(());
        }

        match stream {
            Some(s) => self.check(s)?,
            None if self.requires_stream() => {
                debug!("stream required by allowlist");
                self.obs.record_allowlist_block();
                return Err(PolicyError::StreamNotAllowed);
            }
            None => {}
        }

        match query {
            Some(q) => self.check_query(q),
            None => Ok(()),
        }
    }

    fn check_query(&self, query: &str) -> std::result::Result<(), PolicyError> {
        let rules = self.rules.read();
        if rules.deny.is_empty() {
            return Ok(());
        }

        let Some(selectors) = query_selectors(query) else {
            debug!(query, "unparsable stream selector");
            self.obs.record_allowlist_block();
            return Err(PolicyError::StreamNotAllowed);
        };
        for stream in selectors.iter().flatten() {
            if let Some(p) = rules.deny.iter().find(|p| p.matches(stream)) {
                debug!(stream = %stream, pattern = p.as_str(), "query selector names a denied stream");
                self.obs.record_allowlist_block();
                return Err(PolicyError::StreamDenied);
            }
        }
        Ok(())
    }

    pub fn add_allow_pattern(&self, pattern: &str) -> Result<()> {
        let p = StreamPattern::new(pattern)?;
        self.rules.write().allow.push(p);
        Ok(())
    }

    pub fn add_deny_pattern(&self, pattern: &str) -> Result<()> {
        let p = StreamPattern::new(pattern)?;
        self.rules.write().deny.push(p);
        Ok(())
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<StreamPattern>> {
    patterns.iter().map(|p| StreamPattern::new(p)).collect()
}

/// LogsQL selector for a stream name: `app/api` is `{app="api"}`. The first
/// path segment is the label, the rest is the value, so
/// `kubernetes/prod/api` is `{kubernetes="prod/api"}`.
pub fn stream_selector(name: &str) -> Result<String> {
    let invalid = || {
        VlogsError::InvalidRequest(format!(
            "stream must look like <label>/<value>, got {name:?}"
        ))
    };
    let (label, value) = name.split_once('/').ok_or_else(invalid)?;
    if value.is_empty() || !is_label(label) {
        return Err(invalid());
    }
    let value = value.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("{{{label}=\"{value}\"}}"))
}

fn is_label(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.'))
}

/// Stream names mentioned by the `{...}` selectors of a LogsQL query, one
/// list per selector. Only `label="value"` matchers name a stream; regex and
/// negated matchers are skipped. `None` when a selector does not parse.
pub fn query_selectors(query: &str) -> Option<Vec<Vec<String>>> {
    let b = query.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            q @ (b'"' | b'\'' | b'`') => i = skip_quoted(b, i, q)?,
            b'{' if opens_selector(&query[..i]) => {
                let (names, end) = parse_selector(query, i + 1)?;
                out.push(names);
                i = end;
            }
            _ => i += 1,
        }
    }
    Some(out)
}

fn opens_selector(before: &str) -> bool {
    before.ends_with("_stream:")
        || before
            .chars()
            .last()
            .map_or(true, |c| c.is_whitespace() || matches!(c, '(' | '!' | '-'))
}

fn skip_quoted(b: &[u8], start: usize, quote: u8) -> Option<usize> {
    let mut i = start + 1;
    while i < b.len() {
        match b[i] {
            b'\\' if quote != b'`' => i += 2,
            c if c == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

fn skip_ws(b: &[u8], mut i: usize) -> usize {
    while b.get(i).is_some_and(u8::is_ascii_whitespace) {
        i += 1;
    }
    i
}

fn parse_selector(query: &str, start: usize) -> Option<(Vec<String>, usize)> {
    let b = query.as_bytes();
    let mut names = Vec::new();
    let mut i = start;
    loop {
        i = skip_ws(b, i);
        match *b.get(i)? {
            b'}' => return Some((names, i + 1)),
            b',' => {
                i += 1;
                continue;
            }
            _ => {}
        }

        let (label, next) = selector_token(query, i)?;
        i = skip_ws(b, next);
        let (op_len, exact) = match (*b.get(i)?, b.get(i + 1).copied()) {
            (b'=', Some(b'~')) | (b'!', Some(b'=')) | (b'!', Some(b'~')) => (2, false),
            (b'=', _) => (1, true),
            _ => return None,
        };
        i = skip_ws(b, i + op_len);
        let (value, next) = selector_token(query, i)?;
        i = next;
        if exact {
            names.push(format!("{label}/{value}"));
        }
    }
}

/// A bare or double-quoted label name or value.
fn selector_token(query: &str, start: usize) -> Option<(String, usize)> {
    let b = query.as_bytes();
    if b.get(start) == Some(&b'"') {
        let mut out = String::new();
        let mut chars = query[start + 1..].char_indices();
        while let Some((off, c)) = chars.next() {
            match c {
                '\\' => out.push(chars.next()?.1),
                '"' => return Some((out, start + 1 + off + 1)),
                c => out.push(c),
            }
        }
        return None;
    }
    let end = b[start..]
        .iter()
        .position(|c| c.is_ascii_whitespace() || b",{}=!~\"".contains(c))
        .map_or(b.len(), |p| start + p);
    (end > start).then(|| (query[start..end].to_string(), end))
}
