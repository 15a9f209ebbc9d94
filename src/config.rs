use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allowlist::StreamPattern;
use crate::error::{Result, VlogsError};
use crate::redact::RedactPattern;
use crate::time::parse_duration;

/// 环境变量覆盖前缀，例如 `VLMCP_VICTORIALOGS_URL`。
pub const ENV_PREFIX: &str = "VLMCP_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    Stdio,
    Http,
    Both,
}

impl FromStr for ServerMode {
    type Err = VlogsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" => Ok(ServerMode::Stdio),
            "http" => Ok(ServerMode::Http),
            "both" => Ok(ServerMode::Both),
            other => Err(VlogsError::ConfigError(format!(
                "server.transport must be 'stdio', 'http' or 'both', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub transport: ServerMode,
    pub http_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "victorialogs-mcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            transport: ServerMode::Stdio,
            http_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Basic,
    Bearer,
}

impl FromStr for AuthType {
    type Err = VlogsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(AuthType::None),
            "basic" => Ok(AuthType::Basic),
            "bearer" => Ok(AuthType::Bearer),
            other => Err(VlogsError::ConfigError(format!(
                "victorialogs.auth.type must be 'none', 'basic' or 'bearer', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: AuthType,
    pub username: String,
    pub password: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VictoriaLogsConfig {
    pub url: String,
    pub auth: AuthConfig,
    /// Per-request timeout, e.g. `30s`.
    pub timeout: String,
    pub max_results: usize,
}

impl Default for VictoriaLogsConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9428".to_string(),
            auth: AuthConfig::default(),
            timeout: "30s".to_string(),
            max_results: 5000,
        }
    }
}

impl VictoriaLogsConfig {
    pub fn timeout(&self) -> Result<Duration> {
        parse_duration(&self.timeout)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllowlistConfig {
    pub enabled: bool,
    pub streams: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub error_threshold: u32,
    pub timeout: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold: 5,
            timeout: "30s".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactPatternConfig {
    pub name: String,
    pub pattern: String,
    pub replacement: String,
}

/// 空的 `patterns` 表示使用内置的默认规则。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactConfig {
    pub enabled: bool,
    pub patterns: Vec<RedactPatternConfig>,
}

impl Default for RedactConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub rate_limit: RateLimitConfig,
    pub allowlist: AllowlistConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub redact: RedactConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    #[serde(alias = "plain")]
    Text,
}

impl FromStr for LogFormat {
    type Err = VlogsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "plain" => Ok(LogFormat::Text),
            other => Err(VlogsError::ConfigError(format!(
                "logging.format must be 'json' or 'text', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub victorialogs: VictoriaLogsConfig,
    pub policy: PolicyConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// 读取配置文件（yaml/yml/json），叠加环境变量，然后校验。
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VlogsError::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let mut cfg: Config = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&raw)
                .map_err(|e| VlogsError::ConfigError(format!("invalid yaml: {e}")))?,
            "json" => serde_json::from_str(&raw)
                .map_err(|e| VlogsError::ConfigError(format!("invalid json: {e}")))?,
            other => {
                return Err(VlogsError::ConfigError(format!(
                    "unsupported config extension '{other}', expected yaml, yml or json"
                )))
            }
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults plus environment, for running without a config file.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// `lookup` receives the key without the `VLMCP_` prefix.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SERVER_NAME") {
            self.server.name = v;
        }
        if let Some(v) = get("SERVER_TRANSPORT") {
            self.server.transport = v.parse()?;
        }
        if let Some(v) = get("SERVER_HTTP_ADDR") {
            self.server.http_addr = v;
        }

        if let Some(v) = get("VICTORIALOGS_URL") {
            self.victorialogs.url = v;
        }
        if let Some(v) = get("VICTORIALOGS_TIMEOUT") {
            self.victorialogs.timeout = v;
        }
        if let Some(v) = get("VICTORIALOGS_MAX_RESULTS") {
            self.victorialogs.max_results = parse_number("VICTORIALOGS_MAX_RESULTS", &v)?;
        }
        if let Some(v) = get("VICTORIALOGS_AUTH_TYPE") {
            self.victorialogs.auth.kind = v.parse()?;
        }
        if let Some(v) = get("VICTORIALOGS_AUTH_USERNAME") {
            self.victorialogs.auth.username = v;
        }
        if let Some(v) = get("VICTORIALOGS_AUTH_PASSWORD") {
            self.victorialogs.auth.password = v;
        }
        if let Some(v) = get("VICTORIALOGS_AUTH_TOKEN") {
            self.victorialogs.auth.token = v;
        }

        let policy = &mut self.policy;
        if let Some(v) = get("POLICY_RATE_LIMIT_ENABLED") {
            policy.rate_limit.enabled = parse_bool("POLICY_RATE_LIMIT_ENABLED", &v)?;
        }
        if let Some(v) = get("POLICY_RATE_LIMIT_REQUESTS_PER_MINUTE") {
            policy.rate_limit.requests_per_minute =
                parse_number("POLICY_RATE_LIMIT_REQUESTS_PER_MINUTE", &v)?;
        }
        if let Some(v) = get("POLICY_ALLOWLIST_ENABLED") {
            policy.allowlist.enabled = parse_bool("POLICY_ALLOWLIST_ENABLED", &v)?;
        }
        if let Some(v) = get("POLICY_ALLOWLIST_STREAMS") {
            policy.allowlist.streams = split_list(&v);
        }
        if let Some(v) = get("POLICY_ALLOWLIST_DENY") {
            policy.allowlist.deny = split_list(&v);
        }
        if let Some(v) = get("POLICY_CIRCUIT_BREAKER_ENABLED") {
            policy.circuit_breaker.enabled = parse_bool("POLICY_CIRCUIT_BREAKER_ENABLED", &v)?;
        }
        if let Some(v) = get("POLICY_CIRCUIT_BREAKER_ERROR_THRESHOLD") {
            policy.circuit_breaker.error_threshold =
                parse_number("POLICY_CIRCUIT_BREAKER_ERROR_THRESHOLD", &v)?;
        }
        if let Some(v) = get("POLICY_CIRCUIT_BREAKER_TIMEOUT") {
            policy.circuit_breaker.timeout = v;
        }
        if let Some(v) = get("POLICY_REDACT_ENABLED") {
            policy.redact.enabled = parse_bool("POLICY_REDACT_ENABLED", &v)?;
        }
        if let Some(v) = get("POLICY_AUDIT_ENABLED") {
            policy.audit.enabled = parse_bool("POLICY_AUDIT_ENABLED", &v)?;
        }

        if let Some(v) = get("LOGGING_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOGGING_FORMAT") {
            self.logging.format = v.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.name.trim().is_empty() {
            return Err(VlogsError::ConfigError("server.name is required".into()));
        }
        if matches!(self.server.transport, ServerMode::Http | ServerMode::Both) {
            self.http_addr()?;
        }

        let vl = &self.victorialogs;
        if vl.url.trim().is_empty() {
            return Err(VlogsError::ConfigError("victorialogs.url is required".into()));
        }
        if !(vl.url.starts_with("http://") || vl.url.starts_with("https://")) {
            return Err(VlogsError::ConfigError(format!(
                "victorialogs.url must start with http:// or https://, got '{}'",
                vl.url
            )));
        }
        vl.timeout()?;
        if vl.max_results == 0 {
            return Err(VlogsError::ConfigError(
                "victorialogs.max_results must be greater than 0".into(),
            ));
        }
        match vl.auth.kind {
            AuthType::Bearer if vl.auth.token.is_empty() => {
                return Err(VlogsError::ConfigError(
                    "victorialogs.auth.token is required for bearer auth".into(),
                ))
            }
            AuthType::Basic if vl.auth.username.is_empty() => {
                return Err(VlogsError::ConfigError(
                    "victorialogs.auth.username is required for basic auth".into(),
                ))
            }
            _ => {}
        }

        let policy = &self.policy;
        if policy.rate_limit.enabled && policy.rate_limit.requests_per_minute == 0 {
            return Err(VlogsError::ConfigError(
                "policy.rate_limit.requests_per_minute must be greater than 0".into(),
            ));
        }
        if policy.circuit_breaker.enabled && policy.circuit_breaker.error_threshold == 0 {
            return Err(VlogsError::ConfigError(
                "policy.circuit_breaker.error_threshold must be greater than 0".into(),
            ));
        }
        if !policy.circuit_breaker.timeout.trim().is_empty() {
            parse_duration(&policy.circuit_breaker.timeout)?;
        }
        for p in policy.allowlist.streams.iter().chain(&policy.allowlist.deny) {
            StreamPattern::new(p)?;
        }
        for p in &policy.redact.patterns {
            RedactPattern::new(&p.name, &p.pattern, &p.replacement)?;
        }

        Ok(())
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.server.http_addr.parse().map_err(|e| {
            VlogsError::ConfigError(format!(
                "server.http_addr '{}' is not a valid socket address: {e}",
                self.server.http_addr
            ))
        })
    }
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(VlogsError::ConfigError(format!(
            "{ENV_PREFIX}{key}: expected a boolean, got '{v}'"
        ))),
    }
}

fn parse_number<T: FromStr>(key: &str, v: &str) -> Result<T> {
    v.trim().parse().map_err(|_| {
        VlogsError::ConfigError(format!("{ENV_PREFIX}{key}: expected a number, got '{v}'"))
    })
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
