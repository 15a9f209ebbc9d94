use thiserror::Error;

pub type Result<T> = std::result::Result<T, VlogsError>;

/// 策略拒绝：始终可恢复，以普通的错误结果返回给调用方。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("rate limit exceeded, please try again later")]
    RateLimitExceeded,

    #[error("service temporarily unavailable, please try again later")]
    CircuitOpen,

    #[error("stream access denied")]
    StreamDenied,

    #[error("stream not in allowlist")]
    StreamNotAllowed,
}

#[derive(Debug, Error)]
pub enum VlogsError {
    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("无效请求: {0}")]
    InvalidRequest(String),

    #[error("时间解析错误: {input}")]
    TimeParseError { input: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Upstream answered with a non-2xx status; `status == 0` means the
    /// request never got a response.
    #[error(
        "VictoriaLogs API error (HTTP {status}): {message}{}",
        .query.as_deref().map(|q| format!(", Query: {q}")).unwrap_or_default()
    )]
    ApiError {
        status: u16,
        message: String,
        query: Option<String>,
    },

    #[error("响应解析失败: {0}")]
    DecodeError(String),

    #[error("请求已取消")]
    Cancelled,

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VlogsError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        VlogsError::ApiError {
            status,
            message: message.into(),
            query: None,
        }
    }

    /// Attach the LogsQL query to an upstream error, leaving other kinds alone.
    pub fn with_query(self, q: &str) -> Self {
        match self {
            VlogsError::ApiError {
                status, message, ..
            } => VlogsError::ApiError {
                status,
                message,
                query: Some(q.to_string()),
            },
            other => other,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            VlogsError::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Connection-class: no response at all, or a 5xx.
    pub fn is_connection_error(&self) -> bool {
        matches!(self.status(), Some(s) if s == 0 || s >= 500)
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }

    pub fn is_rate_limit_error(&self) -> bool {
        matches!(self.status(), Some(429))
    }

    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            VlogsError::ApiError { .. } | VlogsError::DecodeError(_)
        )
    }
}
