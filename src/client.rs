use std::time::Duration;

use reqwest::RequestBuilder;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{AuthType, VictoriaLogsConfig};
use crate::error::{Result, VlogsError};
use crate::model::{
    ExplainResponse, FieldValuesResponse, FieldsResponse, HealthResponse, QueryParams,
    QueryResponse, SchemaKind, SchemaParams, SchemaResponse, StatsParams, StatsResponse,
    StreamsResponse,
};
use crate::ndjson;
use crate::observability::Observability;
use crate::time::format_time;

pub const QUERY_PATH: &str = "/select/logsql/query";
pub const HITS_PATH: &str = "/select/logsql/hits";
pub const STREAMS_PATH: &str = "/select/logsql/streams";
pub const FIELD_NAMES_PATH: &str = "/select/logsql/field_names";
pub const FIELD_VALUES_PATH: &str = "/select/logsql/field_values";
pub const TAIL_PATH: &str = "/select/logsql/tail";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Basic { username: String, password: String },
    Bearer(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub auth: Auth,
    pub timeout: Duration,
    pub max_results: usize,
}

impl ClientConfig {
    pub fn from_config(cfg: &VictoriaLogsConfig) -> Result<Self> {
        let auth = match cfg.auth.kind {
            AuthType::None => Auth::None,
            AuthType::Basic => Auth::Basic {
                username: cfg.auth.username.clone(),
                password: cfg.auth.password.clone(),
            },
            AuthType::Bearer => Auth::Bearer(cfg.auth.token.clone()),
        };
        Ok(Self {
            base_url: cfg.url.trim_end_matches('/').to_string(),
            auth,
            timeout: cfg.timeout()?,
            max_results: cfg.max_results.max(1),
        })
    }
}

/// VictoriaLogs HTTP 客户端。所有调用都会与调用方的 `CancellationToken` 竞争。
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    auth: Auth,
    max_results: usize,
    pub(crate) obs: Observability,
}

impl Client {
    pub fn new(config: ClientConfig, obs: Observability) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout.min(Duration::from_secs(10)))
            .timeout(config.timeout)
            .build()
            .map_err(|e| VlogsError::ConfigError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth: config.auth,
            max_results: config.max_results.max(1),
            obs,
        })
    }

    pub fn max_results(&self) -> usize {
        self.max_results
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn url(&self, path: &str, params: &[(&str, String)]) -> String {
        let mut url = format!("{}{}", self.base_url, path);
        for (i, (k, v)) in params.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(k);
            url.push('=');
            url.push_str(&urlencoding::encode(v));
        }
        url
    }

    pub(crate) fn get(&self, path: &str, params: &[(&str, String)]) -> RequestBuilder {
        let req = self.http.get(self.url(path, params));
        match &self.auth {
            Auth::None => req,
            Auth::Basic { username, password } => req.basic_auth(username, Some(password)),
            Auth::Bearer(token) => req.bearer_auth(token),
        }
    }

    async fn get_text(
        &self,
        path: &'static str,
        params: &[(&str, String)],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let fetch = async {
            let resp = self
                .get(path, params)
                .send()
                .await
                .map_err(|e| VlogsError::api(0, format!("HTTP request failed: {e}")))?;
            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| VlogsError::api(0, format!("failed to read response: {e}")))?;
            if !status.is_success() {
                return Err(VlogsError::api(status.as_u16(), body.trim().to_string()));
            }
            Ok::<_, VlogsError>(body)
        };

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VlogsError::Cancelled),
            r = fetch => r,
        };
        self.obs.record_upstream(path, res.is_ok());
        if let Err(e) = &res {
            debug!(path, error = %e, "upstream request failed");
        }
        res
    }

    pub async fn query(&self, params: &QueryParams, cancel: &CancellationToken) -> Result<QueryResponse> {
        if params.query.trim().is_empty() {
            return Err(VlogsError::InvalidRequest("query must not be empty".into()));
        }

        let limit = match params.limit {
            0 => self.max_results,
            n => n.min(self.max_results),
        };
        let mut qs = vec![("query", params.query.clone())];
        if let Some(start) = &params.start {
            qs.push(("start", format_time(start)));
        }
        if let Some(end) = &params.end {
            qs.push(("end", format_time(end)));
        }
        qs.push(("limit", limit.to_string()));
        if let Some(f) = &params.extra_stream_filters {
            qs.push(("extra_stream_filters", f.clone()));
        }

        let body = self
            .get_text(QUERY_PATH, &qs, cancel)
            .await
            .map_err(|e| e.with_query(&params.query))?;
        let entries = ndjson::parse_log_entries(&body);
        Ok(QueryResponse {
            total: entries.len(),
            truncated: entries.len() >= limit,
            entries,
        })
    }

    pub async fn stats(&self, params: &StatsParams, cancel: &CancellationToken) -> Result<StatsResponse> {
        let mut qs = Vec::new();
        if let Some(q) = params.query.as_deref().filter(|q| !q.trim().is_empty()) {
            qs.push(("query", q.to_string()));
        } else {
            // hits requires a filter; `*` matches everything
            qs.push(("query", "*".to_string()));
        }
        qs.push(("start", format_time(&params.start)));
        if let Some(end) = &params.end {
            qs.push(("end", format_time(end)));
        }
        if let Some(step) = &params.step {
            qs.push(("step", step.clone()));
        }
        if let Some(f) = &params.extra_stream_filters {
            qs.push(("extra_stream_filters", f.clone()));
        }

        let body = self.get_text(HITS_PATH, &qs, cancel).await?;
        Ok(StatsResponse {
            hits: ndjson::parse_hits(&body),
        })
    }

    pub async fn streams(
        &self,
        query: Option<&str>,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<StreamsResponse> {
        let qs = schema_params(query, None, limit);
        let body = self.get_text(STREAMS_PATH, &qs, cancel).await?;
        Ok(StreamsResponse {
            streams: ndjson::parse_streams(&body),
        })
    }

    pub async fn field_names(
        &self,
        query: Option<&str>,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<FieldsResponse> {
        let qs = schema_params(query, None, limit);
        let body = self.get_text(FIELD_NAMES_PATH, &qs, cancel).await?;
        Ok(FieldsResponse {
            fields: ndjson::parse_field_names(&body),
        })
    }

    pub async fn field_values(
        &self,
        field: &str,
        query: Option<&str>,
        limit: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<FieldValuesResponse> {
        if field.trim().is_empty() {
            return Err(VlogsError::InvalidRequest("field is required".into()));
        }
        let qs = schema_params(query, Some(field), limit);
        let body = self.get_text(FIELD_VALUES_PATH, &qs, cancel).await?;
        Ok(FieldValuesResponse {
            values: ndjson::parse_field_values(&body),
        })
    }

    /// One schema listing. The stream filter, when set, scopes the listing
    /// the same way it scopes queries.
    pub async fn schema(&self, params: &SchemaParams, cancel: &CancellationToken) -> Result<SchemaResponse> {
        let query = params.query.as_deref();
        let (path, field) = match params.kind {
            SchemaKind::Streams => (STREAMS_PATH, None),
            SchemaKind::Fields => (FIELD_NAMES_PATH, None),
            SchemaKind::Values => match params.field.as_deref().filter(|f| !f.trim().is_empty()) {
                Some(f) => (FIELD_VALUES_PATH, Some(f)),
                None => return Err(VlogsError::InvalidRequest("field is required".into())),
            },
        };
        let mut qs = schema_params(query, field, params.limit);
        if let Some(f) = &params.extra_stream_filters {
            qs.push(("extra_stream_filters", f.clone()));
        }

        let body = self.get_text(path, &qs, cancel).await?;
        Ok(match params.kind {
            SchemaKind::Streams => SchemaResponse::Streams(StreamsResponse {
                streams: ndjson::parse_streams(&body),
            }),
            SchemaKind::Fields => SchemaResponse::Fields(FieldsResponse {
                fields: ndjson::parse_field_names(&body),
            }),
            SchemaKind::Values => SchemaResponse::Values(FieldValuesResponse {
                values: ndjson::parse_field_values(&body),
            }),
        })
    }

    /// A non-2xx answer is reported as `unhealthy`; only transport failures
    /// are errors.
    pub async fn health(&self, cancel: &CancellationToken) -> Result<HealthResponse> {
        let check = async {
            let resp = self
                .get(HEALTH_PATH, &[])
                .send()
                .await
                .map_err(|e| VlogsError::api(0, format!("health check failed: {e}")))?;
            let status = if resp.status().is_success() {
                "healthy"
            } else {
                "unhealthy"
            };
            Ok::<_, VlogsError>(HealthResponse {
                status: status.to_string(),
                version: None,
            })
        };

        let res = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VlogsError::Cancelled),
            r = check => r,
        };
        self.obs.record_upstream(HEALTH_PATH, res.is_ok());
        res
    }

    /// Validates the query against the upstream with `limit=1`, then attaches
    /// a static breakdown. A 4xx answer marks the query invalid instead of
    /// failing the call.
    pub async fn explain(
        &self,
        query: &str,
        extra_stream_filters: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ExplainResponse> {
        let mut analysis = analyze_query(query)?;
        let check = QueryParams {
            query: query.to_string(),
            limit: 1,
            extra_stream_filters: extra_stream_filters.map(String::from),
            ..QueryParams::default()
        };
        match self.query(&check, cancel).await {
            Ok(_) => analysis.valid = true,
            Err(VlogsError::ApiError {
                status, message, ..
            }) if (400..500).contains(&status) && status != 401 && status != 403 && status != 429 => {
                analysis.valid = false;
                analysis
                    .warnings
                    .insert(0, format!("rejected by VictoriaLogs (HTTP {status}): {message}"));
            }
            Err(e) => return Err(e),
        }
        Ok(analysis)
    }
}

fn schema_params(
    query: Option<&str>,
    field: Option<&str>,
    limit: Option<usize>,
) -> Vec<(&'static str, String)> {
    let mut qs = Vec::new();
    if let Some(f) = field {
        qs.push(("field", f.to_string()));
    }
    qs.push((
        "query",
        query
            .filter(|q| !q.trim().is_empty())
            .unwrap_or("*")
            .to_string(),
    ));
    if let Some(l) = limit.filter(|l| *l > 0) {
        qs.push(("limit", l.to_string()));
    }
    qs
}

/// Static LogsQL breakdown: filter terms before the first `|`, pipes after.
pub fn analyze_query(query: &str) -> Result<ExplainResponse> {
    let query = query.trim();
    if query.is_empty() {
        return Err(VlogsError::InvalidRequest("query must not be empty".into()));
    }

    let mut segments = split_top_level(query, '|').into_iter();
    let filter_part = segments.next().unwrap_or_default();
    let pipes: Vec<String> = segments.filter(|s| !s.is_empty()).collect();

    let filters: Vec<String> = split_top_level(&filter_part, ' ')
        .into_iter()
        .filter(|t| !t.is_empty())
        .filter(|t| !matches!(t.to_ascii_uppercase().as_str(), "AND" | "OR" | "NOT"))
        .collect();

    let has_stream_filter = query.contains("_stream:") || filters.iter().any(|f| f.starts_with('{'));
    let has_time_filter = query.contains("_time:");
    let has_stats = pipes.iter().any(|p| p.starts_with("stats"));

    let mut warnings = Vec::new();
    if query.len() < 3 {
        warnings.push("query is very short and may match a large number of logs".to_string());
    }
    if filters.iter().any(|f| f == "*") && !has_stream_filter && !has_time_filter {
        warnings.push("`*` without a stream or time filter scans every log".to_string());
    }

    let mut tips = Vec::new();
    if !has_stream_filter {
        tips.push("add a _stream:{...} filter to narrow the search scope".to_string());
    }
    if !has_time_filter {
        tips.push("add a _time filter or pass start/end to bound the time range".to_string());
    }
    if !has_stats && pipes.is_empty() {
        tips.push("use `| stats count()` to aggregate instead of fetching raw entries".to_string());
    }

    Ok(ExplainResponse {
        query: query.to_string(),
        valid: false,
        filters,
        pipes,
        has_stream_filter,
        has_time_filter,
        has_stats,
        warnings,
        tips,
    })
}

/// Split on `sep` outside quotes, braces and parentheses.
fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in s.chars() {
        if let Some(q) = quote {
            cur.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => {
                quote = Some(c);
                cur.push(c);
            }
            '{' | '(' | '[' => {
                depth += 1;
                cur.push(c);
            }
            '}' | ')' | ']' => {
                depth -= 1;
                cur.push(c);
            }
            c if c == sep && depth <= 0 => {
                parts.push(cur.trim().to_string());
                cur.clear();
            }
            c => cur.push(c),
        }
    }
    parts.push(cur.trim().to_string());
    parts
}
