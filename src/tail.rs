//! 实时日志流（tail）。
//!
//! The upstream keeps the response open and writes one JSON line per new
//! entry. A tail ends when the body ends, the entry callback breaks, the
//! timeout elapses or the caller cancels. Whichever happens first, the
//! response future is dropped and the connection goes with it.

use std::ops::ControlFlow;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{Client, TAIL_PATH};
use crate::error::{Result, VlogsError};
use crate::model::LogEntry;
use crate::ndjson::{decode_log_line, LineBuffer};

pub const DEFAULT_TAIL_LIMIT: usize = 100;
pub const MAX_TAIL_LIMIT: usize = 1000;
pub const DEFAULT_TAIL_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_TAIL_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time the HTTP layer gets beyond the tail deadline.
const REQUEST_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailOptions {
    pub limit: usize,
    pub timeout: Duration,
    pub extra_stream_filters: Option<String>,
}

impl Default for TailOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_TAIL_LIMIT,
            timeout: DEFAULT_TAIL_TIMEOUT,
            extra_stream_filters: None,
        }
    }
}

impl TailOptions {
    /// Missing or zero values take the defaults; larger values are clamped.
    pub fn new(limit: Option<u64>, timeout_secs: Option<u64>) -> Self {
        let limit = match limit {
            None | Some(0) => DEFAULT_TAIL_LIMIT,
            Some(n) => (n as usize).min(MAX_TAIL_LIMIT),
        };
        let timeout = match timeout_secs {
            None | Some(0) => DEFAULT_TAIL_TIMEOUT,
            Some(s) => Duration::from_secs(s).min(MAX_TAIL_TIMEOUT),
        };
        Self {
            limit,
            timeout,
            extra_stream_filters: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.min(MAX_TAIL_TIMEOUT);
        self
    }

    pub fn with_stream_filter(mut self, filter: Option<String>) -> Self {
        self.extra_stream_filters = filter;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailOutcome {
    /// The upstream closed the stream.
    Completed,
    LimitReached,
    TimedOut,
    Cancelled,
}

impl TailOutcome {
    /// Timeouts and limits end a tail normally with whatever was collected.
    pub fn is_partial_success(self) -> bool {
        matches!(
            self,
            TailOutcome::Completed | TailOutcome::LimitReached | TailOutcome::TimedOut
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TailReport {
    pub entries: Vec<LogEntry>,
    pub outcome: TailOutcome,
}

impl Client {
    pub async fn tail<F>(
        &self,
        query: &str,
        opts: &TailOptions,
        cancel: &CancellationToken,
        mut on_entry: F,
    ) -> Result<TailOutcome>
    where
        F: FnMut(LogEntry) -> ControlFlow<()> + Send,
    {
        if query.trim().is_empty() {
            return Err(VlogsError::InvalidRequest("query must not be empty".into()));
        }
        let timeout = opts.timeout.min(MAX_TAIL_TIMEOUT);

        let mut qs = vec![("query", query.to_string())];
        if let Some(f) = &opts.extra_stream_filters {
            qs.push(("extra_stream_filters", f.clone()));
        }
        let request = self.get(TAIL_PATH, &qs).timeout(timeout + REQUEST_GRACE);

        let stream_entries = async {
            let resp = request.send().await.map_err(|e| {
                VlogsError::api(0, format!("tail request failed: {e}")).with_query(query)
            })?;
            if !resp.status().is_success() {
                return Err(VlogsError::api(resp.status().as_u16(), "tail request failed")
                    .with_query(query));
            }

            let mut body = resp.bytes_stream();
            let mut lines = LineBuffer::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| {
                    VlogsError::api(0, format!("tail stream interrupted: {e}")).with_query(query)
                })?;
                for line in lines.push(&chunk) {
                    if let Some(entry) = decode_log_line(&line) {
                        if on_entry(entry).is_break() {
                            return Ok(TailOutcome::LimitReached);
                        }
                    }
                }
            }
            if let Some(entry) = lines.finish().as_deref().and_then(decode_log_line) {
                if on_entry(entry).is_break() {
                    return Ok(TailOutcome::LimitReached);
                }
            }
            Ok::<_, VlogsError>(TailOutcome::Completed)
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(TailOutcome::Cancelled),
            _ = tokio::time::sleep(timeout) => Ok(TailOutcome::TimedOut),
            r = stream_entries => r,
        };

        self.obs.record_upstream(TAIL_PATH, outcome.is_ok());
        if let Ok(o) = &outcome {
            debug!(outcome = ?o, timeout_ms = timeout.as_millis() as u64, "tail finished");
        }
        outcome
    }

    /// Collect up to `opts.limit` entries. Timeouts and limits are not errors.
    pub async fn tail_collect(
        &self,
        query: &str,
        opts: &TailOptions,
        cancel: &CancellationToken,
    ) -> Result<TailReport> {
        let limit = opts.limit.clamp(1, MAX_TAIL_LIMIT);
        let mut entries = Vec::new();
        let outcome = self
            .tail(query, opts, cancel, |entry| {
                entries.push(entry);
                if entries.len() >= limit {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .await?;
        Ok(TailReport { entries, outcome })
    }
}
