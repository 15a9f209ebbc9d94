use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::client::{Client, ClientConfig};
use crate::config::Config;
use crate::error::Result;
use crate::middleware::handler_fn;
use crate::model::{ToolRequest, ToolResult};
use crate::observability::Observability;
use crate::pipeline::Pipeline;
use crate::tools::{self, ToolContext, ToolDefinition};

/// 工具服务：参数解析 → guard 链 → 处理函数。
///
/// Cloning is cheap; all clones share guard state and counters.
#[derive(Debug, Clone)]
pub struct ToolServer {
    name: String,
    version: String,
    pipeline: Pipeline,
    ctx: ToolContext,
}

impl ToolServer {
    pub fn new(config: &Config, obs: Observability) -> Result<Self> {
        let client = Client::new(ClientConfig::from_config(&config.victorialogs)?, obs.clone())?;
        let pipeline = Pipeline::new(&config.policy, obs)?;
        Ok(Self::from_parts(
            &config.server.name,
            &config.server.version,
            pipeline,
            Arc::new(client),
        ))
    }

    pub fn from_parts(name: &str, version: &str, pipeline: Pipeline, client: Arc<Client>) -> Self {
        let ctx = ToolContext {
            client,
            allowlist: pipeline.allowlist.clone(),
        };
        Self {
            name: name.to_string(),
            version: version.to_string(),
            pipeline,
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn observability(&self) -> &Observability {
        self.pipeline.observability()
    }

    pub fn tools(&self) -> Vec<ToolDefinition> {
        tools::definitions()
    }

    /// Every outcome, including internal failures, comes back as a result.
    pub async fn call(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        cancel: CancellationToken,
    ) -> ToolResult {
        let started = Instant::now();
        let result = match tools::parse_call(name, &arguments, self.ctx.client.max_results()) {
            Err(e) => {
                warn!(tool = %name, error = %e, "rejected tool arguments");
                ToolResult::from_error(&e)
            }
            Ok(call) => {
                let ctx = self.ctx.clone();
                let handler = handler_fn(move |req: ToolRequest| {
                    let ctx = ctx.clone();
                    let call = call.clone();
                    async move { call.execute(&ctx, &req.cancel).await }
                });
                let request = ToolRequest::new(name, arguments).with_cancel(cancel);
                match self.pipeline.wrap(handler)(request).await {
                    Ok(r) => r,
                    Err(e) => {
                        error!(tool = %name, error = %e, "tool call failed");
                        ToolResult::from_error(&e)
                    }
                }
            }
        };

        self.observability().record_tool_call(
            name,
            result.is_success(),
            started.elapsed().as_millis() as u64,
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailureKind;
    use serde_json::json;

    fn server() -> ToolServer {
        let mut cfg = Config::default();
        // nothing listens here; calls that reach the client fail fast
        cfg.victorialogs.url = "http://127.0.0.1:1".into();
        cfg.victorialogs.timeout = "2s".into();
        ToolServer::new(&cfg, Observability::new()).unwrap()
    }

    #[tokio::test]
    async fn malformed_arguments_skip_the_chain() {
        let s = server();
        let r = s
            .call("vlogs-query", Map::new(), CancellationToken::new())
            .await;
        assert_eq!(r.kind, Some(FailureKind::InvalidInput));
        assert_eq!(s.pipeline().rate_limiter.remaining("vlogs-query"), 60);

        let snap = s.observability().snapshot();
        assert_eq!(snap.tool_calls["vlogs-query"].errors, 1);
    }

    #[tokio::test]
    async fn out_of_range_relative_time_is_invalid_input() {
        let s = server();
        for start in ["100000000d", "18446744073709551615s"] {
            let args = json!({"query": "*", "start": start}).as_object().cloned().unwrap();
            let r = s.call("vlogs-query", args, CancellationToken::new()).await;
            assert_eq!(r.kind, Some(FailureKind::InvalidInput), "{start}");
        }
        let args = json!({"start": "100000000d"}).as_object().cloned().unwrap();
        let r = s.call("vlogs-stats", args, CancellationToken::new()).await;
        assert_eq!(r.kind, Some(FailureKind::InvalidInput));
        assert_eq!(s.pipeline().circuit_breaker.metrics().failure_count, 0);
    }

    #[tokio::test]
    async fn unknown_tool_is_invalid_input() {
        let r = server()
            .call("vlogs-drop", Map::new(), CancellationToken::new())
            .await;
        assert!(r.is_error);
        assert!(r.first_text().unwrap().contains("vlogs-drop"));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_an_upstream_failure() {
        let s = server();
        let args = json!({"query": "error"}).as_object().cloned().unwrap();
        let r = s.call("vlogs-query", args, CancellationToken::new()).await;
        assert_eq!(r.kind, Some(FailureKind::Upstream));
        assert_eq!(s.pipeline().rate_limiter.remaining("vlogs-query"), 59);
        assert_eq!(s.pipeline().circuit_breaker.metrics().failure_count, 1);
    }

    #[test]
    fn lists_six_tools() {
        assert_eq!(server().tools().len(), 6);
    }
}
