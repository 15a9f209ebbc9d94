use std::sync::Arc;

use serde::Serialize;

use crate::allowlist::Allowlist;
use crate::audit::AuditRecorder;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerMetrics};
use crate::config::PolicyConfig;
use crate::error::Result;
use crate::middleware::{
    audit_guard, chain, circuit_breaker_guard, rate_limit_guard, redact_guard, ToolHandler,
    ToolMiddleware,
};
use crate::observability::Observability;
use crate::rate_limit::RateLimiter;
use crate::redact::Redactor;

/// 所有 guard 的集合。每个 server 实例一份，guard 状态在所有调用间共享。
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub rate_limiter: Arc<RateLimiter>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub allowlist: Arc<Allowlist>,
    pub redactor: Arc<Redactor>,
    pub audit: Arc<AuditRecorder>,
    obs: Observability,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub rate_limit_enabled: bool,
    pub requests_per_minute: u32,
    pub circuit_breaker: CircuitBreakerMetrics,
    pub allowlist_enabled: bool,
    pub redact_patterns: Vec<String>,
    pub audit_enabled: bool,
}

impl Pipeline {
    pub fn new(config: &PolicyConfig, obs: Observability) -> Result<Self> {
        Ok(Self {
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit, obs.clone())),
            circuit_breaker: Arc::new(CircuitBreaker::new(&config.circuit_breaker, obs.clone())?),
            allowlist: Arc::new(Allowlist::new(&config.allowlist, obs.clone())?),
            redactor: Arc::new(Redactor::new(&config.redact, obs.clone())),
            audit: Arc::new(AuditRecorder::new(&config.audit)),
            obs,
        })
    }

    pub fn observability(&self) -> &Observability {
        &self.obs
    }

    /// Production order, outermost first: rate limit, circuit breaker,
    /// audit, redact.
    pub fn middlewares(&self) -> Vec<ToolMiddleware> {
        vec![
            rate_limit_guard(self.rate_limiter.clone()),
            circuit_breaker_guard(self.circuit_breaker.clone()),
            audit_guard(self.audit.clone()),
            redact_guard(self.redactor.clone()),
        ]
    }

    pub fn wrap(&self, handler: ToolHandler) -> ToolHandler {
        chain(&self.middlewares(), handler)
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            rate_limit_enabled: self.rate_limiter.is_enabled(),
            requests_per_minute: self.rate_limiter.limit(),
            circuit_breaker: self.circuit_breaker.metrics(),
            allowlist_enabled: self.allowlist.is_enabled(),
            redact_patterns: self.redactor.pattern_names(),
            audit_enabled: self.audit.is_enabled(),
        }
    }
}
