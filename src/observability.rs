//! 显式传递的可观测性上下文：各个 guard 与客户端在构造时注入，避免全局单例。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

#[derive(Debug, Default)]
struct Counters {
    rate_limit_hits: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    allowlist_blocks: AtomicU64,
    redactions: AtomicU64,
    tool_calls: RwLock<BTreeMap<String, ToolCounter>>,
    upstream: RwLock<BTreeMap<String, UpstreamCounter>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ToolCounter {
    pub calls: u64,
    pub errors: u64,
    pub total_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct UpstreamCounter {
    pub requests: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub rate_limit_hits: u64,
    pub circuit_breaker_trips: u64,
    pub allowlist_blocks: u64,
    pub redactions: u64,
    pub tool_calls: BTreeMap<String, ToolCounter>,
    pub upstream: BTreeMap<String, UpstreamCounter>,
}

/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Observability {
    counters: Arc<Counters>,
}

impl Observability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rate_limit_hit(&self) {
        self.counters.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_breaker_trip(&self) {
        self.counters
            .circuit_breaker_trips
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowlist_block(&self) {
        self.counters.allowlist_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redaction(&self) {
        self.counters.redactions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tool_call(&self, tool: &str, success: bool, duration_ms: u64) {
        let mut map = self.counters.tool_calls.write();
        let c = map.entry(tool.to_string()).or_default();
        c.calls += 1;
        if !success {
            c.errors += 1;
        }
        c.total_duration_ms = c.total_duration_ms.saturating_add(duration_ms);
    }

    pub fn record_upstream(&self, endpoint: &str, success: bool) {
        let mut map = self.counters.upstream.write();
        let c = map.entry(endpoint.to_string()).or_default();
        c.requests += 1;
        if !success {
            c.errors += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rate_limit_hits: self.counters.rate_limit_hits.load(Ordering::Relaxed),
            circuit_breaker_trips: self.counters.circuit_breaker_trips.load(Ordering::Relaxed),
            allowlist_blocks: self.counters.allowlist_blocks.load(Ordering::Relaxed),
            redactions: self.counters.redactions.load(Ordering::Relaxed),
            tool_calls: self.counters.tool_calls.read().clone(),
            upstream: self.counters.upstream.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let obs = Observability::new();
        let other = obs.clone();
        other.record_rate_limit_hit();
        other.record_tool_call("vlogs-query", false, 12);
        obs.record_tool_call("vlogs-query", true, 3);
        obs.record_upstream("/select/logsql/query", true);

        let snap = obs.snapshot();
        assert_eq!(snap.rate_limit_hits, 1);
        assert_eq!(
            snap.tool_calls["vlogs-query"],
            ToolCounter {
                calls: 2,
                errors: 1,
                total_duration_ms: 15
            }
        );
        assert_eq!(snap.upstream["/select/logsql/query"].requests, 1);
    }
}
