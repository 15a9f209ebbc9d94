//! 工具调用中间件链。
//!
//! A [`ToolMiddleware`] takes the next [`ToolHandler`] and returns a handler
//! that wraps it. [`chain`] composes a list so that the first middleware is
//! outermost: its "before" code runs first and its "after" code runs last.
//! Guards reject by returning a [`ToolResult`] with [`FailureKind::Policy`],
//! never an `Err`.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::debug;

use crate::audit::AuditRecorder;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{Result, VlogsError};
use crate::model::{Content, FailureKind, ToolRequest, ToolResult};
use crate::rate_limit::RateLimiter;
use crate::redact::Redactor;

pub type ToolHandler =
    Arc<dyn Fn(ToolRequest) -> BoxFuture<'static, Result<ToolResult>> + Send + Sync>;

pub type ToolMiddleware = Arc<dyn Fn(ToolHandler) -> ToolHandler + Send + Sync>;

pub fn handler_fn<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(ToolRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult>> + Send + 'static,
{
    Arc::new(move |req| -> BoxFuture<'static, Result<ToolResult>> { Box::pin(f(req)) })
}

pub fn middleware_fn<F>(f: F) -> ToolMiddleware
where
    F: Fn(ToolHandler) -> ToolHandler + Send + Sync + 'static,
{
    Arc::new(f)
}

/// `middlewares[0]` wraps `middlewares[1..]` and then `handler`.
pub fn chain(middlewares: &[ToolMiddleware], handler: ToolHandler) -> ToolHandler {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, mw| mw(next))
}

/// Passes every call straight through.
pub fn noop() -> ToolMiddleware {
    middleware_fn(|next| next)
}

/// Keyed by tool name.
pub fn rate_limit_guard(limiter: Arc<RateLimiter>) -> ToolMiddleware {
    middleware_fn(move |next: ToolHandler| {
        let limiter = limiter.clone();
        handler_fn(move |req: ToolRequest| {
            let limiter = limiter.clone();
            let next = next.clone();
            async move {
                if let Err(e) = limiter.allow(&req.name) {
                    return Ok(ToolResult::policy(e));
                }
                next(req).await
            }
        })
    })
}

/// Records exactly one outcome per admitted call: a failure for upstream and
/// internal results and for `Err`, nothing but a released half-open slot for
/// cancelled calls, a success otherwise.
pub fn circuit_breaker_guard(breaker: Arc<CircuitBreaker>) -> ToolMiddleware {
    middleware_fn(move |next: ToolHandler| {
        let breaker = breaker.clone();
        handler_fn(move |req: ToolRequest| {
            let breaker = breaker.clone();
            let next = next.clone();
            async move {
                if let Err(e) = breaker.allow() {
                    debug!(tool = %req.name, state = breaker.state_str(), "circuit breaker rejected call");
                    return Ok(ToolResult::policy(e));
                }

                let outcome = next(req).await;
                match &outcome {
                    Ok(r) if r.kind == Some(FailureKind::Cancelled) => breaker.record_abandoned(),
                    Ok(r) if r.kind.is_some_and(|k| k.counts_as_failure()) => {
                        breaker.record_failure()
                    }
                    Ok(_) => breaker.record_success(),
                    Err(_) => breaker.record_failure(),
                }
                outcome
            }
        })
    })
}

pub fn audit_guard(recorder: Arc<AuditRecorder>) -> ToolMiddleware {
    middleware_fn(move |next: ToolHandler| {
        if !recorder.is_enabled() {
            return next;
        }
        let recorder = recorder.clone();
        handler_fn(move |req: ToolRequest| {
            let recorder = recorder.clone();
            let next = next.clone();
            async move {
                let name = req.name.clone();
                let arguments = req.arguments.clone();
                let started_at = Utc::now();
                let start = Instant::now();

                let outcome = next(req).await;

                let entry = recorder.entry(&name, &arguments, started_at, start.elapsed(), &outcome);
                recorder.record(&entry);
                outcome
            }
        })
    })
}

/// Rewrites text and JSON content of every result, error results included.
pub fn redact_guard(redactor: Arc<Redactor>) -> ToolMiddleware {
    middleware_fn(move |next: ToolHandler| {
        if !redactor.is_enabled() {
            return next;
        }
        let redactor = redactor.clone();
        handler_fn(move |req: ToolRequest| {
            let redactor = redactor.clone();
            let next = next.clone();
            async move {
                let mut result = next(req).await?;
                result.content = result
                    .content
                    .into_iter()
                    .map(|c| match c {
                        Content::Text(t) => Content::Text(redactor.apply(&t)),
                        Content::Json(v) => Content::Json(redactor.apply_to_value(v)),
                    })
                    .collect();
                Ok::<_, VlogsError>(result)
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuditConfig, RateLimitConfig, RedactConfig};
    use crate::error::PolicyError;
    use crate::observability::Observability;
    use parking_lot::Mutex;
    use serde_json::{json, Map};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Trace = Arc<Mutex<Vec<String>>>;

    fn tracing_mw(trace: Trace, name: &'static str) -> ToolMiddleware {
        middleware_fn(move |next: ToolHandler| {
            let trace = trace.clone();
            handler_fn(move |req: ToolRequest| {
                let trace = trace.clone();
                let next = next.clone();
                async move {
                    trace.lock().push(format!("{name}-before"));
                    let out = next(req).await;
                    trace.lock().push(format!("{name}-after"));
                    out
                }
            })
        })
    }

    fn request(name: &str) -> ToolRequest {
        ToolRequest::new(name, Map::new())
    }

    fn counting_handler(calls: Arc<AtomicUsize>, result: ToolResult) -> ToolHandler {
        handler_fn(move |_req| {
            let calls = calls.clone();
            let result = result.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(result)
            }
        })
    }

    #[tokio::test]
    async fn chain_order_is_list_order_in_and_reverse_out() {
        let trace: Trace = Arc::default();
        let t = trace.clone();
        let handler = handler_fn(move |_req| {
            let t = t.clone();
            async move {
                t.lock().push("H".to_string());
                Ok(ToolResult::text("ok"))
            }
        });

        let h = chain(
            &[tracing_mw(trace.clone(), "A"), tracing_mw(trace.clone(), "B")],
            handler,
        );
        h(request("t")).await.unwrap();

        assert_eq!(
            *trace.lock(),
            vec!["A-before", "B-before", "H", "B-after", "A-after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_inner_stages() {
        let trace: Trace = Arc::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let blocker = middleware_fn(|_next: ToolHandler| {
            handler_fn(|_req| async { Ok(ToolResult::policy(PolicyError::RateLimitExceeded)) })
        });

        let h = chain(
            &[tracing_mw(trace.clone(), "A"), blocker, tracing_mw(trace.clone(), "B")],
            counting_handler(calls.clone(), ToolResult::text("ok")),
        );
        let out = h(request("t")).await.unwrap();

        assert_eq!(out.kind, Some(FailureKind::Policy));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*trace.lock(), vec!["A-before", "A-after"]);
    }

    #[tokio::test]
    async fn noop_and_empty_chain_are_transparent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = chain(&[noop(), noop()], counting_handler(calls.clone(), ToolResult::text("x")));
        assert_eq!(h(request("t")).await.unwrap().first_text().as_deref(), Some("x"));

        let h = chain(&[], counting_handler(calls.clone(), ToolResult::text("y")));
        assert_eq!(h(request("t")).await.unwrap().first_text().as_deref(), Some("y"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rate_limit_guard_rejects_without_calling_handler() {
        let limiter = Arc::new(RateLimiter::new(
            &RateLimitConfig {
                enabled: true,
                requests_per_minute: 2,
            },
            Observability::new(),
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let h = chain(
            &[rate_limit_guard(limiter)],
            counting_handler(calls.clone(), ToolResult::text("ok")),
        );

        assert!(h(request("vlogs-query")).await.unwrap().is_success());
        assert!(h(request("vlogs-query")).await.unwrap().is_success());
        let third = h(request("vlogs-query")).await.unwrap();
        assert!(third.is_error);
        assert_eq!(third.kind, Some(FailureKind::Policy));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // separate key
        assert!(h(request("vlogs-stats")).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn breaker_guard_counts_upstream_failures_only() {
        let breaker = Arc::new(CircuitBreaker::with_timeout(
            true,
            2,
            Duration::from_secs(60),
            Observability::new(),
        ));

        let policy_calls = Arc::new(AtomicUsize::new(0));
        let policy = chain(
            &[circuit_breaker_guard(breaker.clone())],
            counting_handler(
                policy_calls.clone(),
                ToolResult::policy(PolicyError::StreamDenied),
            ),
        );
        for _ in 0..5 {
            policy(request("t")).await.unwrap();
        }
        assert_eq!(breaker.metrics().failure_count, 0);

        let upstream_calls = Arc::new(AtomicUsize::new(0));
        let upstream = chain(
            &[circuit_breaker_guard(breaker.clone())],
            counting_handler(
                upstream_calls.clone(),
                ToolResult::from_error(&VlogsError::api(503, "down")),
            ),
        );
        upstream(request("t")).await.unwrap();
        upstream(request("t")).await.unwrap();
        assert_eq!(breaker.state_str(), "open");

        let rejected = upstream(request("t")).await.unwrap();
        assert_eq!(rejected.kind, Some(FailureKind::Policy));
        assert_eq!(upstream_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn breaker_guard_ignores_cancelled_calls() {
        let breaker = Arc::new(CircuitBreaker::with_timeout(
            true,
            1,
            Duration::from_millis(20),
            Observability::new(),
        ));
        let cancelled = chain(
            &[circuit_breaker_guard(breaker.clone())],
            handler_fn(|_req| async { Ok(ToolResult::from_error(&VlogsError::Cancelled)) }),
        );
        for _ in 0..3 {
            cancelled(request("t")).await.unwrap();
        }
        assert_eq!(breaker.state_str(), "closed");
        assert_eq!(breaker.metrics().failure_count, 0);

        // a cancelled half-open call hands its slot to the next caller
        breaker.record_failure();
        assert_eq!(breaker.state_str(), "open");
        tokio::time::sleep(Duration::from_millis(30)).await;
        let r = cancelled(request("t")).await.unwrap();
        assert_eq!(r.kind, Some(FailureKind::Cancelled));
        assert_eq!(breaker.state_str(), "half-open");

        let calls = Arc::new(AtomicUsize::new(0));
        let ok = chain(
            &[circuit_breaker_guard(breaker.clone())],
            counting_handler(calls.clone(), ToolResult::text("ok")),
        );
        assert!(ok(request("t")).await.unwrap().is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state_str(), "closed");
    }

    #[tokio::test]
    async fn breaker_guard_treats_err_as_failure() {
        let breaker = Arc::new(CircuitBreaker::with_timeout(
            true,
            1,
            Duration::from_secs(60),
            Observability::new(),
        ));
        let h = chain(
            &[circuit_breaker_guard(breaker.clone())],
            handler_fn(|_req| async { Err(VlogsError::Io(std::io::Error::other("boom"))) }),
        );
        assert!(h(request("t")).await.is_err());
        assert_eq!(breaker.state_str(), "open");
    }

    #[tokio::test]
    async fn redact_guard_rewrites_text_and_json() {
        let redactor = Arc::new(Redactor::new(
            &RedactConfig {
                enabled: true,
                patterns: vec![],
            },
            Observability::new(),
        ));
        let handler = handler_fn(|_req| async {
            Ok(ToolResult {
                content: vec![
                    Content::Text("login password=secret123".into()),
                    Content::Json(json!({"client": "10.0.0.7", "n": 1})),
                ],
                is_error: false,
                kind: None,
            })
        });
        let h = chain(&[redact_guard(redactor)], handler);
        let out = h(request("t")).await.unwrap();

        assert_eq!(out.content[0], Content::Text("login [REDACTED_PASSWORD]".into()));
        assert_eq!(
            out.content[1],
            Content::Json(json!({"client": "[REDACTED_IP]", "n": 1}))
        );
    }

    #[tokio::test]
    async fn redact_guard_also_covers_error_results() {
        let redactor = Arc::new(Redactor::new(&RedactConfig::default(), Observability::new()));
        let handler = handler_fn(|_req| async {
            Ok(ToolResult::from_error(&VlogsError::api(
                500,
                "upstream 10.1.1.1 refused token=abc",
            )))
        });
        let out = chain(&[redact_guard(redactor)], handler)(request("t"))
            .await
            .unwrap();
        let text = out.first_text().unwrap();
        assert!(!text.contains("10.1.1.1"));
        assert!(!text.contains("token=abc"));
        assert_eq!(out.kind, Some(FailureKind::Upstream));
    }

    #[tokio::test]
    async fn audit_guard_passes_outcome_through() {
        let recorder = Arc::new(AuditRecorder::new(&AuditConfig { enabled: true }));
        let calls = Arc::new(AtomicUsize::new(0));
        let h = chain(
            &[audit_guard(recorder)],
            counting_handler(calls.clone(), ToolResult::text("ok")),
        );
        let mut args = Map::new();
        args.insert("query".into(), json!("error"));
        let out = h(ToolRequest::new("vlogs-query", args)).await.unwrap();
        assert_eq!(out.first_text().as_deref(), Some("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
