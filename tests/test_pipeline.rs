mod common;

use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use common::{canned_router, fixed_router, spawn_upstream, tail_router, Recorder};
use vlogs_mcp::circuit_breaker::CircuitState;
use vlogs_mcp::config::Config;
use vlogs_mcp::model::FailureKind;
use vlogs_mcp::observability::Observability;
use vlogs_mcp::server::ToolServer;

fn args(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap()
}

fn config(base: &str) -> Config {
    let mut cfg = Config::default();
    cfg.victorialogs.url = base.to_string();
    cfg.victorialogs.timeout = "5s".into();
    cfg
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_denied_stream_never_reaches_upstream() {
    let rec = Recorder::default();
    let base = spawn_upstream(canned_router(rec.clone())).await;
    let mut cfg = config(&base);
    cfg.policy.allowlist.enabled = true;
    cfg.policy.allowlist.streams = vec!["app/*".into(), "kubernetes/**".into()];
    cfg.policy.allowlist.deny = vec!["secret/*".into()];
    let server = ToolServer::new(&cfg, Observability::new()).unwrap();

    let r = server
        .call(
            "vlogs-query",
            args(json!({"query": "*", "stream": "secret/keys"})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(r.kind, Some(FailureKind::Policy));
    assert_eq!(r.first_text().as_deref(), Some("stream access denied"));

    let r = server
        .call(
            "vlogs-stats",
            args(json!({"start": "1h", "stream": "billing/invoices"})),
            CancellationToken::new(),
        )
        .await;
    assert_eq!(r.first_text().as_deref(), Some("stream not in allowlist"));
    assert!(rec.all().is_empty());
    assert_eq!(server.observability().snapshot().allowlist_blocks, 2);

    let r = server
        .call(
            "vlogs-query",
            args(json!({"query": "*", "stream": "kubernetes/prod/api"})),
            CancellationToken::new(),
        )
        .await;
    assert!(r.is_success());
    assert_eq!(rec.count("/select/logsql/query"), 1);
    assert_eq!(
        rec.last().unwrap().params["extra_stream_filters"],
        r#"{kubernetes="prod/api"}"#
    );
    // policy rejections are not breaker failures
    assert_eq!(server.pipeline().circuit_breaker.metrics().failure_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_allowlist_gates_every_scoped_tool() {
    let rec = Recorder::default();
    let base = spawn_upstream(canned_router(rec.clone())).await;
    let mut cfg = config(&base);
    cfg.policy.allowlist.enabled = true;
    cfg.policy.allowlist.streams = vec!["app/*".into()];
    cfg.policy.allowlist.deny = vec!["secret/*".into()];
    let server = ToolServer::new(&cfg, Observability::new()).unwrap();

    let unscoped = [
        ("vlogs-query", json!({"query": "*"})),
        ("vlogs-query", json!({"query": "_stream:{app=\"secret\"} password"})),
        ("vlogs-stats", json!({"start": "1h"})),
        ("vlogs-schema", json!({"type": "streams"})),
        ("vlogs-schema", json!({"type": "values", "field": "password"})),
        ("vlogs-tail", json!({"query": "*", "timeout": 1})),
        ("vlogs-explain", json!({"query": "*"})),
        ("vlogs-schema", json!({"type": "fields", "stream": "secret/keys"})),
        ("vlogs-explain", json!({"query": "*", "stream": "secret/keys"})),
    ];
    for (tool, a) in unscoped {
        let r = server.call(tool, args(a.clone()), CancellationToken::new()).await;
        assert_eq!(r.kind, Some(FailureKind::Policy), "{tool} {a}");
    }
    assert!(rec.all().is_empty());
    assert_eq!(server.observability().snapshot().allowlist_blocks, 9);

    let r = server
        .call(
            "vlogs-schema",
            args(json!({"type": "fields", "stream": "app/api"})),
            CancellationToken::new(),
        )
        .await;
    assert!(r.is_success());
    let sent = rec.last().unwrap();
    assert_eq!(sent.path, "/select/logsql/field_names");
    assert_eq!(sent.params["extra_stream_filters"], r#"{app="api"}"#);

    let r = server
        .call(
            "vlogs-explain",
            args(json!({"query": "error", "stream": "app/api"})),
            CancellationToken::new(),
        )
        .await;
    assert!(r.is_success());
    assert_eq!(rec.last().unwrap().params["extra_stream_filters"], r#"{app="api"}"#);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deny_rules_apply_to_selectors_in_query_text() {
    let rec = Recorder::default();
    let base = spawn_upstream(canned_router(rec.clone())).await;
    let mut cfg = config(&base);
    cfg.policy.allowlist.enabled = true;
    cfg.policy.allowlist.deny = vec!["secret/*".into()];
    let server = ToolServer::new(&cfg, Observability::new()).unwrap();

    for (tool, a) in [
        ("vlogs-query", json!({"query": "_stream:{secret=\"keys\"} error"})),
        ("vlogs-stats", json!({"start": "1h", "query": "{secret=\"keys\"}"})),
        ("vlogs-explain", json!({"query": "_stream:{secret=\"keys\"}"})),
    ] {
        let r = server.call(tool, args(a), CancellationToken::new()).await;
        assert_eq!(r.first_text().as_deref(), Some("stream access denied"), "{tool}");
    }
    assert!(rec.all().is_empty());

    // no allow rules, so an unscoped query is fine
    let r = server
        .call(
            "vlogs-query",
            args(json!({"query": "_stream:{app=\"api\"} error"})),
            CancellationToken::new(),
        )
        .await;
    assert!(r.is_success());
    assert!(!rec.last().unwrap().params.contains_key("extra_stream_filters"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_output_is_redacted() {
    let base = spawn_upstream(canned_router(Recorder::default())).await;
    let server = ToolServer::new(&config(&base), Observability::new()).unwrap();

    let r = server
        .call("vlogs-query", args(json!({"query": "login"})), CancellationToken::new())
        .await;
    let text = r.first_text().unwrap();
    assert!(text.starts_with("Found 2 log entries"));
    assert!(text.contains("[REDACTED_PASSWORD]"));
    assert!(!text.contains("hunter2"));
    assert!(!text.contains("10.1.2.3"));
    assert!(text.contains("[REDACTED_IP]"));
    assert!(server.observability().snapshot().redactions >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_json_tools_through_the_chain() {
    let base = spawn_upstream(canned_router(Recorder::default())).await;
    let server = ToolServer::new(&config(&base), Observability::new()).unwrap();
    let cancel = CancellationToken::new();

    let r = server
        .call("vlogs-schema", args(json!({"type": "fields"})), cancel.clone())
        .await;
    assert!(r.is_success());
    let v: Value = serde_json::from_str(&r.first_text().unwrap()).unwrap();
    assert_eq!(v["fields"][1]["name"], "level");

    let r = server.call("vlogs-health", Map::new(), cancel.clone()).await;
    let v: Value = serde_json::from_str(&r.first_text().unwrap()).unwrap();
    assert_eq!(v["status"], "healthy");

    let r = server
        .call("vlogs-stats", args(json!({"start": "24h"})), cancel)
        .await;
    let v: Value = serde_json::from_str(&r.first_text().unwrap()).unwrap();
    assert_eq!(v["hits"].as_array().unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_breaker_opens_on_upstream_failures() {
    let rec = Recorder::default();
    let base = spawn_upstream(fixed_router(
        rec.clone(),
        StatusCode::INTERNAL_SERVER_ERROR,
        "storage unavailable",
    ))
    .await;
    let mut cfg = config(&base);
    cfg.policy.circuit_breaker.error_threshold = 2;
    cfg.policy.circuit_breaker.timeout = "1s".into();
    let server = ToolServer::new(&cfg, Observability::new()).unwrap();
    let call = || server.call("vlogs-query", args(json!({"query": "*"})), CancellationToken::new());

    for _ in 0..2 {
        let r = call().await;
        assert_eq!(r.kind, Some(FailureKind::Upstream));
        assert!(r.first_text().unwrap().contains("HTTP 500"));
    }
    assert_eq!(server.pipeline().circuit_breaker.state(), CircuitState::Open);

    let r = call().await;
    assert_eq!(r.kind, Some(FailureKind::Policy));
    assert_eq!(rec.count("/select/logsql/query"), 2);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    // the half-open call goes through, fails and reopens the breaker
    let r = call().await;
    assert_eq!(r.kind, Some(FailureKind::Upstream));
    assert_eq!(rec.count("/select/logsql/query"), 3);
    assert_eq!(server.pipeline().circuit_breaker.state(), CircuitState::Open);
    assert_eq!(server.observability().snapshot().circuit_breaker_trips, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_limit_is_per_tool() {
    let rec = Recorder::default();
    let base = spawn_upstream(canned_router(rec.clone())).await;
    let mut cfg = config(&base);
    cfg.policy.rate_limit.requests_per_minute = 2;
    let server = ToolServer::new(&cfg, Observability::new()).unwrap();
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        assert!(server.call("vlogs-health", Map::new(), cancel.clone()).await.is_success());
    }
    let r = server.call("vlogs-health", Map::new(), cancel.clone()).await;
    assert_eq!(r.kind, Some(FailureKind::Policy));
    assert_eq!(rec.count("/health"), 2);

    let r = server
        .call("vlogs-schema", args(json!({"type": "streams"})), cancel)
        .await;
    assert!(r.is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tail_tool_cancel_and_timeout() {
    let base = spawn_upstream(tail_router(
        Recorder::default(),
        vec![r#"{"_msg":"user bob@example.com signed in"}"#],
    ))
    .await;
    let server = ToolServer::new(&config(&base), Observability::new()).unwrap();

    let r = server
        .call("vlogs-tail", args(json!({"query": "*", "timeout": 1})), CancellationToken::new())
        .await;
    assert!(r.is_success());
    let text = r.first_text().unwrap();
    let v: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["count"], 1);
    assert_eq!(v["outcome"], "timed_out");
    assert!(text.contains("[REDACTED_EMAIL]"));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
    }
    let r = server
        .call("vlogs-tail", args(json!({"query": "*", "timeout": 10})), cancel)
        .await;
    assert_eq!(r.kind, Some(FailureKind::Cancelled));
}
