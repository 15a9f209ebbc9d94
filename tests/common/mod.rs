//! In-process fake VictoriaLogs upstream for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Query, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;

use vlogs_mcp::client::{Auth, Client, ClientConfig};
use vlogs_mcp::observability::Observability;

#[derive(Debug, Clone)]
pub struct Recorded {
    pub path: String,
    pub params: HashMap<String, String>,
    pub authorization: Option<String>,
}

/// Every request the fake upstream has seen.
#[derive(Debug, Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Recorded>>>);

impl Recorder {
    pub fn all(&self) -> Vec<Recorded> {
        self.0.lock().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.0.lock().iter().filter(|r| r.path == path).count()
    }

    pub fn last(&self) -> Option<Recorded> {
        self.0.lock().last().cloned()
    }
}

pub fn record(recorder: &Recorder, req: &Request, params: HashMap<String, String>) {
    let authorization = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    recorder.0.lock().push(Recorded {
        path: req.uri().path().to_string(),
        params,
        authorization,
    });
}

/// Serve `router` on an ephemeral port and return its base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

pub fn client(base_url: &str, auth: Auth) -> Client {
    Client::new(
        ClientConfig {
            base_url: base_url.to_string(),
            auth,
            timeout: Duration::from_secs(5),
            max_results: 100,
        },
        Observability::new(),
    )
    .unwrap()
}

pub const QUERY_BODY: &str = concat!(
    r#"{"_time":"2024-05-01T10:00:00Z","_msg":"login ok","_stream":"{app=\"api\"}","level":"info"}"#,
    "\n",
    "garbage line\n",
    r#"{"_time":"2024-05-01T10:00:01Z","_msg":"login failed for admin password=hunter2","_stream":"{app=\"api\"}","level":"error","client_ip":"10.1.2.3"}"#,
    "\n",
);

/// A fake upstream answering every VictoriaLogs endpoint with canned data.
pub fn canned_router(recorder: Recorder) -> Router {
    let handler = move |Query(params): Query<HashMap<String, String>>, req: Request| {
        let recorder = recorder.clone();
        async move {
            record(&recorder, &req, params);
            match req.uri().path() {
                "/select/logsql/query" => QUERY_BODY.into_response(),
                "/select/logsql/hits" => {
                    r#"{"hits":[{"fields":{},"timestamps":["2024-05-01T00:00:00Z","2024-05-01T01:00:00Z"],"values":[4,6],"total":10}]}"#
                        .into_response()
                }
                "/select/logsql/streams" => {
                    r#"{"values":[{"value":"{app=\"api\"}","hits":12},{"value":"{app=\"web\"}","hits":3}]}"#
                        .into_response()
                }
                "/select/logsql/field_names" => {
                    r#"{"values":[{"value":"_msg","hits":15},{"value":"level","hits":15}]}"#
                        .into_response()
                }
                "/select/logsql/field_values" => {
                    r#"{"values":[{"value":"info","hits":9},{"value":"error","hits":6}]}"#
                        .into_response()
                }
                "/health" => "OK".into_response(),
                _ => StatusCode::NOT_FOUND.into_response(),
            }
        }
    };
    Router::new().fallback(handler)
}

/// Always answers with `status` and `body`.
pub fn fixed_router(recorder: Recorder, status: StatusCode, body: &'static str) -> Router {
    let handler = move |Query(params): Query<HashMap<String, String>>, req: Request| {
        let recorder = recorder.clone();
        async move {
            record(&recorder, &req, params);
            (status, body).into_response()
        }
    };
    Router::new().fallback(handler)
}

/// Tail endpoint: writes `lines` right away, then keeps the response open.
pub fn tail_router(recorder: Recorder, lines: Vec<&'static str>) -> Router {
    let handler = move |Query(params): Query<HashMap<String, String>>, req: Request| {
        let recorder = recorder.clone();
        let lines = lines.clone();
        async move {
            record(&recorder, &req, params);
            let stream = async_stream::stream! {
                for line in lines {
                    yield Ok::<_, std::io::Error>(Bytes::from(format!("{line}\n")));
                }
                // hold the connection open until the client goes away
                std::future::pending::<()>().await;
            };
            Response::new(Body::from_stream(stream))
        }
    };
    Router::new().route("/select/logsql/tail", get(handler))
}
