//! VictoriaLogs MCP 工具核心库
//! 守卫链（限流、熔断、审计、脱敏）+ 远端日志查询客户端 + 传输层。

pub mod allowlist;
pub mod audit;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod middleware;
pub mod model;
pub mod ndjson;
pub mod observability;
pub mod pipeline;
pub mod rate_limit;
pub mod redact;
pub mod server;
pub mod tail;
pub mod time;
pub mod tools;
