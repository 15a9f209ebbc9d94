use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vlogs_mcp::config::{Config, LogFormat, LoggingConfig, ServerMode};
use vlogs_mcp::http::serve_http;
use vlogs_mcp::mcp::run_stdio;
use vlogs_mcp::observability::Observability;
use vlogs_mcp::server::ToolServer;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

enum Command {
    Run(Option<PathBuf>),
    Version,
}

fn parse_args() -> anyhow::Result<Command> {
    let mut args = env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-v" | "--version" => return Ok(Command::Version),
            "-c" | "--config" => {
                let p = args.next().context("--config needs a path")?;
                path = Some(PathBuf::from(p));
            }
            s if s.starts_with('-') => bail!("unknown flag: {s}\nusage: vlogs-mcp [--config <config.yaml|json>] [--version]"),
            s => path = Some(PathBuf::from(s)),
        }
    }
    Ok(Command::Run(path))
}

/// 日志只写 stderr，stdout 留给 stdio 协议。
fn init_tracing(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(&cfg.level)
            .with_context(|| format!("invalid log level {:?}", cfg.level))?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cfg.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_ansi(false).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = match parse_args()? {
        Command::Version => {
            println!("vlogs-mcp {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Run(path) => path,
    };

    let config = match &path {
        Some(p) => Config::load_from_path(p)
            .with_context(|| format!("load config {}", p.display()))?,
        None => Config::from_env().context("load config from environment")?,
    };
    init_tracing(&config.logging)?;

    let server = ToolServer::new(&config, Observability::new()).context("init server")?;
    info!(
        name = %config.server.name,
        version = %config.server.version,
        transport = ?config.server.transport,
        upstream = %config.victorialogs.url,
        "starting"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
            shutdown.cancel();
        });
    }
    let cleanup = server
        .pipeline()
        .rate_limiter
        .spawn_cleanup(CLEANUP_INTERVAL, shutdown.clone());

    match config.server.transport {
        ServerMode::Stdio => run_stdio(server, shutdown.clone()).await?,
        ServerMode::Http => {
            let addr = config.http_addr()?;
            serve_http(server, addr, shutdown.clone()).await?;
        }
        ServerMode::Both => {
            let addr = config.http_addr()?;
            let http_task = tokio::spawn(serve_http(server.clone(), addr, shutdown.clone()));
            // stdin closing ends the process, HTTP included
            let stdio = run_stdio(server, shutdown.clone()).await;
            shutdown.cancel();
            match http_task.await {
                Ok(r) => r?,
                Err(e) => warn!(error = %e, "http task failed"),
            }
            stdio?;
        }
    }

    shutdown.cancel();
    let _ = cleanup.await;
    info!("stopped");
    Ok(())
}
