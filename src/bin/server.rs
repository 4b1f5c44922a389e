//! Process entrypoint: parse CLI flags, load configuration, build the
//! `Runtime`, and serve the HTTP/WebSocket control surface until a shutdown
//! signal arrives (`spec.md` §6).

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use weather_orchestrator::api::build_router;
use weather_orchestrator::config::Config;
use weather_orchestrator::runtime::Runtime;
use weather_orchestrator::telemetry::init_tracing;

#[derive(Debug, Parser)]
#[command(name = "weather-orchestrator", about = "Weather/tourism data-collection orchestrator")]
struct Cli {
    /// Path to a YAML config file; falls back to ./config.yaml if omitted.
    #[arg(long, env = "WFB_CONFIG_PATH")]
    config: Option<String>,

    /// Emit structured JSON logs instead of pretty-printed ones.
    #[arg(long, env = "WFB_JSON_LOGS", default_value_t = false)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "fatal startup error: invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let bind_addr: SocketAddr = match config.bind_addr.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "fatal startup error: invalid bind_addr");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match Runtime::build(config).await {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "fatal startup error: could not build runtime");
            return ExitCode::FAILURE;
        }
    };

    let router = build_router(runtime.clone());
    info!(%bind_addr, "starting weather-orchestrator");

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "fatal startup error: could not bind listener");
            return ExitCode::FAILURE;
        }
    };

    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    runtime.shutdown().await;

    match serve_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
