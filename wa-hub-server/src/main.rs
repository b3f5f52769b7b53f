//! HTTP supervisor binary: wires `wa-hub-core`'s `InstanceManager` and
//! `RestoreScheduler` behind an axum router.

mod driver;
mod handlers;
mod infra;
mod middleware;
mod routes;

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infra::app_state::AppState;
use infra::config;

#[derive(Parser, Debug)]
#[command(name = "wa-hub-server")]
#[command(about = "HTTP supervisor for multi-tenant WhatsApp Web sessions")]
struct Args {
    /// Path to a TOML config file (overrides the default search locations).
    #[arg(long, env = "WA_HUB_CONFIG")]
    config: Option<PathBuf>,

    /// Server port (overrides config).
    #[arg(short, long, env = "WA_HUB_PORT")]
    port: Option<u16>,

    /// Server host (overrides config).
    #[arg(long, env = "WA_HUB_HOST")]
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wa_hub_server=info,wa_hub_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(host) = args.host {
        cfg.host = host;
    }

    info!(host = %cfg.host, port = cfg.port, "configuration loaded");

    let state = AppState::build(cfg).await?;

    let shutdown = CancellationToken::new();
    let manager = state.instances.clone();
    manager.restore_on_startup(&state.restore).await;

    {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        wa_hub_core::restore::RestoreScheduler::spawn_tick_loop(
            state.restore.clone(),
            move |instance| {
                let manager = manager.clone();
                async move { manager.restore_one(instance).await }
            },
            move |instance, reason| {
                warn!(instance = %instance.id, reason = %reason, "giving up restoring instance at startup");
            },
            shutdown,
        );
    }

    let addr = state.config.bind_addr()?;
    let app = routes::build(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining in-flight requests");
    token.cancel();
}
