use std::{net::SocketAddr, sync::Arc};

use pyhost_agent::{
    config::AgentConfig,
    http::{self, AppState},
    lifecycle::Controller,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// stderr always; a daily-rotated file as well when a log dir is configured.
fn init_tracing(cfg: &AgentConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &cfg.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "pyhost-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => tracing::error!(%err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env();
    let _log_guard = init_tracing(&cfg)?;

    let controller = Controller::open(&cfg).await?;
    tracing::info!(
        upload_dir = %cfg.upload_dir.display(),
        state_dir = %cfg.state_dir.display(),
        interpreter = %cfg.interpreter,
        super_admin = cfg.super_admin,
        api_enabled = cfg.api_token.is_some(),
        "pyhost-agent starting"
    );
    if cfg.super_admin == 0 {
        tracing::warn!("ADMIN_ID is not set; no user has super-admin rights");
    }

    let app = http::router(AppState {
        controller: controller.clone(),
        api_token: cfg.api_token.as_deref().map(Arc::from),
    });

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    tracing::info!(%addr, base_url = %cfg.base_url, "pyhost-agent HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    controller.shutdown().await;
    tracing::info!("all managed processes stopped");
    Ok(())
}
