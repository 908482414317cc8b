use std::sync::Arc;

use anyhow::Context;

use feedback_api::app::{build_app, services};
use feedback_infra::config::AppConfig;
use feedback_infra::jobs::QueueName;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    feedback_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        services::build_services(&config)
            .await
            .context("failed to initialise services")?,
    );

    let workers = if config.run_workers {
        services.spawn_workers(QueueName::ALL.map(|queue| config.worker_config(queue)))?
    } else {
        tracing::info!("RUN_WORKERS=false; gateway only");
        Vec::new()
    };

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, build_app(services))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!(workers = workers.len(), "draining workers");
    for worker in workers {
        worker.shutdown().await;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
