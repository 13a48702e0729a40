use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use dirpack_api::app::{self, ApiConfig};
use dirpack_infra::config::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dirpack_observability::init();

    let bind: SocketAddr = std::env::var("DIRPACK_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()
        .context("DIRPACK_BIND must be a socket address")?;

    let pipeline = PipelineConfig::from_env().context("invalid pipeline configuration")?;
    let services = Arc::new(app::build_services(pipeline, ApiConfig::from_env()).await?);
    let router = app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    // Joins worker threads, which may be mid-build.
    tokio::task::spawn_blocking(move || services.shutdown()).await?;
    Ok(())
}
