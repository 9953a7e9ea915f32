use std::net::SocketAddr;

use anyhow::{Context, Result};
use tilesmith_service::config::Config;
use tilesmith_service::metric;
use tilesmith_service::service::TileService;

use crate::endpoints;

/// Creates all pipelines and serves them over HTTP on the configured address.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("tilesmith-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = runtime
        .block_on(async { TileService::create(&config) })
        .context("failed to create tile service")?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;
    tracing::info!("Starting HTTP server on {}", socket);

    let server =
        axum_server::bind(socket).serve(endpoints::create_app(service).into_make_service());
    runtime.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
