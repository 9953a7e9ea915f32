use std::path::PathBuf;

use anyhow::Result;
use tilesmith_service::bulk;
use tilesmith_service::config::Config;
use tilesmith_service::metric;
use url::Url;

/// Sends the documents of all `files` to the bulk endpoint at `target`.
///
/// Runs `ingest.equalizer_pool_size` workers, sending payloads of `ingest.batch_size` documents.
pub fn run(config: Config, target: Url, files: Vec<PathBuf>) -> Result<()> {
    metric!(counter("ingest.starting") += 1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("tilesmith-ingest")
        .enable_all()
        .build()?;

    tracing::info!(%target, files = files.len(), "Starting ingestion");
    let summary = runtime.block_on(bulk::ingest_files(&config.ingest, target, &files))?;
    tracing::info!(
        files = summary.items,
        bytes = summary.bytes,
        "Ingestion complete"
    );

    Ok(())
}
