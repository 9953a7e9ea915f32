//! Concurrent bulk ingestion through a shared [`Equalizer`].

use std::future::Future;

use futures::{StreamExt, stream};
use serde::Deserialize;

use crate::equalizer::{BulkSink, Equalizer};

/// Ingestion settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    /// The number of concurrent workers, which is also the number of bulk payloads in flight.
    pub equalizer_pool_size: usize,
    /// The number of documents in a single bulk payload.
    pub batch_size: usize,
}

impl IngestConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.batch_size > 0, "`batch_size` must be greater than zero");
        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            equalizer_pool_size: 8,
            batch_size: 40_000,
        }
    }
}

/// A unit of work for the [`IngestPool`], usually a single input file.
pub trait IngestItem: Send + 'static {
    /// The number of bytes this item contributes to the ingestion progress.
    fn size(&self) -> u64;
}

/// What an [`IngestPool::execute`] run processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub items: usize,
    pub bytes: u64,
}

/// Spreads ingestion work across a fixed number of workers.
#[derive(Clone, Debug)]
pub struct IngestPool {
    size: usize,
}

impl IngestPool {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(config.equalizer_pool_size)
    }

    /// Runs `worker` on every item, at most `size` at a time.
    ///
    /// All workers send their payloads through one [`Equalizer`] of the same size in front of
    /// `sink`. The first failing worker stops the run: remaining items are skipped, and its
    /// error is returned once all payloads already handed to the equalizer are done.
    pub async fn execute<T, S, W, F>(
        &self,
        items: Vec<T>,
        sink: S,
        worker: W,
    ) -> anyhow::Result<IngestSummary>
    where
        T: IngestItem,
        S: BulkSink,
        W: Fn(T, Equalizer<S>) -> F,
        F: Future<Output = anyhow::Result<()>>,
    {
        let equalizer = Equalizer::listen(sink, self.size);
        let total_bytes: u64 = items.iter().map(IngestItem::size).sum();
        let total_items = items.len();

        tracing::info!(
            items = total_items,
            bytes = total_bytes,
            workers = self.size,
            "starting ingestion"
        );

        let mut results = stream::iter(items)
            .map(|item| {
                let size = item.size();
                let work = worker(item, equalizer.clone());
                async move { work.await.map(|()| size) }
            })
            .buffer_unordered(self.size);

        let mut summary = IngestSummary::default();
        let mut outcome = Ok(());
        while let Some(result) = results.next().await {
            match result {
                Ok(size) => {
                    summary.items += 1;
                    summary.bytes += size;
                    log_progress(summary.bytes, total_bytes);
                }
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            }
        }
        drop(results);

        equalizer.close().await;

        match outcome {
            Ok(()) => {
                tracing::info!(items = summary.items, bytes = summary.bytes, "ingestion finished");
                Ok(summary)
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    processed = summary.items,
                    remaining = total_items - summary.items,
                    "ingestion aborted"
                );
                Err(err)
            }
        }
    }
}

fn log_progress(processed: u64, total: u64) {
    let percent = if total == 0 {
        100.0
    } else {
        processed as f64 * 100.0 / total as f64
    };
    tracing::info!(processed, total, "ingested {percent:.2}%");
}
