//! The cache-integrated generation pipeline.
//!
//! A [`Pipeline`] ties together the generator [`Registry`], the cache [`Store`], request
//! coalescing, the [`DispatchQueue`] for single tiles and metadata, and the [`BatchCollector`]
//! for batched tile types.
//!
//! Generating an item works as follows:
//!
//! 1. The request is turned into a [`RequestKey`] which includes the pipeline's compression.
//! 2. If the store already holds an entry for the key, there is nothing to do.
//! 3. Otherwise the request joins the in-flight computation for its key, or starts one. A new
//!    computation is spawned as its own task, so it runs to completion even if every caller
//!    stops waiting for it.
//! 4. The computation runs the request through the dispatch queue or the batch collector,
//!    compresses the result, writes it to the store, and finally resolves all waiters with the
//!    uncompressed payload.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::batch::BatchCollector;
use crate::caching::{Compression, RequestKey, Store, StoreError};
use crate::coalesce::PromiseRegistry;
use crate::config::PipelineConfig;
use crate::dispatch::DispatchQueue;
use crate::error::{TileError, TileResult};
use crate::registry::Registry;
use crate::types::{MetaRequest, TileRequest};

/// The work of a single coalesced computation.
enum Job {
    Tile(TileRequest),
    Meta(MetaRequest),
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Tile(_) => "tile",
            Job::Meta(_) => "meta",
        }
    }
}

struct PipelineInner {
    name: String,
    compression: Compression,
    max_wait: Duration,
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    dispatch: DispatchQueue,
    batches: BatchCollector,
    tiles: PromiseRegistry<RequestKey, TileResult>,
    metas: PromiseRegistry<RequestKey, TileResult>,
    ticker: JoinHandle<()>,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

/// Generates, caches and serves tiles and metadata.
///
/// Cloning a pipeline is cheap and yields a handle to the same pipeline.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Creates a pipeline and starts its batch ticker.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        config: &PipelineConfig,
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
    ) -> Self {
        let name = name.into();
        let batches = BatchCollector::new(Arc::clone(&registry));
        let ticker = batches.start(config.batch.poll_interval);

        let inner = PipelineInner {
            dispatch: DispatchQueue::new(&name, config.max_concurrent, config.queue_length),
            name,
            compression: config.compression,
            max_wait: config.batch.max_wait,
            registry,
            store,
            batches,
            tiles: PromiseRegistry::new("tiles"),
            metas: PromiseRegistry::new("metas"),
            ticker,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn compression(&self) -> Compression {
        self.inner.compression
    }

    /// The queue admitting single-tile and meta computations.
    pub fn dispatch(&self) -> &DispatchQueue {
        &self.inner.dispatch
    }

    /// Makes sure the tile is in the cache, generating it if necessary.
    pub async fn generate_tile(&self, request: &TileRequest) -> TileResult<()> {
        let key = RequestKey::for_tile(request, self.inner.compression);
        if self.inner.is_cached(&key, "tile").await {
            return Ok(());
        }
        self.compute(key, Job::Tile(request.clone())).await?;
        Ok(())
    }

    /// Returns the cached tile, failing with [`TileError::NotCached`] if it was never generated.
    pub async fn fetch_tile(&self, request: &TileRequest) -> TileResult {
        let key = RequestKey::for_tile(request, self.inner.compression);
        self.inner.fetch(&key).await
    }

    /// Returns the tile, from the cache or freshly generated.
    pub async fn get_tile(&self, request: &TileRequest) -> TileResult {
        let key = RequestKey::for_tile(request, self.inner.compression);
        if let Some(tile) = self.inner.lookup(&key, "tile").await {
            return Ok(tile);
        }
        self.compute(key, Job::Tile(request.clone())).await
    }

    /// Makes sure the metadata is in the cache, generating it if necessary.
    pub async fn generate_meta(&self, request: &MetaRequest) -> TileResult<()> {
        let key = RequestKey::for_meta(request, self.inner.compression);
        if self.inner.is_cached(&key, "meta").await {
            return Ok(());
        }
        self.compute(key, Job::Meta(request.clone())).await?;
        Ok(())
    }

    /// Returns the cached metadata, failing with [`TileError::NotCached`] if it was never
    /// generated.
    pub async fn fetch_meta(&self, request: &MetaRequest) -> TileResult {
        let key = RequestKey::for_meta(request, self.inner.compression);
        self.inner.fetch(&key).await
    }

    /// Returns the metadata, from the cache or freshly generated.
    pub async fn get_meta(&self, request: &MetaRequest) -> TileResult {
        let key = RequestKey::for_meta(request, self.inner.compression);
        if let Some(meta) = self.inner.lookup(&key, "meta").await {
            return Ok(meta);
        }
        self.compute(key, Job::Meta(request.clone())).await
    }

    /// Joins the computation for `key`, spawning it if none is in flight.
    async fn compute(&self, key: RequestKey, job: Job) -> TileResult {
        let promises = match job {
            Job::Tile(_) => &self.inner.tiles,
            Job::Meta(_) => &self.inner.metas,
        };

        let (promise, resolver) = promises.get_or_create(key.clone());
        if let Some(resolver) = resolver {
            let inner = Arc::clone(&self.inner);
            let span = tracing::info_span!(
                "compute",
                pipeline = %inner.name,
                kind = job.kind(),
                key = %key,
            );
            tokio::spawn(
                async move {
                    let result = inner.run(&key, job).await;
                    resolver.resolve(result);
                }
                .instrument(span),
            );
        }

        promise.wait().await.unwrap_or(Err(TileError::Abandoned))
    }
}

impl PipelineInner {
    /// Generates, compresses and stores the payload of `job`.
    async fn run(&self, key: &RequestKey, job: Job) -> TileResult {
        let kind = job.kind();
        let started = Instant::now();

        let result = match job {
            Job::Tile(request) if self.registry.is_batched(&request.tile.id) => {
                self.batches.enqueue(request, self.max_wait).await
            }
            Job::Tile(request) => match self.registry.tile(&request.tile) {
                Ok(generator) => {
                    let generate = async move { generator.create(&request).await };
                    self.dispatch.submit(generate).await.unwrap_or_else(|err| Err(err.into()))
                }
                Err(err) => Err(err),
            },
            Job::Meta(request) => match self.registry.meta(&request.meta) {
                Ok(generator) => {
                    let generate = async move { generator.create(&request.uri).await };
                    self.dispatch.submit(generate).await.unwrap_or_else(|err| Err(err.into()))
                }
                Err(err) => Err(err),
            },
        };

        metric!(
            timer("generation.duration") = started.elapsed(),
            "pipeline" => &self.name,
            "kind" => kind,
            "status" => if result.is_ok() { "ok" } else { "error" },
        );

        let data = result.inspect_err(|err| {
            tracing::debug!(error = %err, "generation failed");
        })?;
        self.store(key, &data).await;
        Ok(data)
    }

    /// Compresses and writes `data` to the store.
    ///
    /// Failures are logged and otherwise ignored.
    async fn store(&self, key: &RequestKey, data: &[u8]) {
        let compressed = match self.compression.compress(data) {
            Ok(compressed) => compressed,
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::error!(error = dynerr, "failed to compress payload");
                return;
            }
        };

        let written = async {
            let connection = self.store.connect().await?;
            connection.set(key, compressed).await
        };
        if let Err(err) = written.await {
            self.store_error(err, "failed to store payload");
        }
    }

    async fn is_cached(&self, key: &RequestKey, kind: &'static str) -> bool {
        let exists = async {
            let connection = self.store.connect().await?;
            connection.exists(key).await
        };
        let cached = match exists.await {
            Ok(exists) => exists,
            Err(err) => {
                self.store_error(err, "failed to check cache");
                false
            }
        };
        self.record_lookup(kind, cached);
        cached
    }

    /// Reads and decompresses the cached entry for `key`, treating store failures as misses.
    async fn lookup(&self, key: &RequestKey, kind: &'static str) -> Option<Bytes> {
        let entry = match self.read(key).await {
            Ok(entry) => entry,
            Err(err) => {
                self.store_error(err, "failed to read cache");
                None
            }
        };

        let data = entry.and_then(|compressed| match self.compression.decompress(&compressed) {
            Ok(data) => Some(data),
            Err(err) => {
                let dynerr: &dyn std::error::Error = &err;
                tracing::warn!(error = dynerr, "discarding corrupt cache entry");
                None
            }
        });

        self.record_lookup(kind, data.is_some());
        data
    }

    async fn fetch(&self, key: &RequestKey) -> TileResult {
        let compressed = match self.read(key).await {
            Ok(Some(compressed)) => compressed,
            Ok(None) => return Err(TileError::NotCached),
            Err(err) => {
                self.store_error(err, "failed to read cache");
                return Err(TileError::NotCached);
            }
        };
        self.compression
            .decompress(&compressed)
            .map_err(TileError::from_store_error)
    }

    async fn read(&self, key: &RequestKey) -> Result<Option<Bytes>, StoreError> {
        let connection = self.store.connect().await?;
        connection.get(key).await
    }

    fn record_lookup(&self, kind: &'static str, hit: bool) {
        if hit {
            metric!(counter("cache.hit") += 1, "pipeline" => &self.name, "kind" => kind);
        } else {
            metric!(counter("cache.miss") += 1, "pipeline" => &self.name, "kind" => kind);
        }
    }

    fn store_error(&self, err: StoreError, message: &str) {
        metric!(counter("cache.store.error") += 1, "pipeline" => &self.name);
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, pipeline = %self.name, "{message}");
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.inner.name)
            .field("compression", &self.inner.compression)
            .field("store", &self.inner.store)
            .field("dispatch", &self.inner.dispatch)
            .field("batches", &self.inner.batches)
            .finish()
    }
}
