//! The set of configured pipelines.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;

use crate::caching::{FilesystemStore, MemoryStore, Store};
use crate::config::{CacheConfig, Config, PipelineConfig, StoreKind};
use crate::error::{TileError, TileResult};
use crate::generators;
use crate::pipeline::Pipeline;
use crate::registry::Registry;

/// Creates the store of pipeline `name`.
///
/// Pipelines never share a store: every pipeline gets its own in-memory cache, or its own
/// subdirectory of the cache directory.
fn create_store(name: &str, config: &Config) -> anyhow::Result<Arc<dyn Store>> {
    let CacheConfig {
        store,
        in_memory_capacity,
        time_to_live,
        ..
    } = config.cache;

    Ok(match store {
        StoreKind::Memory => Arc::new(MemoryStore::new(in_memory_capacity, time_to_live)),
        StoreKind::Filesystem => {
            let cache_dir = config
                .cache_dir(name)
                .context("the filesystem store requires a `cache_dir`")?;
            let store = FilesystemStore::new(&cache_dir).with_context(|| {
                format!("failed to create cache directory {}", cache_dir.display())
            })?;
            Arc::new(store)
        }
    })
}

/// All pipelines served by this instance, by name.
#[derive(Clone, Debug)]
pub struct TileService {
    pipelines: Arc<BTreeMap<String, Pipeline>>,
}

impl TileService {
    /// Creates all configured pipelines with the built-in generators.
    ///
    /// Must be called within a tokio runtime.
    pub fn create(config: &Config) -> anyhow::Result<Self> {
        Self::create_with(config, |pipeline| generators::default_registry(&pipeline.rest))
    }

    /// Creates all configured pipelines, sharing one generator `registry`.
    pub fn with_registry(config: &Config, registry: Arc<Registry>) -> anyhow::Result<Self> {
        Self::create_with(config, |_| Ok(Registry::clone(&registry)))
    }

    fn create_with<F>(config: &Config, mut make_registry: F) -> anyhow::Result<Self>
    where
        F: FnMut(&PipelineConfig) -> anyhow::Result<Registry>,
    {
        let mut pipelines = BTreeMap::new();
        for (name, pipeline_config) in &config.pipelines {
            pipeline_config
                .validate()
                .with_context(|| format!("invalid configuration of pipeline `{name}`"))?;
            let registry = make_registry(pipeline_config)
                .with_context(|| format!("failed to set up generators of pipeline `{name}`"))?;
            let store = create_store(name, config)
                .with_context(|| format!("failed to set up cache of pipeline `{name}`"))?;

            tracing::info!(
                pipeline = %name,
                compression = %pipeline_config.compression,
                max_concurrent = pipeline_config.max_concurrent,
                "creating pipeline"
            );
            let pipeline = Pipeline::new(name, pipeline_config, Arc::new(registry), store);
            pipelines.insert(name.clone(), pipeline);
        }

        Ok(Self {
            pipelines: Arc::new(pipelines),
        })
    }

    /// Returns the pipeline called `name`.
    pub fn pipeline(&self, name: &str) -> TileResult<&Pipeline> {
        self.pipelines
            .get(name)
            .ok_or_else(|| TileError::UnrecognizedType {
                kind: "pipeline",
                id: name.to_owned(),
            })
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.values()
    }
}
