use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tokio::sync::Semaphore;
use tracing::level_filters::LevelFilter;

use crate::caching::Compression;
use crate::dispatch::{DEFAULT_MAX_CONCURRENT, DEFAULT_QUEUE_LENGTH};
use crate::generators::RestConfig;
use crate::ingest::IngestConfig;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the server.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "tilesmith".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The kind of store generated payloads are cached in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// A bounded in-memory cache, lost on restart.
    #[default]
    Memory,
    /// One file per payload below `cache_dir`.
    Filesystem,
}

/// Controls where generated payloads are cached.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    pub store: StoreKind,

    /// The directory for the `filesystem` store.
    ///
    /// Every pipeline caches into its own subdirectory.
    pub cache_dir: Option<PathBuf>,

    /// Capacity (in bytes) of the `memory` store of each pipeline.
    ///
    /// The in-memory size limit is a best-effort approximation, and not an exact limit.
    ///
    /// Defaults to `256 MiB (= 268_435_456)`.
    pub in_memory_capacity: u64,

    /// The time after which entries of the `memory` store expire. Defaults to never.
    #[serde(with = "humantime_serde")]
    pub time_to_live: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            cache_dir: None,
            in_memory_capacity: 256 * 1024 * 1024,
            time_to_live: None,
        }
    }
}

/// Controls how tiles of batched types are collected.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BatchConfig {
    /// How often the batch pool is checked for due requests.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long a request may wait in the pool before it is dispatched.
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_millis(500),
        }
    }
}

/// Configuration of a single tile pipeline.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// How payloads are compressed in the cache store.
    pub compression: Compression,
    /// The number of single-tile and meta computations running at once.
    pub max_concurrent: usize,
    /// The number of computations allowed to wait for a free slot.
    pub queue_length: usize,
    pub batch: BatchConfig,
    /// Settings of the `rest` generators.
    pub rest: RestConfig,
}

impl PipelineConfig {
    /// Checks the limits that would otherwise stall or crash the pipeline at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.batch.poll_interval.is_zero() {
            anyhow::bail!("`batch.poll_interval` must be greater than zero");
        }
        if !(1..=Semaphore::MAX_PERMITS).contains(&self.max_concurrent) {
            anyhow::bail!(
                "`max_concurrent` must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_concurrent
            );
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            queue_length: DEFAULT_QUEUE_LENGTH,
            batch: BatchConfig::default(),
            rest: RestConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Where generated payloads are cached.
    pub cache: CacheConfig,

    /// The tile pipelines served, by name.
    pub pipelines: BTreeMap<String, PipelineConfig>,

    /// Configuration of bulk ingestion.
    pub ingest: IngestConfig,
}

impl Config {
    /// Returns the cache directory of pipeline `name`, if a cache directory is configured.
    pub fn cache_dir(&self, name: &str) -> Option<PathBuf> {
        self.cache.cache_dir.as_ref().map(|base| base.join(name))
    }
}

/// Checks if we are running in docker.
fn is_docker() -> bool {
    if fs::metadata("/.dockerenv").is_ok() {
        return true;
    }

    fs::read_to_string("/proc/self/cgroup")
        .map(|s| s.contains("/docker"))
        .unwrap_or(false)
}

/// Default value for the "bind" configuration.
fn default_bind() -> String {
    if is_docker() {
        // Docker images rely on this service being exposed
        "0.0.0.0:3030".to_owned()
    } else {
        "127.0.0.1:3030".to_owned()
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut pipelines = BTreeMap::new();
        pipelines.insert("default".to_owned(), PipelineConfig::default());

        Config {
            bind: default_bind(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            cache: CacheConfig::default(),
            pipelines,
            ingest: IngestConfig::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
