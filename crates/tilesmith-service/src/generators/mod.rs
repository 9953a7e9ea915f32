//! Built-in generators.

use std::time::Duration;

use serde::Deserialize;

use crate::registry::Registry;

mod rest;

pub use rest::{RestBatchFactory, RestParams, RestTile};

/// Settings of the HTTP client used by the `rest` generators.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RestConfig {
    /// The timeout for establishing a connection to a tile server.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// The timeout for fetching a single tile.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Creates the [`reqwest::Client`] shared by all `rest` generators of a pipeline.
pub fn create_client(config: &RestConfig) -> anyhow::Result<reqwest::Client> {
    let client = reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()?;
    Ok(client)
}

/// Registers the built-in generators:
///
/// - `rest`: a single-tile generator fetching tiles from a tile server.
/// - `rest-batch`: a batch factory fetching whole batches of tiles from tile servers.
pub fn register_defaults(registry: &mut Registry, client: reqwest::Client) {
    let tile_client = client.clone();
    registry.register_tile("rest", move |params: RestParams| {
        RestTile::new(tile_client.clone(), params)
    });
    registry.register_factory("rest-batch", move || Ok(RestBatchFactory::new(client.clone())));
}

/// Creates a [`Registry`] holding the built-in generators.
pub fn default_registry(config: &RestConfig) -> anyhow::Result<Registry> {
    let mut registry = Registry::new();
    register_defaults(&mut registry, create_client(config)?);
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::types::GeneratorSpec;

    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = default_registry(&RestConfig::default()).unwrap();

        assert!(registry.is_batched("rest-batch"));
        assert!(!registry.is_batched("rest"));
        assert!(registry.factory("rest-batch").is_ok());

        let spec = GeneratorSpec::new("rest", json!({"endpoint": "localhost:8080"}));
        assert!(registry.tile(&spec).is_ok());

        let spec = GeneratorSpec::new("rest", json!({"scheme": "https"}));
        assert!(registry.tile(&spec).is_err());
    }

    #[test]
    fn test_config() {
        let config: RestConfig = serde_yaml::from_str("timeout: 5s").unwrap();
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
    }
}
