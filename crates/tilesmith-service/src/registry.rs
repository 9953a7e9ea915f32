//! Generator registration.
//!
//! Generators are registered by type id together with a constructor taking their typed
//! parameters. The raw JSON parameters of a request are parsed into those types exactly once,
//! when the generator is constructed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{TileError, TileResult};
use crate::types::{GeneratorSpec, TileRequest};

/// Produces the payload of a single tile.
#[async_trait]
pub trait TileGenerator: Send + Sync {
    async fn create(&self, request: &TileRequest) -> TileResult;
}

/// Produces the metadata payload of a dataset.
#[async_trait]
pub trait MetaGenerator: Send + Sync {
    async fn create(&self, uri: &str) -> TileResult;
}

/// Produces the payloads of a whole batch of tiles at once.
///
/// A factory is constructed fresh for every batch. It receives the requests of its group in
/// arrival order and must return one result per request, in the same order.
#[async_trait]
pub trait TileFactory: Send + Sync {
    async fn create_tiles(&self, requests: &[TileRequest]) -> Vec<TileResult>;
}

type TileConstructor = Arc<dyn Fn(&Value) -> TileResult<Box<dyn TileGenerator>> + Send + Sync>;
type MetaConstructor = Arc<dyn Fn(&Value) -> TileResult<Box<dyn MetaGenerator>> + Send + Sync>;
type FactoryConstructor = Arc<dyn Fn() -> TileResult<Box<dyn TileFactory>> + Send + Sync>;

/// Parses generator parameters, reporting failures as invalid requests.
fn parse_params<P: DeserializeOwned>(id: &str, params: &Value) -> TileResult<P> {
    P::deserialize(params)
        .map_err(|err| TileError::InvalidRequest(format!("invalid `{id}` parameters: {err}")))
}

/// Maps generator type ids to their constructors.
#[derive(Clone, Default)]
pub struct Registry {
    tiles: BTreeMap<String, TileConstructor>,
    metas: BTreeMap<String, MetaConstructor>,
    factories: BTreeMap<String, FactoryConstructor>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tile generator constructed from parameters of type `P`.
    pub fn register_tile<P, G, F>(&mut self, id: &str, constructor: F) -> &mut Self
    where
        P: DeserializeOwned,
        G: TileGenerator + 'static,
        F: Fn(P) -> anyhow::Result<G> + Send + Sync + 'static,
    {
        let type_id = id.to_owned();
        let constructor: TileConstructor = Arc::new(move |params| {
            let params = parse_params(&type_id, params)?;
            let generator =
                constructor(params).map_err(|err| TileError::constructor(&type_id, err))?;
            Ok(Box::new(generator))
        });
        self.tiles.insert(id.to_owned(), constructor);
        self
    }

    /// Registers a meta generator constructed from parameters of type `P`.
    pub fn register_meta<P, G, F>(&mut self, id: &str, constructor: F) -> &mut Self
    where
        P: DeserializeOwned,
        G: MetaGenerator + 'static,
        F: Fn(P) -> anyhow::Result<G> + Send + Sync + 'static,
    {
        let type_id = id.to_owned();
        let constructor: MetaConstructor = Arc::new(move |params| {
            let params = parse_params(&type_id, params)?;
            let generator =
                constructor(params).map_err(|err| TileError::constructor(&type_id, err))?;
            Ok(Box::new(generator))
        });
        self.metas.insert(id.to_owned(), constructor);
        self
    }

    /// Registers a batch tile factory.
    ///
    /// Tile requests naming `id` are collected into batches instead of being generated one by
    /// one, even if a single-tile generator with the same id exists.
    pub fn register_factory<T, F>(&mut self, id: &str, constructor: F) -> &mut Self
    where
        T: TileFactory + 'static,
        F: Fn() -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let type_id = id.to_owned();
        let constructor: FactoryConstructor = Arc::new(move || {
            let factory = constructor().map_err(|err| TileError::constructor(&type_id, err))?;
            Ok(Box::new(factory))
        });
        self.factories.insert(id.to_owned(), constructor);
        self
    }

    /// Constructs the single-tile generator named by `spec`.
    pub fn tile(&self, spec: &GeneratorSpec) -> TileResult<Box<dyn TileGenerator>> {
        let constructor = self
            .tiles
            .get(&spec.id)
            .ok_or_else(|| TileError::UnrecognizedType {
                kind: "tile",
                id: spec.id.clone(),
            })?;
        constructor(&spec.params)
    }

    /// Constructs the meta generator named by `spec`.
    pub fn meta(&self, spec: &GeneratorSpec) -> TileResult<Box<dyn MetaGenerator>> {
        let constructor = self
            .metas
            .get(&spec.id)
            .ok_or_else(|| TileError::UnrecognizedType {
                kind: "meta",
                id: spec.id.clone(),
            })?;
        constructor(&spec.params)
    }

    /// Constructs a fresh batch factory for `id`.
    pub fn factory(&self, id: &str) -> TileResult<Box<dyn TileFactory>> {
        let constructor = self
            .factories
            .get(id)
            .ok_or_else(|| TileError::UnrecognizedType {
                kind: "tile factory",
                id: id.to_owned(),
            })?;
        constructor()
    }

    /// Whether tiles of type `id` are generated in batches.
    pub fn is_batched(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("tiles", &self.tiles.keys().collect::<Vec<_>>())
            .field("metas", &self.metas.keys().collect::<Vec<_>>())
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Parameters of generators that take none.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct NoParams {}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;

    use crate::types::TileCoord;

    use super::*;

    #[derive(Deserialize)]
    struct FillParams {
        value: u8,
        #[serde(default = "default_size")]
        size: usize,
    }

    fn default_size() -> usize {
        4
    }

    struct Fill(FillParams);

    #[async_trait]
    impl TileGenerator for Fill {
        async fn create(&self, _request: &TileRequest) -> TileResult {
            Ok(Bytes::from(vec![self.0.value; self.0.size]))
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_tile("fill", |params: FillParams| {
            anyhow::ensure!(params.size <= 64, "tiles are at most 64 bytes");
            Ok(Fill(params))
        });
        registry
    }

    fn request(tile: GeneratorSpec) -> TileRequest {
        TileRequest {
            uri: "dataset".into(),
            coord: TileCoord::new(0, 0, 0),
            tile,
            query: None,
        }
    }

    #[tokio::test]
    async fn test_typed_params() {
        let registry = registry();
        let spec = GeneratorSpec::new("fill", json!({"value": 7}));

        let generator = registry.tile(&spec).unwrap();
        let tile = generator.create(&request(spec)).await.unwrap();
        assert_eq!(&tile[..], &[7, 7, 7, 7]);
    }

    #[test]
    fn test_lookup_errors() {
        let registry = registry();

        let err = registry
            .tile(&GeneratorSpec::new("heatmap", json!({})))
            .err()
            .unwrap();
        assert_eq!(
            err,
            TileError::UnrecognizedType {
                kind: "tile",
                id: "heatmap".into()
            }
        );

        let err = registry
            .tile(&GeneratorSpec::new("fill", json!({"value": "seven"})))
            .err()
            .unwrap();
        assert!(matches!(err, TileError::InvalidRequest(_)), "{err:?}");

        let err = registry
            .tile(&GeneratorSpec::new("fill", json!({"value": 1, "size": 128})))
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "error constructing fill: tiles are at most 64 bytes"
        );

        assert!(matches!(
            registry.factory("fill").err().unwrap(),
            TileError::UnrecognizedType { .. }
        ));
        assert!(!registry.is_batched("fill"));
    }
}
