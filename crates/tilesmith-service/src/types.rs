//! Requests accepted by the pipelines.
use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The coordinate of a tile in a `z/x/y` pyramid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Selects a registered generator and carries its raw parameters.
///
/// On the wire this is a single-entry object, `{"<type>": {<params>}}`. The parameters are
/// only parsed into the generator's typed configuration when the generator is constructed.
#[derive(Clone, Debug, PartialEq)]
pub struct GeneratorSpec {
    pub id: String,
    pub params: Value,
}

impl GeneratorSpec {
    pub fn new(id: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            params,
        }
    }
}

impl Serialize for GeneratorSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.id, &self.params)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for GeneratorSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, Value>::deserialize(deserializer)?;
        if map.len() != 1 {
            return Err(de::Error::invalid_length(
                map.len(),
                &"an object with exactly one generator type",
            ));
        }
        let Some((id, params)) = map.into_iter().next() else {
            return Err(de::Error::custom("missing generator type"));
        };
        Ok(Self { id, params })
    }
}

/// A request for a single tile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TileRequest {
    /// The dataset the tile is computed from.
    pub uri: String,
    pub coord: TileCoord,
    /// The tile generator and its parameters.
    pub tile: GeneratorSpec,
    /// An optional backend query narrowing the dataset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Value>,
}

/// A request for the metadata of a dataset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetaRequest {
    /// The dataset the metadata is computed from.
    pub uri: String,
    /// The meta generator and its parameters.
    pub meta: GeneratorSpec,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_tile_request() {
        let request: TileRequest = serde_json::from_value(json!({
            "uri": "twitter/2016",
            "coord": {"z": 4, "x": 3, "y": 9},
            "tile": {"rest": {"endpoint": "localhost:8080"}},
        }))
        .unwrap();

        assert_eq!(request.coord, TileCoord::new(4, 3, 9));
        assert_eq!(request.tile.id, "rest");
        assert_eq!(request.tile.params, json!({"endpoint": "localhost:8080"}));
        assert_eq!(request.query, None);
    }

    #[test]
    fn test_generator_spec_needs_one_type() {
        let result = serde_json::from_value::<GeneratorSpec>(json!({
            "rest": {},
            "heatmap": {},
        }));
        assert!(result.is_err());

        let result = serde_json::from_value::<GeneratorSpec>(json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn test_generator_spec_wire_shape() {
        let spec = GeneratorSpec::new("count", json!({"field": "timestamp"}));
        assert_eq!(
            serde_json::to_value(&spec).unwrap(),
            json!({"count": {"field": "timestamp"}})
        );
    }
}
