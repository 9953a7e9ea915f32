use std::cmp::Ordering;
use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::{MetaRequest, TileRequest};

use super::Compression;

/// Identifies one unit of work, both for coalescing and for the cache store.
///
/// The key is the SHA-256 hash of a human-readable, stable rendering of the request. JSON
/// parameters and queries are rendered with their object keys in sorted order, so logically
/// identical requests always produce the same key.
#[derive(Debug, Clone)]
pub struct RequestKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl RequestKey {
    /// Creates the key for a tile request stored with `compression`.
    pub fn for_tile(request: &TileRequest, compression: Compression) -> Self {
        let mut builder = Self::builder("tile");
        builder
            .field("uri", &request.uri)
            .field("coord", request.coord)
            .field("type", &request.tile.id)
            .field("params", &request.tile.params);
        if let Some(ref query) = request.query {
            builder.field("query", query);
        }
        builder.field("compression", compression);
        builder.build()
    }

    /// Creates the key for a meta request stored with `compression`.
    pub fn for_meta(request: &MetaRequest, compression: Compression) -> Self {
        let mut builder = Self::builder("meta");
        builder
            .field("uri", &request.uri)
            .field("type", &request.meta.id)
            .field("params", &request.meta.params)
            .field("compression", compression);
        builder.build()
    }

    /// Creates a [`RequestKeyBuilder`] for a custom kind of request.
    pub fn builder(kind: &str) -> RequestKeyBuilder {
        let mut builder = RequestKeyBuilder {
            metadata: String::new(),
        };
        builder.field("kind", kind);
        builder
    }

    /// Returns the human-readable metadata that forms the basis of the [`RequestKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this key inside a cache directory.
    ///
    /// The relative path is the hex-formatted hash, split like so: `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            let _ = write!(path, "{b:02x}");
        }
        path.push('/');
        for b in &self.hash[4..] {
            let _ = write!(path, "{b:02x}");
        }
        path
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for RequestKey {}

impl std::hash::Hash for RequestKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl PartialOrd for RequestKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RequestKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash.cmp(&other.hash)
    }
}

/// A builder for [`RequestKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
pub struct RequestKeyBuilder {
    metadata: String,
}

impl RequestKeyBuilder {
    /// Appends a `name: value` line.
    pub fn field(&mut self, name: &str, value: impl fmt::Display) -> &mut Self {
        let _ = writeln!(self.metadata, "{name}: {value}");
        self
    }

    /// Finalize the [`RequestKey`].
    pub fn build(self) -> RequestKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        RequestKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for RequestKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
