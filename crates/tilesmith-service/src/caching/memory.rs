use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{Connection, RequestKey, Store, StoreError};

type InMemoryCache = moka::future::Cache<RequestKey, Bytes>;

/// A [`Store`] keeping payloads in a size-bounded in-memory cache.
///
/// The capacity is measured in bytes of stored payload. Once it is reached, the least
/// recently used entries are evicted.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    cache: InMemoryCache,
}

impl MemoryStore {
    /// Creates a store holding up to `capacity` bytes, evicting entries after `time_to_live`.
    pub fn new(capacity: u64, time_to_live: Option<Duration>) -> Self {
        let mut builder = InMemoryCache::builder()
            .max_capacity(capacity)
            .weigher(|_key, data: &Bytes| data.len().try_into().unwrap_or(u32::MAX));
        if let Some(ttl) = time_to_live {
            builder = builder.time_to_live(ttl);
        }
        Self {
            cache: builder.build(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn Connection>, StoreError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl Connection for MemoryStore {
    async fn set(&self, key: &RequestKey, data: Bytes) -> Result<(), StoreError> {
        self.cache.insert(key.clone(), data).await;
        Ok(())
    }

    async fn get(&self, key: &RequestKey) -> Result<Option<Bytes>, StoreError> {
        Ok(self.cache.get(key).await)
    }

    async fn exists(&self, key: &RequestKey) -> Result<bool, StoreError> {
        Ok(self.cache.contains_key(key))
    }
}
