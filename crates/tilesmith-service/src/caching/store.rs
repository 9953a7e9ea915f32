use std::fmt;
use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::RequestKey;

/// An error raised by a cache store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed")]
    Io(#[from] io::Error),
    #[error("store connection failed: {0}")]
    Connection(String),
}

/// A durable byte store holding compressed payloads.
///
/// Work is done through short-lived [`Connection`]s. A connection is released when it is
/// dropped, so every operation acquires one in the scope that needs it.
#[async_trait]
pub trait Store: Send + Sync + fmt::Debug + 'static {
    /// Acquires a connection to the store.
    async fn connect(&self) -> Result<Box<dyn Connection>, StoreError>;
}

/// An acquired connection to a [`Store`].
///
/// Implementations must support concurrent use of separate connections for the same key.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Writes `data` under `key`, replacing an existing entry.
    async fn set(&self, key: &RequestKey, data: Bytes) -> Result<(), StoreError>;

    /// Reads the entry stored under `key`, if any.
    async fn get(&self, key: &RequestKey) -> Result<Option<Bytes>, StoreError>;

    /// Checks whether an entry is stored under `key`.
    async fn exists(&self, key: &RequestKey) -> Result<bool, StoreError>;
}
