//! Durable storage of generated payloads.
//!
//! # How the cache is used
//!
//! Every tile and meta request is turned into a [`RequestKey`], the SHA-256 hash of a stable,
//! human readable rendering of the request (see [`RequestKey::metadata`]). The
//! [`Compression`] scheme a pipeline is configured with is part of that rendering, so payloads
//! written with one scheme are never handed out to a pipeline configured with another.
//!
//! The pipeline first asks the [`Store`] whether an entry exists for the key. On a miss, the
//! payload is generated (with concurrent requests for the same key coalesced into a single
//! computation), compressed, and written back to the store. Reading a cached entry decompresses
//! it again.
//!
//! # Stores
//!
//! Two [`Store`] implementations exist:
//!
//! - [`MemoryStore`] keeps payloads in a byte-weighted in-memory cache with an optional time to
//!   live. This is the default and suits single instances.
//! - [`FilesystemStore`] writes each payload into a file at [`RequestKey::cache_path`] inside a
//!   cache directory, using a temporary file and an atomic rename.
//!
//! Stores hand out scoped [`Connection`]s which are released when dropped.
//!
//! # Failure handling
//!
//! The store is a cache, not the source of truth for a computation. A failure to check or read
//! an entry is logged and treated like a miss, and a failure to write an entry is logged while
//! the generated payload is still returned to all waiters.

mod cache_key;
mod compression;
mod fs;
mod memory;
mod store;

pub use cache_key::{RequestKey, RequestKeyBuilder};
pub use compression::Compression;
pub use fs::FilesystemStore;
pub use memory::MemoryStore;
pub use store::{Connection, Store, StoreError};
