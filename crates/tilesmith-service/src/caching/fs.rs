use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use super::{Connection, RequestKey, Store, StoreError};

/// A [`Store`] writing every payload into its own file below a cache directory.
///
/// Files are laid out by [`RequestKey::cache_path`]. New entries are written into a temporary
/// file next to their destination and atomically moved into place once complete, so readers
/// never observe partial payloads.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    /// Creates a store rooted at `root`, creating the directory if it does not exist.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &RequestKey) -> PathBuf {
        self.root.join(key.cache_path())
    }
}

#[async_trait]
impl Store for FilesystemStore {
    async fn connect(&self) -> Result<Box<dyn Connection>, StoreError> {
        if !fs::try_exists(&self.root).await? {
            return Err(StoreError::Connection(format!(
                "cache directory {} is gone",
                self.root.display()
            )));
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl Connection for FilesystemStore {
    async fn set(&self, key: &RequestKey, data: Bytes) -> Result<(), StoreError> {
        let path = self.path(key);
        let Some(parent_dir) = path.parent() else {
            return Err(StoreError::Connection(format!(
                "no parent directory for {}",
                path.display()
            )));
        };

        let temp_dir = self.root.join(".tmp");
        fs::create_dir_all(parent_dir).await?;
        fs::create_dir_all(&temp_dir).await?;

        let temp_file = NamedTempFile::new_in(&temp_dir)?;
        let mut dest = File::from_std(temp_file.reopen()?);
        dest.write_all(&data).await?;
        dest.flush().await?;

        temp_file.persist(&path).map_err(|err| err.error)?;
        tracing::trace!(path = %path.display(), "stored cache entry");
        metric!(time_raw("cache.fs.size") = data.len() as u64);
        Ok(())
    }

    async fn get(&self, key: &RequestKey) -> Result<Option<Bytes>, StoreError> {
        match fs::read(self.path(key)).await {
            Ok(data) => Ok(Some(data.into())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &RequestKey) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.path(key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> RequestKey {
        let mut builder = RequestKey::builder("test");
        builder.field("name", name);
        builder.build()
    }

    #[tokio::test]
    async fn test_set_get_exists() {
        tilesmith_test::setup();
        let cache_dir = tilesmith_test::tempdir();

        let store = FilesystemStore::new(cache_dir.path().join("tiles")).unwrap();
        let conn = store.connect().await.unwrap();

        let key = key("a");
        assert!(!conn.exists(&key).await.unwrap());
        assert_eq!(conn.get(&key).await.unwrap(), None);

        conn.set(&key, Bytes::from_static(b"tile")).await.unwrap();
        assert!(conn.exists(&key).await.unwrap());
        assert_eq!(
            conn.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"tile"))
        );

        let on_disk = store.root().join(key.cache_path());
        assert_eq!(std::fs::read(on_disk).unwrap(), b"tile");
    }

    #[tokio::test]
    async fn test_overwrite() {
        tilesmith_test::setup();
        let cache_dir = tilesmith_test::tempdir();

        let store = FilesystemStore::new(cache_dir.path()).unwrap();
        let conn = store.connect().await.unwrap();

        conn.set(&key("a"), Bytes::from_static(b"old")).await.unwrap();
        conn.set(&key("a"), Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(
            conn.get(&key("a")).await.unwrap(),
            Some(Bytes::from_static(b"new"))
        );
    }

    #[tokio::test]
    async fn test_removed_directory_fails_to_connect() {
        tilesmith_test::setup();
        let cache_dir = tilesmith_test::tempdir();

        let store = FilesystemStore::new(cache_dir.path().join("tiles")).unwrap();
        std::fs::remove_dir_all(store.root()).unwrap();

        assert!(matches!(
            store.connect().await,
            Err(StoreError::Connection(_))
        ));
    }
}
