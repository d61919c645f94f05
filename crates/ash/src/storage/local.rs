//! Filesystem-backed object store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{ObjectStore, StorageError, StorageResult};

/// Object store rooted at a local directory. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let rel = Path::new(key);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StorageError::Backend(format!("unsafe key: {key}")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("pfx/sess-1.tar.gz", b"payload").await.unwrap();
        assert_eq!(store.get("pfx/sess-1.tar.gz").await.unwrap(), b"payload");
        assert!(store.exists("pfx/sess-1.tar.gz").await.unwrap());

        store.delete("pfx/sess-1.tar.gz").await.unwrap();
        assert!(!store.exists("pfx/sess-1.tar.gz").await.unwrap());
        // Deleting again is a no-op.
        store.delete("pfx/sess-1.tar.gz").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.get("../escape").await.is_err());
        assert!(store.put("/abs", b"x").await.is_err());
    }
}
