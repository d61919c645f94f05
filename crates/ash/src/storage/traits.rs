//! Object-store trait definition.

use async_trait::async_trait;

use super::StorageResult;

/// Narrow object-store interface: opaque keys, whole-object bytes.
///
/// Implementations provide access to stored snapshots, whether local or
/// remote.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object. `NotFound` when the key does not exist.
    async fn get(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Store an object, replacing any existing value.
    async fn put(&self, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Whether the key exists.
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(super::StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
