//! Object-store abstraction for workspace snapshot mirrors.
//!
//! The core only needs `get`/`put`/`delete` on opaque keys. A filesystem
//! implementation backs `file://` URLs (and tests); S3/GCS clients plug in
//! behind the same trait when the deployment provides them.

mod error;
mod local;
mod traits;

pub use error::{StorageError, StorageResult};
pub use local::FsObjectStore;
pub use traits::ObjectStore;

use std::sync::Arc;

/// Parsed `SNAPSHOT_URL` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUrl {
    /// `s3`, `gs`, or `file`.
    pub scheme: String,
    /// Bucket name, or root directory for `file`.
    pub bucket: String,
    /// Key prefix inside the bucket (may be empty).
    pub prefix: String,
}

impl SnapshotUrl {
    /// Parse `scheme://bucket/prefix` into its parts.
    pub fn parse(url: &str) -> StorageResult<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
        if !matches!(scheme, "s3" | "gs" | "file") {
            return Err(StorageError::InvalidUrl(url.to_string()));
        }

        // Tolerate the `file:///abs/path` triple-slash form.
        let rest = rest.trim_start_matches('/');
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(StorageError::InvalidUrl(url.to_string()));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }

    /// Full object key under this URL's prefix.
    pub fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }
}

/// Construct the object store for a snapshot URL.
///
/// `file://` maps to [`FsObjectStore`]. Remote schemes require a client
/// registered by the deployment; without one, configuration fails fast
/// instead of silently skipping uploads.
pub fn store_for_url(url: &SnapshotUrl) -> StorageResult<Arc<dyn ObjectStore>> {
    match url.scheme.as_str() {
        "file" => Ok(Arc::new(FsObjectStore::new(format!("/{}", url.bucket)))),
        scheme => Err(StorageError::Backend(format!(
            "no object-store client registered for scheme '{scheme}'"
        ))),
    }
}
