//! Workspace persistence and restore.
//!
//! Live workspaces live under `data/sandboxes/<session_id>/workspace/`;
//! local snapshots under `data/sessions/<session_id>/workspace/`; the cloud
//! mirror (when configured) holds `<prefix>/<session_id>.tar.gz`.
//!
//! Persist and restore are best-effort: failures are logged and the session
//! response is never blocked on them.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tar::Archive;
use tracing::{info, warn};

use crate::storage::{ObjectStore, SnapshotUrl};

/// Subtrees excluded from snapshots; they are reproducible from the
/// workspace contents.
pub const EXCLUDED_SUBTREES: &[&str] = &["node_modules", ".git", "__pycache__", ".venv"];

/// Where a cold resume's workspace came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    /// Live directory still on disk; used as-is.
    Live,
    /// Copied back from the local snapshot.
    Local,
    /// Downloaded and extracted from the object store.
    Cloud,
    /// Fresh copy of the agent directory.
    Fresh,
}

impl fmt::Display for RestoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreSource::Live => write!(f, "live"),
            RestoreSource::Local => write!(f, "local"),
            RestoreSource::Cloud => write!(f, "cloud"),
            RestoreSource::Fresh => write!(f, "fresh"),
        }
    }
}

/// Store managing workspace copies across the three tiers.
#[derive(Clone)]
pub struct WorkspaceStore {
    data_dir: PathBuf,
    object_store: Option<Arc<dyn ObjectStore>>,
    snapshot_url: Option<SnapshotUrl>,
}

impl WorkspaceStore {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        object_store: Option<Arc<dyn ObjectStore>>,
        snapshot_url: Option<SnapshotUrl>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            object_store,
            snapshot_url,
        }
    }

    /// Live workspace directory for a session.
    pub fn live_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir
            .join("sandboxes")
            .join(session_id)
            .join("workspace")
    }

    /// Local snapshot directory for a session.
    pub fn snapshot_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir
            .join("sessions")
            .join(session_id)
            .join("workspace")
    }

    fn cloud_key(&self, session_id: &str) -> Option<String> {
        self.snapshot_url
            .as_ref()
            .map(|url| url.key(&format!("{session_id}.tar.gz")))
    }

    /// Persist the live workspace: synchronous local copy, then a
    /// fire-and-forget upload of the snapshot tarball when a mirror is
    /// configured. Upload failure is logged, not propagated.
    pub async fn persist(&self, session_id: &str) {
        let live = self.live_dir(session_id);
        let snapshot = self.snapshot_dir(session_id);

        if !live.is_dir() {
            warn!(session_id = %session_id, "persist skipped: no live workspace");
            return;
        }

        if let Err(e) = replace_dir_filtered(&live, &snapshot) {
            warn!(session_id = %session_id, error = ?e, "workspace snapshot copy failed");
            return;
        }

        if let (Some(store), Some(key)) = (self.object_store.clone(), self.cloud_key(session_id)) {
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                let bytes = match tokio::task::spawn_blocking({
                    let snapshot = snapshot.clone();
                    move || pack_tar_gz(&snapshot)
                })
                .await
                {
                    Ok(Ok(bytes)) => bytes,
                    Ok(Err(e)) => {
                        warn!(session_id = %session_id, error = ?e, "snapshot tarball failed");
                        return;
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = ?e, "snapshot task failed");
                        return;
                    }
                };
                if let Err(e) = store.put(&key, &bytes).await {
                    warn!(session_id = %session_id, key = %key, error = ?e, "snapshot upload failed");
                }
            });
        }
    }

    /// Restore the workspace for a cold resume, walking the tier chain:
    /// live dir -> local snapshot -> cloud tarball -> fresh agent copy.
    pub async fn restore(&self, session_id: &str, agent_dir: &Path) -> Result<RestoreSource> {
        let live = self.live_dir(session_id);
        let snapshot = self.snapshot_dir(session_id);

        let source = if live.is_dir() {
            RestoreSource::Live
        } else if snapshot.is_dir() {
            replace_dir_filtered(&snapshot, &live).context("restoring local snapshot")?;
            RestoreSource::Local
        } else if let Some(bytes) = self.fetch_cloud_snapshot(session_id).await {
            std::fs::create_dir_all(&live).context("creating live workspace")?;
            unpack_tar_gz(&bytes, &live).context("extracting cloud snapshot")?;
            RestoreSource::Cloud
        } else {
            replace_dir_filtered(agent_dir, &live).context("copying agent directory")?;
            RestoreSource::Fresh
        };

        info!(session_id = %session_id, source = %source, "workspace restored");
        Ok(source)
    }

    async fn fetch_cloud_snapshot(&self, session_id: &str) -> Option<Vec<u8>> {
        let store = self.object_store.as_ref()?;
        let key = self.cloud_key(session_id)?;
        match store.get(&key).await {
            Ok(bytes) => Some(bytes),
            Err(crate::storage::StorageError::NotFound(_)) => None,
            Err(e) => {
                warn!(session_id = %session_id, key = %key, error = ?e, "cloud snapshot fetch failed");
                None
            }
        }
    }

    /// Delete the live workspace directory.
    pub fn remove_live(&self, session_id: &str) {
        remove_session_dir(&self.data_dir.join("sandboxes").join(session_id));
    }

    /// Delete the local snapshot directory. The cloud copy is untouched; it
    /// is the long-term backup.
    pub fn remove_snapshot(&self, session_id: &str) {
        remove_session_dir(&self.data_dir.join("sessions").join(session_id));
    }
}

fn remove_session_dir(dir: &Path) {
    if dir.is_dir() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            warn!(dir = %dir.display(), error = ?e, "directory removal failed");
        }
    }
}

fn is_excluded(name: &std::ffi::OsStr) -> bool {
    EXCLUDED_SUBTREES.iter().any(|ex| name == *ex)
}

/// Copy `src` over `dst`, excluding the reproducible subtrees. Any previous
/// contents of `dst` are replaced.
fn replace_dir_filtered(src: &Path, dst: &Path) -> Result<()> {
    if dst.is_dir() {
        std::fs::remove_dir_all(dst).context("clearing destination")?;
    }
    copy_dir_filtered(src, dst)
}

fn copy_dir_filtered(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("creating {}", dst.display()))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if is_excluded(&name) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_filtered(&from, &to)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to)
                .with_context(|| format!("copying {}", from.display()))?;
        }
        // Symlinks are dropped: snapshots must be self-contained.
    }
    Ok(())
}

/// Pack a directory into a gzipped tarball in memory.
pub fn pack_tar_gz(dir: &Path) -> Result<Vec<u8>> {
    let enc = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("archiving {}", dir.display()))?;
    let enc = builder.into_inner().context("finishing archive")?;
    Ok(enc.finish().context("finishing gzip stream")?)
}

/// Extract a gzipped tarball into `dest`, rejecting entries that would
/// escape it.
pub fn unpack_tar_gz(bytes: &[u8], dest: &Path) -> Result<()> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries().context("reading archive entries")? {
        let mut entry = entry.context("reading archive entry")?;
        let path = entry.path().context("reading entry path")?;
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("unsafe archive entry: {}", path.display());
        }
        entry
            .unpack_in(dest)
            .with_context(|| format!("unpacking into {}", dest.display()))?;
    }
    Ok(())
}

/// Total size in bytes of a directory tree. Used by the disk quota sweep.
pub fn dir_size(dir: &Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}
