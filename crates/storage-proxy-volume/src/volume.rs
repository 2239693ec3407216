//! The volume contract every backend implements.
//!
//! A volume is one backend instance bound to one physical mount. It is
//! constructed once per worker, `init`-ed before first use, shared by every
//! in-flight request routed to it, and `shutdown` once at teardown.
//!
//! All operations are addressed by `(vfid, relpath)`. Implementations must
//! route every relpath through [`AbstractVolume::sanitize_vfpath`] before any
//! I/O; optional behaviour is negotiated through
//! [`AbstractVolume::get_capabilities`], not through default methods.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use storage_proxy_types::{
    CapabilitySet, DirEntry, FsPerfMetric, FsUsage, UploadSessionId, VFolderCreationOptions,
    VFolderId, VFolderUsage,
};

use crate::error::VolumeResult;
use crate::sandbox::PathSandbox;

/// Chunk size sentinel: let the backend pick its natural buffer size.
pub const CHUNK_SIZE_UNSET: usize = 0;

/// Natural read buffer size (64KB).
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Lazy, single-pass sequence of directory entries.
pub type DirEntryStream = BoxStream<'static, VolumeResult<DirEntry>>;

/// Lazy, single-pass sequence of file chunks produced by a volume.
pub type ChunkStream = BoxStream<'static, VolumeResult<Bytes>>;

/// Caller-supplied upload payload.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Static description of a configured volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Backend implementation name (e.g. `"vfs"`).
    pub backend: String,
    /// Absolute physical mount path.
    pub path: PathBuf,
    /// Namespace under the mount, for several logical volumes on one mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fsprefix: Option<PathBuf>,
    /// Backend-specific options block.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl VolumeInfo {
    pub fn new(backend: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            backend: backend.into(),
            path: path.into(),
            fsprefix: None,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_fsprefix(mut self, fsprefix: impl Into<PathBuf>) -> Self {
        self.fsprefix = Some(fsprefix.into());
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// The directory vfolders are mangled under: mount path plus fsprefix.
    pub fn root(&self) -> PathBuf {
        match &self.fsprefix {
            Some(prefix) => self.path.join(prefix),
            None => self.path.clone(),
        }
    }
}

/// Proxy-wide settings handed to every volume at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeContext {
    /// Identity of this proxy node. Keys the upload staging area, since
    /// several nodes may mount the same volume.
    pub node_id: String,
    /// Maximum entries a single scan produces (0 = unlimited).
    pub scandir_limit: usize,
    /// Maximum bytes accepted for one uploaded file.
    pub max_upload_size: u64,
    /// How long an idle upload session survives.
    pub session_expire: Duration,
}

impl Default for VolumeContext {
    fn default() -> Self {
        Self {
            node_id: "local".to_string(),
            scandir_limit: 1000,
            max_upload_size: 100 * 1024 * 1024 * 1024, // 100GiB
            session_expire: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Core volume operations trait.
///
/// Implementations must tolerate concurrent invocation: any internal
/// serialization is the volume's own business.
#[async_trait]
pub trait AbstractVolume: Send + Sync {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Prepare the backend (open connections, create private directories).
    async fn init(&self) -> VolumeResult<()> {
        Ok(())
    }

    /// Release backend resources.
    async fn shutdown(&self) -> VolumeResult<()> {
        Ok(())
    }

    /// The configuration this volume was built from.
    fn info(&self) -> &VolumeInfo;

    /// Addressing and containment rules of this volume.
    fn sandbox(&self) -> &PathSandbox;

    // ========================================================================
    // Addressing (provided)
    // ========================================================================

    /// Physical directory of a vfolder.
    fn mangle_vfpath(&self, vfid: &VFolderId) -> PathBuf {
        self.sandbox().mangle(vfid)
    }

    /// Resolve and verify a relpath on the blocking pool.
    async fn sanitize_vfpath(
        &self,
        vfid: &VFolderId,
        relpath: Option<&Path>,
    ) -> VolumeResult<PathBuf> {
        let sandbox = self.sandbox().clone();
        let vfid = *vfid;
        let relpath = relpath.map(Path::to_path_buf);
        tokio::task::spawn_blocking(move || sandbox.sanitize(&vfid, relpath.as_deref())).await?
    }

    // ========================================================================
    // Volume operations
    // ========================================================================

    /// Capabilities this backend advertises.
    async fn get_capabilities(&self) -> CapabilitySet;

    /// Create the vfolder's directory tree.
    async fn create_vfolder(
        &self,
        vfid: &VFolderId,
        options: VFolderCreationOptions,
    ) -> VolumeResult<()>;

    /// Remove the vfolder and everything under it. Irreversible.
    async fn delete_vfolder(&self, vfid: &VFolderId) -> VolumeResult<()>;

    /// Copy `src`'s tree into a new vfolder `dst`, which must not exist.
    async fn clone_vfolder(&self, src: &VFolderId, dst: &VFolderId) -> VolumeResult<()>;

    /// Physical mount directory of an existing vfolder.
    async fn get_vfolder_mount(&self, vfid: &VFolderId) -> VolumeResult<PathBuf>;

    /// Replace the vfolder's metadata blob.
    async fn put_metadata(&self, vfid: &VFolderId, payload: Bytes) -> VolumeResult<()>;

    /// Read the vfolder's metadata blob.
    async fn get_metadata(&self, vfid: &VFolderId) -> VolumeResult<Bytes>;

    /// Quota in bytes (0 = unlimited). Needs [`Capability::Quota`].
    ///
    /// [`Capability::Quota`]: storage_proxy_types::Capability::Quota
    async fn get_quota(&self, vfid: &VFolderId) -> VolumeResult<u64>;

    /// Set the quota in bytes (0 clears it). Needs [`Capability::Quota`].
    ///
    /// [`Capability::Quota`]: storage_proxy_types::Capability::Quota
    async fn set_quota(&self, vfid: &VFolderId, size_bytes: u64) -> VolumeResult<()>;

    /// Volume performance counters.
    async fn get_performance_metric(&self) -> VolumeResult<FsPerfMetric>;

    /// Capacity and usage of the whole volume.
    async fn get_fs_usage(&self) -> VolumeResult<FsUsage>;

    /// Usage of a vfolder, or of a subtree of it.
    async fn get_usage(
        &self,
        vfid: &VFolderId,
        relpath: Option<&Path>,
    ) -> VolumeResult<VFolderUsage>;

    // ========================================================================
    // Vfolder operations
    // ========================================================================

    /// Lazily list a directory inside the vfolder.
    fn scandir(&self, vfid: &VFolderId, relpath: Option<&Path>) -> DirEntryStream;

    /// Create a directory, optionally with missing ancestors.
    async fn mkdir(&self, vfid: &VFolderId, relpath: &Path, parents: bool) -> VolumeResult<()>;

    /// Remove a directory, optionally with its contents.
    async fn rmdir(&self, vfid: &VFolderId, relpath: &Path, recursive: bool) -> VolumeResult<()>;

    /// Move a file or directory within the vfolder.
    async fn move_file(&self, vfid: &VFolderId, src: &Path, dst: &Path) -> VolumeResult<()>;

    /// Copy a file within the vfolder.
    async fn copy_file(&self, vfid: &VFolderId, src: &Path, dst: &Path) -> VolumeResult<()>;

    /// Delete a batch of files or directories.
    async fn delete_files(&self, vfid: &VFolderId, relpaths: &[PathBuf]) -> VolumeResult<()>;

    // ========================================================================
    // Streaming transfer
    // ========================================================================

    /// Allocate a private staging area for a multi-file upload.
    async fn prepare_upload(&self, vfid: &VFolderId) -> VolumeResult<UploadSessionId>;

    /// Stream a payload to `relpath`, visible only once complete.
    async fn add_file(
        &self,
        vfid: &VFolderId,
        relpath: &Path,
        payload: ByteStream,
    ) -> VolumeResult<()>;

    /// Stream a payload into an upload session without publishing it.
    async fn stage_upload(
        &self,
        vfid: &VFolderId,
        session: &UploadSessionId,
        relpath: &Path,
        payload: ByteStream,
    ) -> VolumeResult<()>;

    /// Publish every file staged in the session and close it.
    async fn commit_upload(
        &self,
        vfid: &VFolderId,
        session: &UploadSessionId,
    ) -> VolumeResult<Vec<PathBuf>>;

    /// Discard the session and everything staged in it.
    async fn abort_upload(&self, vfid: &VFolderId, session: &UploadSessionId) -> VolumeResult<()>;

    /// Discard idle upload sessions. Returns how many were dropped.
    async fn reap_expired_uploads(&self) -> usize {
        0
    }

    /// Lazily read a file in chunks of at most `chunk_size` bytes.
    ///
    /// [`CHUNK_SIZE_UNSET`] picks the backend's natural buffer size.
    fn read_file(&self, vfid: &VFolderId, relpath: &Path, chunk_size: usize) -> ChunkStream;
}
