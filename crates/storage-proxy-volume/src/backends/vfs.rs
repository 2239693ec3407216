//! Plain local filesystem backend.
//!
//! Vfolders are directories mangled under the volume root. Everything the
//! volume keeps for itself lives in the reserved area:
//!
//! ```text
//! <root>/
//! ├── 12/34/5678…        vfolder trees
//! └── .storage-proxy/
//!     ├── metadata/<hex>  opaque metadata blobs
//!     ├── quota/<hex>     quota limits (decimal bytes)
//!     └── uploads/<node>/… upload staging
//! ```

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::fs;
use tokio_util::io::ReaderStream;

use storage_proxy_types::{
    Capability, CapabilitySet, FsPerfMetric, FsUsage, UploadSessionId, VFolderCreationOptions,
    VFolderId, VFolderUsage,
};

use crate::error::{VolumeError, VolumeResult};
use crate::sandbox::PathSandbox;
use crate::scan::{DirectoryScanner, walk_usage};
use crate::upload::{QuotaBudget, UploadSessions, WriteBudget};
use crate::volume::{
    AbstractVolume, ByteStream, CHUNK_SIZE_UNSET, ChunkStream, DEFAULT_CHUNK_SIZE,
    DirEntryStream, VolumeContext, VolumeInfo,
};

/// Backend-specific options of a `vfs` volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VfsOptions {
    /// Enforce per-vfolder quotas (advertises the quota capability).
    pub quota: bool,
}

impl VfsOptions {
    /// Parse the options block of a [`VolumeInfo`].
    pub fn from_info(info: &VolumeInfo) -> VolumeResult<Self> {
        serde_json::from_value(serde_json::Value::Object(info.options.clone()))
            .map_err(|e| VolumeError::invalid_argument(format!("vfs options: {e}")))
    }
}

/// Local filesystem volume.
#[derive(Debug)]
pub struct VfsVolume {
    info: VolumeInfo,
    ctx: VolumeContext,
    options: VfsOptions,
    sandbox: PathSandbox,
    uploads: UploadSessions,
}

impl VfsVolume {
    /// Build a volume over `info.root()`. No I/O happens until `init`.
    pub fn new(info: VolumeInfo, ctx: VolumeContext) -> VolumeResult<Self> {
        let options = VfsOptions::from_info(&info)?;
        let sandbox = PathSandbox::new(info.root());
        let uploads = UploadSessions::new(
            sandbox.reserved_dir().join("uploads"),
            &ctx.node_id,
            ctx.session_expire,
        );
        Ok(Self {
            info,
            ctx,
            options,
            sandbox,
            uploads,
        })
    }

    pub fn options(&self) -> &VfsOptions {
        &self.options
    }

    /// Upload sessions of this volume.
    pub fn uploads(&self) -> &UploadSessions {
        &self.uploads
    }

    fn metadata_path(&self, vfid: &VFolderId) -> PathBuf {
        self.sandbox.reserved_dir().join("metadata").join(vfid.to_hex())
    }

    fn quota_path(&self, vfid: &VFolderId) -> PathBuf {
        self.sandbox.reserved_dir().join("quota").join(vfid.to_hex())
    }

    fn require_quota(&self) -> VolumeResult<()> {
        if self.options.quota {
            Ok(())
        } else {
            Err(VolumeError::CapabilityUnsupported(Capability::Quota))
        }
    }

    /// The vfolder directory, which must exist.
    async fn existing_vfolder(&self, vfid: &VFolderId) -> VolumeResult<PathBuf> {
        let vfpath = self.mangle_vfpath(vfid);
        match fs::metadata(&vfpath).await {
            Ok(meta) if meta.is_dir() => Ok(vfpath),
            Ok(_) => Err(VolumeError::not_found(format!("vfolder {vfid}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(VolumeError::not_found(format!("vfolder {vfid}")))
            }
            Err(e) => Err(VolumeError::BackendIo(e)),
        }
    }

    /// Sanitize on the blocking pool, leaving the leaf unresolved.
    async fn sanitize_entry(&self, vfid: &VFolderId, relpath: &Path) -> VolumeResult<PathBuf> {
        let sandbox = self.sandbox.clone();
        let vfid = *vfid;
        let relpath = relpath.to_path_buf();
        tokio::task::spawn_blocking(move || sandbox.sanitize_entry(&vfid, &relpath)).await?
    }

    async fn usage_of(&self, path: PathBuf) -> VolumeResult<VFolderUsage> {
        tokio::task::spawn_blocking(move || {
            walk_usage(&path).map_err(|e| VolumeError::from_io(e, &path))
        })
        .await?
    }

    /// Current quota limit, `None` when not enforced or unset.
    async fn quota_limit(&self, vfid: &VFolderId) -> VolumeResult<Option<u64>> {
        if !self.options.quota {
            return Ok(None);
        }
        let path = self.quota_path(vfid);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(VolumeError::BackendIo(e)),
        };
        let limit: u64 = raw.trim().parse().map_err(|e| {
            VolumeError::backend(format!("corrupt quota record {}: {e}", path.display()))
        })?;
        Ok((limit > 0).then_some(limit))
    }

    /// Limits for a write of up to `max_size` bytes into `vfid`.
    ///
    /// `pending` is what the caller already staged and has not published yet.
    async fn write_budget(
        &self,
        vfid: &VFolderId,
        max_size: u64,
        pending: u64,
    ) -> VolumeResult<WriteBudget> {
        let quota = match self.quota_limit(vfid).await? {
            Some(limit) => {
                let usage = self.usage_of(self.mangle_vfpath(vfid)).await?;
                Some(QuotaBudget {
                    limit,
                    used: usage.used_bytes.saturating_add(pending),
                })
            }
            None => None,
        };
        Ok(WriteBudget {
            max_upload_size: max_size,
            quota,
        })
    }

    async fn write_quota(&self, vfid: &VFolderId, size_bytes: u64) -> VolumeResult<()> {
        let path = self.quota_path(vfid);
        if size_bytes == 0 {
            return remove_record(&path).await;
        }
        write_record(&path, size_bytes.to_string().as_bytes()).await
    }

    /// Create the vfolder directory and its fan-out parents.
    ///
    /// A concurrent `delete_vfolder` of a sibling may prune the fan-out
    /// between the two steps, so a vanished parent is recreated and retried.
    async fn create_vfolder_dir(&self, vfid: &VFolderId) -> VolumeResult<PathBuf> {
        let vfpath = self.mangle_vfpath(vfid);
        let mut attempts = 0;
        loop {
            if let Some(parent) = vfpath.parent() {
                fs::create_dir_all(parent).await?;
            }
            match fs::create_dir(&vfpath).await {
                Ok(()) => return Ok(vfpath),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(VolumeError::already_exists(format!("vfolder {vfid}")));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound && attempts < CREATE_RETRIES => {
                    attempts += 1;
                }
                Err(e) => return Err(VolumeError::BackendIo(e)),
            }
        }
    }

    /// Sanitized destination for a new file; must not be a directory.
    async fn file_destination(&self, vfid: &VFolderId, relpath: &Path) -> VolumeResult<PathBuf> {
        let dst = self.sanitize_vfpath(vfid, Some(relpath)).await?;
        if dst == self.mangle_vfpath(vfid) || fs::metadata(&dst).await.is_ok_and(|m| m.is_dir()) {
            return Err(VolumeError::invalid_argument(format!(
                "{} is a directory",
                relpath.display()
            )));
        }
        Ok(dst)
    }
}

#[async_trait]
impl AbstractVolume for VfsVolume {
    async fn init(&self) -> VolumeResult<()> {
        let root = self.sandbox.root();
        match fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(VolumeError::invalid_argument(format!(
                    "volume root {} is not a directory",
                    root.display()
                )));
            }
            Err(e) => return Err(VolumeError::from_io(e, root)),
        }

        let reserved = self.sandbox.reserved_dir();
        fs::create_dir_all(reserved.join("metadata")).await?;
        fs::create_dir_all(reserved.join("quota")).await?;
        self.uploads.init().await?;

        tracing::info!(
            root = %root.display(),
            quota = self.options.quota,
            "vfs volume initialized"
        );
        Ok(())
    }

    async fn shutdown(&self) -> VolumeResult<()> {
        let open = self.uploads.len();
        self.uploads.clear().await;
        tracing::info!(
            root = %self.sandbox.root().display(),
            discarded_sessions = open,
            "vfs volume shut down"
        );
        Ok(())
    }

    fn info(&self) -> &VolumeInfo {
        &self.info
    }

    fn sandbox(&self) -> &PathSandbox {
        &self.sandbox
    }

    async fn get_capabilities(&self) -> CapabilitySet {
        let caps = CapabilitySet::new().with(Capability::VFolder);
        if self.options.quota {
            caps.with(Capability::Quota)
        } else {
            caps
        }
    }

    async fn create_vfolder(
        &self,
        vfid: &VFolderId,
        options: VFolderCreationOptions,
    ) -> VolumeResult<()> {
        if options.quota.is_some() {
            self.require_quota()?;
        }

        self.create_vfolder_dir(vfid).await?;

        if let Some(quota) = options.quota {
            self.write_quota(vfid, quota).await?;
        }
        tracing::debug!(vfid = %vfid, "vfolder created");
        Ok(())
    }

    async fn delete_vfolder(&self, vfid: &VFolderId) -> VolumeResult<()> {
        let vfpath = self.existing_vfolder(vfid).await?;
        fs::remove_dir_all(&vfpath).await?;
        remove_record(&self.metadata_path(vfid)).await?;
        remove_record(&self.quota_path(vfid)).await?;

        // Prune the fan-out directories once they are empty
        for dir in vfpath.ancestors().skip(1).take(2) {
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
        }
        tracing::debug!(vfid = %vfid, "vfolder deleted");
        Ok(())
    }

    async fn clone_vfolder(&self, src: &VFolderId, dst: &VFolderId) -> VolumeResult<()> {
        let src_path = self.existing_vfolder(src).await?;
        let dst_path = self.create_vfolder_dir(dst).await?;

        let (from, to) = (src_path.clone(), dst_path.clone());
        let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to)).await?;
        if let Err(e) = copied {
            // Don't leave a half-copied vfolder behind
            let _ = fs::remove_dir_all(&dst_path).await;
            return Err(VolumeError::BackendIo(e));
        }

        match fs::read(self.metadata_path(src)).await {
            Ok(meta) => write_record(&self.metadata_path(dst), &meta).await?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(VolumeError::BackendIo(e)),
        }
        tracing::debug!(src = %src, dst = %dst, "vfolder cloned");
        Ok(())
    }

    async fn get_vfolder_mount(&self, vfid: &VFolderId) -> VolumeResult<PathBuf> {
        self.existing_vfolder(vfid).await
    }

    async fn put_metadata(&self, vfid: &VFolderId, payload: Bytes) -> VolumeResult<()> {
        self.existing_vfolder(vfid).await?;
        write_record(&self.metadata_path(vfid), &payload).await
    }

    async fn get_metadata(&self, vfid: &VFolderId) -> VolumeResult<Bytes> {
        self.existing_vfolder(vfid).await?;
        match fs::read(self.metadata_path(vfid)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Bytes::new()),
            Err(e) => Err(VolumeError::BackendIo(e)),
        }
    }

    async fn get_quota(&self, vfid: &VFolderId) -> VolumeResult<u64> {
        self.require_quota()?;
        self.existing_vfolder(vfid).await?;
        Ok(self.quota_limit(vfid).await?.unwrap_or(0))
    }

    async fn set_quota(&self, vfid: &VFolderId, size_bytes: u64) -> VolumeResult<()> {
        self.require_quota()?;
        self.existing_vfolder(vfid).await?;
        self.write_quota(vfid, size_bytes).await?;
        tracing::debug!(vfid = %vfid, size_bytes, "quota set");
        Ok(())
    }

    async fn get_performance_metric(&self) -> VolumeResult<FsPerfMetric> {
        // No kernel counters for a plain directory tree
        Ok(FsPerfMetric::default())
    }

    async fn get_fs_usage(&self) -> VolumeResult<FsUsage> {
        let root = self.sandbox.root().to_path_buf();
        tokio::task::spawn_blocking(move || statfs(&root)).await?
    }

    async fn get_usage(
        &self,
        vfid: &VFolderId,
        relpath: Option<&Path>,
    ) -> VolumeResult<VFolderUsage> {
        self.existing_vfolder(vfid).await?;
        let target = self.sanitize_vfpath(vfid, relpath).await?;
        self.usage_of(target).await
    }

    fn scandir(&self, vfid: &VFolderId, relpath: Option<&Path>) -> DirEntryStream {
        DirectoryScanner::new(
            self.sandbox.clone(),
            *vfid,
            relpath.map(Path::to_path_buf),
            self.ctx.scandir_limit,
        )
        .into_stream()
    }

    async fn mkdir(&self, vfid: &VFolderId, relpath: &Path, parents: bool) -> VolumeResult<()> {
        self.existing_vfolder(vfid).await?;
        let target = self.sanitize_vfpath(vfid, Some(relpath)).await?;
        let created = if parents {
            fs::create_dir_all(&target).await
        } else {
            fs::create_dir(&target).await
        };
        created.map_err(|e| VolumeError::from_io(e, relpath))?;
        tracing::debug!(vfid = %vfid, path = %relpath.display(), "mkdir");
        Ok(())
    }

    async fn rmdir(&self, vfid: &VFolderId, relpath: &Path, recursive: bool) -> VolumeResult<()> {
        let vfpath = self.existing_vfolder(vfid).await?;
        let target = self.sanitize_entry(vfid, relpath).await?;
        if target == vfpath {
            return Err(VolumeError::invalid_argument(
                "cannot remove the vfolder root, delete the vfolder instead",
            ));
        }

        let meta = fs::symlink_metadata(&target)
            .await
            .map_err(|e| VolumeError::from_io(e, relpath))?;
        if !meta.is_dir() {
            return Err(VolumeError::invalid_argument(format!(
                "{} is not a directory",
                relpath.display()
            )));
        }

        let removed = if recursive {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_dir(&target).await
        };
        removed.map_err(|e| match e.kind() {
            io::ErrorKind::DirectoryNotEmpty => {
                VolumeError::invalid_argument(format!("{} is not empty", relpath.display()))
            }
            _ => VolumeError::from_io(e, relpath),
        })?;
        tracing::debug!(vfid = %vfid, path = %relpath.display(), recursive, "rmdir");
        Ok(())
    }

    async fn move_file(&self, vfid: &VFolderId, src: &Path, dst: &Path) -> VolumeResult<()> {
        let vfpath = self.existing_vfolder(vfid).await?;
        let from = self.sanitize_entry(vfid, src).await?;
        let to = self.sanitize_vfpath(vfid, Some(dst)).await?;
        if from == vfpath || to == vfpath {
            return Err(VolumeError::invalid_argument(
                "cannot move the vfolder root or onto it",
            ));
        }

        fs::symlink_metadata(&from)
            .await
            .map_err(|e| VolumeError::from_io(e, src))?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from, &to).await?;
        tracing::debug!(vfid = %vfid, src = %src.display(), dst = %dst.display(), "move");
        Ok(())
    }

    async fn copy_file(&self, vfid: &VFolderId, src: &Path, dst: &Path) -> VolumeResult<()> {
        self.existing_vfolder(vfid).await?;
        let from = self.sanitize_vfpath(vfid, Some(src)).await?;
        let meta = fs::metadata(&from)
            .await
            .map_err(|e| VolumeError::from_io(e, src))?;
        if !meta.is_file() {
            return Err(VolumeError::invalid_argument(format!(
                "{} is not a regular file",
                src.display()
            )));
        }
        let to = self.file_destination(vfid, dst).await?;
        let budget = self.write_budget(vfid, u64::MAX, 0).await?;
        budget.check(meta.len())?;

        // Staged and renamed like an upload: the rename replaces whatever
        // entry sits at the destination instead of writing through it
        let source = fs::File::open(&from)
            .await
            .map_err(|e| VolumeError::from_io(e, src))?;
        let session = self.uploads.ephemeral(vfid).await?;
        self.uploads
            .stage(session.id(), vfid, to, ReaderStream::new(source).boxed(), budget)
            .await?;
        session.commit(vfid).await?;
        tracing::debug!(vfid = %vfid, src = %src.display(), dst = %dst.display(), "copy");
        Ok(())
    }

    async fn delete_files(&self, vfid: &VFolderId, relpaths: &[PathBuf]) -> VolumeResult<()> {
        let vfpath = self.existing_vfolder(vfid).await?;

        // Validate the whole batch before touching anything
        let mut targets = Vec::with_capacity(relpaths.len());
        for relpath in relpaths {
            let target = self.sanitize_entry(vfid, relpath).await?;
            if target == vfpath {
                return Err(VolumeError::invalid_argument(
                    "cannot delete the vfolder root, delete the vfolder instead",
                ));
            }
            targets.push(target);
        }

        let mut first_error = None;
        for target in &targets {
            let removed = match fs::symlink_metadata(target).await {
                Ok(meta) if meta.is_dir() => fs::remove_dir_all(target).await,
                Ok(_) => fs::remove_file(target).await,
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(vfid = %vfid, path = %target.display(), "delete failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        tracing::debug!(vfid = %vfid, count = targets.len(), "delete files");

        match first_error {
            Some(e) => Err(VolumeError::BackendIo(e)),
            None => Ok(()),
        }
    }

    async fn prepare_upload(&self, vfid: &VFolderId) -> VolumeResult<UploadSessionId> {
        self.existing_vfolder(vfid).await?;
        self.uploads.prepare(vfid).await
    }

    async fn add_file(
        &self,
        vfid: &VFolderId,
        relpath: &Path,
        payload: ByteStream,
    ) -> VolumeResult<()> {
        self.existing_vfolder(vfid).await?;
        let dst = self.file_destination(vfid, relpath).await?;
        let budget = self.write_budget(vfid, self.ctx.max_upload_size, 0).await?;

        let session = self.uploads.ephemeral(vfid).await?;
        let staged = self
            .uploads
            .stage(session.id(), vfid, dst, payload, budget)
            .await?;
        session.commit(vfid).await?;
        tracing::debug!(vfid = %vfid, path = %relpath.display(), size = staged.size, "file added");
        Ok(())
    }

    async fn stage_upload(
        &self,
        vfid: &VFolderId,
        session: &UploadSessionId,
        relpath: &Path,
        payload: ByteStream,
    ) -> VolumeResult<()> {
        self.existing_vfolder(vfid).await?;
        let pending: u64 = match self.uploads.get(session) {
            Some(s) if s.vfid == *vfid => s.staged().iter().map(|f| f.size).sum(),
            _ => return Err(VolumeError::not_found(format!("upload session {session}"))),
        };
        let dst = self.file_destination(vfid, relpath).await?;
        let budget = self
            .write_budget(vfid, self.ctx.max_upload_size, pending)
            .await?;
        self.uploads.stage(session, vfid, dst, payload, budget).await?;
        Ok(())
    }

    async fn commit_upload(
        &self,
        vfid: &VFolderId,
        session: &UploadSessionId,
    ) -> VolumeResult<Vec<PathBuf>> {
        let published = self.uploads.commit(session, vfid).await?;
        Ok(published
            .iter()
            .map(|p| self.sandbox.relative_to_vfolder(vfid, p))
            .collect())
    }

    async fn abort_upload(&self, vfid: &VFolderId, session: &UploadSessionId) -> VolumeResult<()> {
        self.uploads.abort(session, vfid).await
    }

    async fn reap_expired_uploads(&self) -> usize {
        self.uploads.reap_expired().await
    }

    fn read_file(&self, vfid: &VFolderId, relpath: &Path, chunk_size: usize) -> ChunkStream {
        let sandbox = self.sandbox.clone();
        let vfid = *vfid;
        let relpath = relpath.to_path_buf();
        let chunk_size = if chunk_size == CHUNK_SIZE_UNSET {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };

        let open = async move {
            let target = {
                let relpath = relpath.clone();
                tokio::task::spawn_blocking(move || sandbox.sanitize(&vfid, Some(&relpath)))
                    .await??
            };
            let file = fs::File::open(&target)
                .await
                .map_err(|e| VolumeError::from_io(e, &relpath))?;
            if !file.metadata().await?.is_file() {
                return Err(VolumeError::invalid_argument(format!(
                    "{} is not a regular file",
                    relpath.display()
                )));
            }
            Ok::<_, VolumeError>(
                ReaderStream::with_capacity(file, chunk_size).map_err(VolumeError::BackendIo),
            )
        };

        futures::stream::once(open).try_flatten().boxed()
    }
}

/// Extra attempts when a fan-out parent disappears under `create_vfolder`.
const CREATE_RETRIES: usize = 8;

/// Write a small record atomically (temp file + rename).
async fn write_record(path: &Path, data: &[u8]) -> VolumeResult<()> {
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().as_simple()));
    if let Err(e) = fs::write(&tmp, data).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(VolumeError::BackendIo(e));
    }
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(VolumeError::BackendIo(e));
    }
    Ok(())
}

async fn remove_record(path: &Path) -> VolumeResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VolumeError::BackendIo(e)),
    }
}

/// Recursively copy a directory tree into the empty directory `dst`
/// (blocking).
///
/// Symlinks are recreated, never followed. Absolute links into `src` are
/// rebased onto `dst` so the copy does not point back into its origin.
/// Sockets, fifos and devices are skipped.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let roots = LinkRoots::new(src, dst);
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        for entry in std::fs::read_dir(&from)? {
            let entry = entry?;
            let ft = entry.file_type()?;
            let target = to.join(entry.file_name());
            if ft.is_dir() {
                std::fs::create_dir(&target)?;
                pending.push((entry.path(), target));
            } else if ft.is_symlink() {
                copy_symlink(&entry.path(), &target, &roots)?;
            } else if ft.is_file() {
                std::fs::copy(entry.path(), &target)?;
            }
        }
    }
    Ok(())
}

/// Source and destination roots of a tree copy, for rebasing link targets.
struct LinkRoots {
    /// `src` as given and in canonical form; links may use either.
    src: Vec<PathBuf>,
    dst: PathBuf,
}

impl LinkRoots {
    fn new(src: &Path, dst: &Path) -> Self {
        let mut sources = vec![src.to_path_buf()];
        if let Ok(canonical) = dunce::canonicalize(src) {
            if canonical != src {
                sources.push(canonical);
            }
        }
        Self {
            src: sources,
            dst: dst.to_path_buf(),
        }
    }

    fn rebase(&self, link: PathBuf) -> PathBuf {
        if link.is_absolute() {
            for src in &self.src {
                if let Ok(rest) = link.strip_prefix(src) {
                    return self.dst.join(rest);
                }
            }
        }
        link
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path, roots: &LinkRoots) -> io::Result<()> {
    let link = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(roots.rebase(link), dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, _dst: &Path, _roots: &LinkRoots) -> io::Result<()> {
    tracing::debug!(path = %src.display(), "skipping symlink during clone");
    Ok(())
}

fn statfs(root: &Path) -> VolumeResult<FsUsage> {
    #[cfg(unix)]
    {
        use rustix::fs::statvfs;

        let stat = statvfs(root).map_err(|e| VolumeError::BackendIo(e.into()))?;
        let frsize = stat.f_frsize;
        Ok(FsUsage {
            capacity_bytes: stat.f_blocks.saturating_mul(frsize),
            used_bytes: stat.f_blocks.saturating_sub(stat.f_bfree).saturating_mul(frsize),
        })
    }

    #[cfg(not(unix))]
    {
        let _ = root;
        Ok(FsUsage::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup(quota: bool) -> (VfsVolume, TempDir) {
        let dir = TempDir::new().unwrap();
        let info = VolumeInfo::new("vfs", dir.path())
            .with_option("quota", serde_json::Value::Bool(quota));
        let volume = VfsVolume::new(info, VolumeContext::default()).unwrap();
        volume.init().await.unwrap();
        (volume, dir)
    }

    fn payload(data: &'static [u8]) -> ByteStream {
        futures::stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    #[test]
    fn test_options_parse() {
        let info = VolumeInfo::new("vfs", "/v");
        assert_eq!(VfsOptions::from_info(&info).unwrap(), VfsOptions::default());

        let info = info.with_option("quota", serde_json::json!(true));
        assert!(VfsOptions::from_info(&info).unwrap().quota);

        let info = VolumeInfo::new("vfs", "/v").with_option("qouta", serde_json::json!(true));
        assert!(matches!(
            VfsOptions::from_info(&info),
            Err(VolumeError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_init_requires_root() {
        let info = VolumeInfo::new("vfs", "/nonexistent/storage-proxy-root");
        let volume = VfsVolume::new(info, VolumeContext::default()).unwrap();
        assert!(matches!(volume.init().await, Err(VolumeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_capabilities() {
        let (volume, _dir) = setup(false).await;
        let caps = volume.get_capabilities().await;
        assert!(caps.contains(Capability::VFolder));
        assert!(!caps.contains(Capability::Quota));

        let (volume, _dir) = setup(true).await;
        assert!(volume.get_capabilities().await.contains(Capability::Quota));
    }

    #[tokio::test]
    async fn test_create_and_delete_prunes_fanout() {
        let (volume, dir) = setup(false).await;
        let vfid = VFolderId::parse("abcdef00000000000000000000000000").unwrap();
        volume.create_vfolder(&vfid, VFolderCreationOptions::new()).await.unwrap();
        assert!(volume.mangle_vfpath(&vfid).is_dir());

        let again = volume.create_vfolder(&vfid, VFolderCreationOptions::new()).await;
        assert!(matches!(again, Err(VolumeError::AlreadyExists(_))));

        volume.delete_vfolder(&vfid).await.unwrap();
        assert!(!volume.mangle_vfpath(&vfid).exists());
        assert!(!dir.path().join("ab").exists());

        let missing = volume.delete_vfolder(&vfid).await;
        assert!(matches!(missing, Err(VolumeError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_keeps_shared_fanout() {
        let (volume, dir) = setup(false).await;
        let a = VFolderId::parse("abcd0000000000000000000000000001").unwrap();
        let b = VFolderId::parse("abcd0000000000000000000000000002").unwrap();
        volume.create_vfolder(&a, VFolderCreationOptions::new()).await.unwrap();
        volume.create_vfolder(&b, VFolderCreationOptions::new()).await.unwrap();

        volume.delete_vfolder(&a).await.unwrap();
        assert!(dir.path().join("ab/cd").is_dir());
        assert!(volume.mangle_vfpath(&b).is_dir());
    }

    #[tokio::test]
    async fn test_create_with_quota_needs_capability() {
        let (volume, _dir) = setup(false).await;
        let vfid = VFolderId::new_v4();
        let result = volume
            .create_vfolder(&vfid, VFolderCreationOptions::new().with_quota(1024))
            .await;
        assert!(matches!(
            result,
            Err(VolumeError::CapabilityUnsupported(Capability::Quota))
        ));
        assert!(!volume.mangle_vfpath(&vfid).exists());
    }

    #[tokio::test]
    async fn test_metadata() {
        let (volume, _dir) = setup(false).await;
        let vfid = VFolderId::new_v4();
        assert!(matches!(
            volume.get_metadata(&vfid).await,
            Err(VolumeError::NotFound(_))
        ));

        volume.create_vfolder(&vfid, VFolderCreationOptions::new()).await.unwrap();
        assert!(volume.get_metadata(&vfid).await.unwrap().is_empty());

        volume.put_metadata(&vfid, Bytes::from_static(b"{\"owner\":1}")).await.unwrap();
        volume.put_metadata(&vfid, Bytes::from_static(b"v2")).await.unwrap();
        assert_eq!(volume.get_metadata(&vfid).await.unwrap(), Bytes::from_static(b"v2"));

        // Metadata never shows up inside the vfolder tree
        let mut entries = volume.scandir(&vfid, None);
        assert!(entries.next().await.is_none());
    }

    #[tokio::test]
    async fn test_quota_roundtrip_and_clear() {
        let (volume, _dir) = setup(true).await;
        let vfid = VFolderId::new_v4();
        volume
            .create_vfolder(&vfid, VFolderCreationOptions::new().with_quota(4096))
            .await
            .unwrap();
        assert_eq!(volume.get_quota(&vfid).await.unwrap(), 4096);

        volume.set_quota(&vfid, 0).await.unwrap();
        assert_eq!(volume.get_quota(&vfid).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quota_unsupported() {
        let (volume, _dir) = setup(false).await;
        let vfid = VFolderId::new_v4();
        volume.create_vfolder(&vfid, VFolderCreationOptions::new()).await.unwrap();
        assert!(matches!(
            volume.get_quota(&vfid).await,
            Err(VolumeError::CapabilityUnsupported(Capability::Quota))
        ));
        assert!(matches!(
            volume.set_quota(&vfid, 10).await,
            Err(VolumeError::CapabilityUnsupported(Capability::Quota))
        ));
    }

    #[tokio::test]
    async fn test_quota_enforced_on_write() {
        let (volume, _dir) = setup(true).await;
        let vfid = VFolderId::new_v4();
        volume
            .create_vfolder(&vfid, VFolderCreationOptions::new().with_quota(8))
            .await
            .unwrap();

        volume.add_file(&vfid, Path::new("a"), payload(b"12345")).await.unwrap();
        let over = volume.add_file(&vfid, Path::new("b"), payload(b"12345")).await;
        assert!(matches!(over, Err(VolumeError::QuotaExceeded { limit: 8, .. })));
        assert!(!volume.mangle_vfpath(&vfid).join("b").exists());

        let copy = volume.copy_file(&vfid, Path::new("a"), Path::new("c")).await;
        assert!(matches!(copy, Err(VolumeError::QuotaExceeded { .. })));

        // Lowering below usage is accepted, later writes fail
        volume.set_quota(&vfid, 2).await.unwrap();
        let tiny = volume.add_file(&vfid, Path::new("d"), payload(b"1")).await;
        assert!(matches!(tiny, Err(VolumeError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn test_staged_files_count_against_quota() {
        let (volume, _dir) = setup(true).await;
        let vfid = VFolderId::new_v4();
        volume
            .create_vfolder(&vfid, VFolderCreationOptions::new().with_quota(8))
            .await
            .unwrap();
        let session = volume.prepare_upload(&vfid).await.unwrap();
        volume
            .stage_upload(&vfid, &session, Path::new("a"), payload(b"12345"))
            .await
            .unwrap();
        let over = volume
            .stage_upload(&vfid, &session, Path::new("b"), payload(b"12345"))
            .await;
        assert!(matches!(over, Err(VolumeError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn test_fs_usage() {
        let (volume, _dir) = setup(false).await;
        let usage = volume.get_fs_usage().await.unwrap();
        #[cfg(unix)]
        assert!(usage.capacity_bytes > 0);
        assert!(usage.used_bytes <= usage.capacity_bytes);
    }

    #[tokio::test]
    async fn test_performance_metric_is_zero() {
        let (volume, _dir) = setup(false).await;
        assert_eq!(
            volume.get_performance_metric().await.unwrap(),
            FsPerfMetric::default()
        );
    }

    #[tokio::test]
    async fn test_rmdir_rules() {
        let (volume, _dir) = setup(false).await;
        let vfid = VFolderId::new_v4();
        volume.create_vfolder(&vfid, VFolderCreationOptions::new()).await.unwrap();
        volume.mkdir(&vfid, Path::new("a/b"), true).await.unwrap();
        volume.add_file(&vfid, Path::new("a/b/f"), payload(b"x")).await.unwrap();

        let root = volume.rmdir(&vfid, Path::new("."), true).await;
        assert!(matches!(root, Err(VolumeError::InvalidArgument(_))));

        let not_empty = volume.rmdir(&vfid, Path::new("a"), false).await;
        assert!(matches!(not_empty, Err(VolumeError::InvalidArgument(_))));

        let file = volume.rmdir(&vfid, Path::new("a/b/f"), false).await;
        assert!(matches!(file, Err(VolumeError::InvalidArgument(_))));

        volume.rmdir(&vfid, Path::new("a"), true).await.unwrap();
        assert!(!volume.mangle_vfpath(&vfid).join("a").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_delete_removes_link_not_target() {
        let (volume, dir) = setup(false).await;
        let vfid = VFolderId::new_v4();
        volume.create_vfolder(&vfid, VFolderCreationOptions::new()).await.unwrap();
        let outside = dir.path().join("outside.txt");
        std::fs::write(&outside, b"keep me").unwrap();
        std::os::unix::fs::symlink(&outside, volume.mangle_vfpath(&vfid).join("link")).unwrap();

        volume
            .delete_files(&vfid, &[PathBuf::from("link")])
            .await
            .unwrap();
        assert!(outside.exists());
        assert!(std::fs::symlink_metadata(volume.mangle_vfpath(&vfid).join("link")).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_onto_dangling_link_stays_inside() {
        let (volume, dir) = setup(false).await;
        let vfid = VFolderId::new_v4();
        volume.create_vfolder(&vfid, VFolderCreationOptions::new()).await.unwrap();
        volume.add_file(&vfid, Path::new("src.txt"), payload(b"copied")).await.unwrap();

        let outside = dir.path().join("created-outside.txt");
        std::os::unix::fs::symlink(&outside, volume.mangle_vfpath(&vfid).join("link")).unwrap();

        let result = volume
            .copy_file(&vfid, Path::new("src.txt"), Path::new("link"))
            .await;
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
        assert!(!outside.exists());

        // A dangling link that stays inside is written through to its target
        std::os::unix::fs::symlink("later.txt", volume.mangle_vfpath(&vfid).join("alias")).unwrap();
        volume
            .copy_file(&vfid, Path::new("src.txt"), Path::new("alias"))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read(volume.mangle_vfpath(&vfid).join("later.txt")).unwrap(),
            b"copied"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_create_survives_sibling_delete() {
        let (volume, _dir) = setup(false).await;
        let volume = std::sync::Arc::new(volume);

        // Every id shares the ab/cd fan-out bucket
        for round in 0..100u32 {
            let doomed = VFolderId::parse(&format!("abcd{:028x}", round * 2)).unwrap();
            let fresh = VFolderId::parse(&format!("abcd{:028x}", round * 2 + 1)).unwrap();
            volume.create_vfolder(&doomed, VFolderCreationOptions::new()).await.unwrap();

            let deleter = {
                let volume = volume.clone();
                tokio::spawn(async move { volume.delete_vfolder(&doomed).await })
            };
            let creator = {
                let volume = volume.clone();
                tokio::spawn(async move {
                    volume.create_vfolder(&fresh, VFolderCreationOptions::new()).await
                })
            };
            deleter.await.unwrap().unwrap();
            creator.await.unwrap().unwrap();
            assert!(volume.mangle_vfpath(&fresh).is_dir());
            volume.delete_vfolder(&fresh).await.unwrap();
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clone_rebases_absolute_links() {
        let (volume, dir) = setup(false).await;
        let src = VFolderId::new_v4();
        let dst = VFolderId::new_v4();
        volume.create_vfolder(&src, VFolderCreationOptions::new()).await.unwrap();
        volume.add_file(&src, Path::new("data.txt"), payload(b"data")).await.unwrap();

        let src_path = volume.mangle_vfpath(&src);
        std::os::unix::fs::symlink(src_path.join("data.txt"), src_path.join("abs")).unwrap();
        let elsewhere = dir.path().join("elsewhere");
        std::os::unix::fs::symlink(&elsewhere, src_path.join("external")).unwrap();

        volume.clone_vfolder(&src, &dst).await.unwrap();
        let dst_path = volume.mangle_vfpath(&dst);
        assert_eq!(std::fs::read_link(dst_path.join("abs")).unwrap(), dst_path.join("data.txt"));
        assert_eq!(std::fs::read_link(dst_path.join("external")).unwrap(), elsewhere);

        // The clone is independent of its origin
        volume.delete_vfolder(&src).await.unwrap();
        let chunks: Vec<Bytes> = volume
            .read_file(&dst, Path::new("abs"), 0)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"data");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clone_recreates_symlinks() {
        let (volume, _dir) = setup(false).await;
        let src = VFolderId::new_v4();
        let dst = VFolderId::new_v4();
        volume.create_vfolder(&src, VFolderCreationOptions::new()).await.unwrap();
        volume.add_file(&src, Path::new("data.txt"), payload(b"data")).await.unwrap();
        std::os::unix::fs::symlink("data.txt", volume.mangle_vfpath(&src).join("alias")).unwrap();

        volume.clone_vfolder(&src, &dst).await.unwrap();
        let link = volume.mangle_vfpath(&dst).join("alias");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap(), PathBuf::from("data.txt"));
    }
}
