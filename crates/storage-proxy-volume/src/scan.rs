//! Lazy directory traversal.
//!
//! A [`DirectoryScanner`] turns into a single-pass [`DirEntryStream`]. Nothing
//! happens until the first poll: the relpath is sanitized, the directory is
//! opened, and entries are produced one per poll. Dropping the stream at any
//! point drops the underlying directory handle.
//!
//! Entries are stat'ed without following symlinks, so a scan never reaches
//! outside the vfolder even if a link inside it points elsewhere.

use std::io;
use std::path::{Path, PathBuf};

use futures::StreamExt;
use storage_proxy_types::{DirEntry, DirEntryKind, Stat, VFolderId, VFolderUsage};

use crate::error::{VolumeError, VolumeResult};
use crate::sandbox::PathSandbox;
use crate::volume::DirEntryStream;

/// Producer of one directory listing.
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    sandbox: PathSandbox,
    vfid: VFolderId,
    relpath: Option<PathBuf>,
    limit: usize,
}

/// An opened directory being drained.
struct OpenScan {
    dir: tokio::fs::ReadDir,
    /// Directory path relative to the vfolder root.
    rel_dir: PathBuf,
    produced: usize,
    limit: usize,
}

enum ScanState {
    Pending(DirectoryScanner),
    Open(OpenScan),
    Done,
}

impl DirectoryScanner {
    /// Scan `relpath` (or the vfolder root) producing at most `limit`
    /// entries; `0` means unlimited.
    pub fn new(
        sandbox: PathSandbox,
        vfid: VFolderId,
        relpath: Option<PathBuf>,
        limit: usize,
    ) -> Self {
        Self {
            sandbox,
            vfid,
            relpath,
            limit,
        }
    }

    /// Turn the scanner into a lazy stream.
    pub fn into_stream(self) -> DirEntryStream {
        futures::stream::unfold(ScanState::Pending(self), next_entry).boxed()
    }

    async fn open(self) -> VolumeResult<OpenScan> {
        let sandbox = self.sandbox.clone();
        let vfid = self.vfid;
        let relpath = self.relpath.clone();
        let dir_path =
            tokio::task::spawn_blocking(move || sandbox.sanitize(&vfid, relpath.as_deref()))
                .await??;

        let meta = tokio::fs::metadata(&dir_path)
            .await
            .map_err(|e| VolumeError::from_io(e, &dir_path))?;
        if !meta.is_dir() {
            return Err(VolumeError::invalid_argument(format!(
                "not a directory: {}",
                self.relpath.as_deref().unwrap_or(Path::new(".")).display()
            )));
        }

        let dir = tokio::fs::read_dir(&dir_path)
            .await
            .map_err(|e| VolumeError::from_io(e, &dir_path))?;

        tracing::debug!(vfid = %self.vfid, path = %dir_path.display(), "scandir opened");

        Ok(OpenScan {
            dir,
            rel_dir: self.sandbox.relative_to_vfolder(&self.vfid, &dir_path),
            produced: 0,
            limit: self.limit,
        })
    }
}

async fn next_entry(mut state: ScanState) -> Option<(VolumeResult<DirEntry>, ScanState)> {
    loop {
        match state {
            ScanState::Done => return None,
            ScanState::Pending(scanner) => match scanner.open().await {
                Ok(open) => state = ScanState::Open(open),
                Err(e) => return Some((Err(e), ScanState::Done)),
            },
            ScanState::Open(mut open) => {
                if open.limit != 0 && open.produced >= open.limit {
                    tracing::debug!(limit = open.limit, "scandir limit reached");
                    return None;
                }
                match open.dir.next_entry().await {
                    Ok(Some(entry)) => match to_dir_entry(&open.rel_dir, &entry).await {
                        Ok(dir_entry) => {
                            open.produced += 1;
                            return Some((Ok(dir_entry), ScanState::Open(open)));
                        }
                        // Removed between listing and stat; no snapshot isolation
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {
                            state = ScanState::Open(open);
                        }
                        Err(e) => return Some((Err(e.into()), ScanState::Done)),
                    },
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e.into()), ScanState::Done)),
                }
            }
        }
    }
}

async fn to_dir_entry(rel_dir: &Path, entry: &tokio::fs::DirEntry) -> io::Result<DirEntry> {
    // Does not traverse symlinks
    let meta = entry.metadata().await?;
    let name = entry.file_name().to_string_lossy().into_owned();
    Ok(DirEntry {
        path: rel_dir.join(&name),
        name,
        kind: DirEntryKind::from_file_type(&meta.file_type()),
        stat: Stat::from_metadata(&meta),
    })
}

/// Count regular files and their bytes beneath `root` (blocking).
///
/// Symlinks are neither followed nor counted. A missing `root` is NotFound;
/// entries vanishing mid-walk are skipped.
pub fn walk_usage(root: &Path) -> io::Result<VFolderUsage> {
    let mut usage = VFolderUsage::default();
    let meta = std::fs::symlink_metadata(root)?;
    if meta.is_file() {
        usage.file_count = 1;
        usage.used_bytes = meta.len();
        return Ok(usage);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            let ft = match entry.file_type() {
                Ok(ft) => ft,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if ft.is_dir() {
                pending.push(entry.path());
            } else if ft.is_file() {
                match entry.metadata() {
                    Ok(meta) => {
                        usage.file_count += 1;
                        usage.used_bytes += meta.len();
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(usage)
}
