//! Value types exchanged across the volume contract.
//!
//! None of these carry identity. Usage and metric types are snapshots that
//! are recomputed on every query; directory entries describe one filesystem
//! entry at the moment it was listed.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirEntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link (reported, never followed).
    Symlink,
    /// Sockets, fifos, devices.
    Other,
}

impl DirEntryKind {
    /// Classify a `std::fs::FileType` without following links.
    pub fn from_file_type(ft: &std::fs::FileType) -> Self {
        if ft.is_symlink() {
            DirEntryKind::Symlink
        } else if ft.is_dir() {
            DirEntryKind::Directory
        } else if ft.is_file() {
            DirEntryKind::File
        } else {
            DirEntryKind::Other
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, DirEntryKind::File)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, DirEntryKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self, DirEntryKind::Symlink)
    }
}

/// Basic stat attributes of a directory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat {
    /// Size in bytes (link size for symlinks).
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
    /// Last modification time.
    pub modified: SystemTime,
    /// Creation time, when the platform reports one.
    pub created: Option<SystemTime>,
}

impl Stat {
    /// Build from metadata obtained without following links.
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = if meta.permissions().readonly() { 0o444 } else { 0o644 };

        Self {
            size: meta.len(),
            mode,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            created: meta.created().ok(),
        }
    }
}

/// One entry yielded by a directory scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Path relative to the vfolder root.
    pub path: PathBuf,
    /// Entry type.
    pub kind: DirEntryKind,
    /// Stat snapshot.
    pub stat: Stat,
}

/// Options accepted by `create_vfolder`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VFolderCreationOptions {
    /// Initial quota in bytes. Requires the quota capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<u64>,
}

impl VFolderCreationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial quota.
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota = Some(bytes);
        self
    }
}

/// Capacity and usage of a whole volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsUsage {
    /// Total bytes available to the volume.
    pub capacity_bytes: u64,
    /// Bytes in use.
    pub used_bytes: u64,
}

impl FsUsage {
    /// Bytes still free.
    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

/// Usage of one vfolder subtree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VFolderUsage {
    /// Number of regular files.
    pub file_count: u64,
    /// Sum of regular file sizes.
    pub used_bytes: u64,
}

/// Performance counters of a volume. Zero where the backend cannot tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FsPerfMetric {
    pub iops_read: f64,
    pub iops_write: f64,
    pub io_bytes_read: f64,
    pub io_bytes_write: f64,
    pub io_usec_read: f64,
    pub io_usec_write: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind_predicates() {
        assert!(DirEntryKind::File.is_file());
        assert!(!DirEntryKind::File.is_dir());
        assert!(DirEntryKind::Directory.is_dir());
        assert!(DirEntryKind::Symlink.is_symlink());
        assert!(!DirEntryKind::Other.is_file());
    }

    #[test]
    fn test_entry_kind_serde() {
        let json = serde_json::to_string(&DirEntryKind::Directory).unwrap();
        assert_eq!(json, "\"directory\"");
    }

    #[test]
    fn test_creation_options_builder() {
        let opts = VFolderCreationOptions::new().with_quota(1024);
        assert_eq!(opts.quota, Some(1024));
        assert_eq!(VFolderCreationOptions::default().quota, None);
    }

    #[test]
    fn test_free_bytes_saturates() {
        let usage = FsUsage {
            capacity_bytes: 100,
            used_bytes: 40,
        };
        assert_eq!(usage.free_bytes(), 60);

        let odd = FsUsage {
            capacity_bytes: 10,
            used_bytes: 40,
        };
        assert_eq!(odd.free_bytes(), 0);
    }

    #[test]
    fn test_perf_metric_default_is_zero() {
        let m = FsPerfMetric::default();
        assert_eq!(m.iops_read, 0.0);
        assert_eq!(m.io_bytes_write, 0.0);
    }
}
