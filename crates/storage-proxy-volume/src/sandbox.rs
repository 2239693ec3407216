//! Vfolder addressing and path sandboxing.
//!
//! [`PathSandbox::mangle`] maps a vfolder id onto its physical directory:
//!
//! ```text
//! 12345678123456781234567812345678
//! ├┘├┘└──────────┬───────────────┘
//! 12 34 5678123456781234567812345678
//!
//! <root>/12/34/5678123456781234567812345678
//! ```
//!
//! [`PathSandbox::sanitize`] is the single checkpoint every `(vfid, relpath)`
//! operation passes before touching storage: join, fully resolve (`.`, `..`
//! and symlinks), then verify the result is the vfolder directory or lies
//! beneath it.
//!
//! ## Symlinks
//!
//! Resolution follows symlinks *before* the containment check, dangling ones
//! included. A link planted inside a vfolder that points outside of it
//! therefore resolves outside and is rejected with
//! [`VolumeError::PathEscape`]; a link that stays inside is honoured. Directory scans never follow links at all.
//!
//! Resolution touches the filesystem (it canonicalizes the longest existing
//! prefix), so async callers must run [`PathSandbox::sanitize`] on the
//! blocking pool.

use std::io;
use std::path::{Component, Path, PathBuf};

use storage_proxy_types::VFolderId;

use crate::error::{VolumeError, VolumeResult};

/// Name of the volume-private directory under the root.
///
/// Mangled vfolder directories are two hex digits at the top level, so this
/// name can never collide with one.
pub const RESERVED_DIR: &str = ".storage-proxy";

/// Addressing and containment rules for one volume root.
#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    /// Create a sandbox for the given volume root.
    ///
    /// The root is canonicalized at construction time so that symlinks in the
    /// mount path itself (e.g. macOS `/tmp` → `/private/tmp`) don't make every
    /// resolved path look like an escape.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Self { root }
    }

    /// The (canonical) volume root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Volume-private area for metadata, quota records and upload staging.
    pub fn reserved_dir(&self) -> PathBuf {
        self.root.join(RESERVED_DIR)
    }

    /// Physical directory of a vfolder. Pure and deterministic.
    pub fn mangle(&self, vfid: &VFolderId) -> PathBuf {
        let (prefix1, prefix2, rest) = vfid.shard_segments();
        self.root.join(prefix1).join(prefix2).join(rest)
    }

    /// Resolve `relpath` inside the vfolder and verify containment.
    ///
    /// `None` means the vfolder root itself.
    pub fn sanitize(&self, vfid: &VFolderId, relpath: Option<&Path>) -> VolumeResult<PathBuf> {
        let vfpath = self.mangle(vfid);
        let joined = match relpath {
            Some(rel) => vfpath.join(rel),
            None => vfpath.clone(),
        };

        let target = resolve(&joined).map_err(|e| match e.kind() {
            io::ErrorKind::InvalidInput => VolumeError::invalid_argument(format!(
                "{}: {e}",
                relpath.unwrap_or(Path::new(".")).display()
            )),
            _ => VolumeError::from_io(e, &joined),
        })?;

        if !target.starts_with(&vfpath) {
            tracing::warn!(
                vfid = %vfid,
                relpath = %relpath.unwrap_or(Path::new(".")).display(),
                "rejected path outside of vfolder"
            );
            return Err(VolumeError::path_escape(format!(
                "{} is not under vfolder {}",
                relpath.unwrap_or(Path::new(".")).display(),
                vfid
            )));
        }

        Ok(target)
    }

    /// Like [`sanitize`](Self::sanitize), but leaves the final component
    /// unresolved.
    ///
    /// Operations on a directory entry itself (unlink, rmdir, rename source)
    /// must act on a symlink rather than on what it points to. The parent is
    /// resolved and verified; the leaf name is appended verbatim.
    pub fn sanitize_entry(&self, vfid: &VFolderId, relpath: &Path) -> VolumeResult<PathBuf> {
        match (relpath.parent(), relpath.file_name()) {
            (Some(parent), Some(name)) => Ok(self.sanitize(vfid, Some(parent))?.join(name)),
            _ => self.sanitize(vfid, Some(relpath)),
        }
    }

    /// Express an already-sanitized path relative to the vfolder directory.
    pub fn relative_to_vfolder(&self, vfid: &VFolderId, path: &Path) -> PathBuf {
        path.strip_prefix(self.mangle(vfid))
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Symlink hops followed before resolution gives up (Linux `SYMLOOP_MAX`).
const MAX_LINK_DEPTH: usize = 40;

/// Fully resolve `path` without requiring it to exist.
///
/// The longest existing prefix is canonicalized (following `.`, `..` and
/// symlinks); the remaining tail is applied lexically. A dangling symlink in
/// the tail fails canonicalization yet still redirects anything created
/// through it, so it is followed by hand.
pub fn resolve(path: &Path) -> io::Result<PathBuf> {
    resolve_at_depth(path, 0)
}

fn resolve_at_depth(path: &Path, depth: usize) -> io::Result<PathBuf> {
    let components: Vec<Component<'_>> = path.components().collect();

    let mut split = components.len();
    let mut base = None;
    while split > 0 {
        let prefix: PathBuf = components[..split].iter().collect();
        match dunce::canonicalize(&prefix) {
            Ok(canonical) => {
                base = Some(canonical);
                break;
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory) => {
                split -= 1;
            }
            Err(e) => return Err(e),
        }
    }

    let mut resolved = base.unwrap_or_default();
    for (i, component) in components.iter().enumerate().skip(split) {
        match component {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            Component::Normal(name) => {
                resolved.push(name);
                if let Ok(target) = std::fs::read_link(&resolved) {
                    if depth >= MAX_LINK_DEPTH {
                        return Err(io::Error::other(format!(
                            "too many levels of symbolic links: {}",
                            path.display()
                        )));
                    }
                    // Relative targets are relative to the link's directory
                    let mut next = resolved.parent().map(Path::to_path_buf).unwrap_or_default();
                    next.push(target);
                    next.extend(&components[i + 1..]);
                    return resolve_at_depth(&next, depth + 1);
                }
            }
            Component::RootDir | Component::Prefix(_) => resolved.push(component.as_os_str()),
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vfid() -> VFolderId {
        VFolderId::parse("12345678123456781234567812345678").unwrap()
    }

    fn setup() -> (PathSandbox, TempDir) {
        let dir = TempDir::new().unwrap();
        let sandbox = PathSandbox::new(dir.path());
        (sandbox, dir)
    }

    #[test]
    fn test_mangle_layout() {
        let sandbox = PathSandbox::new("/nonexistent/mount");
        assert_eq!(
            sandbox.mangle(&vfid()),
            PathBuf::from("/nonexistent/mount/12/34/5678123456781234567812345678")
        );
    }

    #[test]
    fn test_mangle_is_deterministic_and_distinct() {
        let sandbox = PathSandbox::new("/mnt/vol");
        let a = VFolderId::new_v4();
        let b = VFolderId::new_v4();
        assert_eq!(sandbox.mangle(&a), sandbox.mangle(&a));
        assert_ne!(sandbox.mangle(&a), sandbox.mangle(&b));

        // Same shard prefix, different tail
        let c = VFolderId::parse("12340000000000000000000000000000").unwrap();
        let d = VFolderId::parse("12340000000000000000000000000001").unwrap();
        assert_ne!(sandbox.mangle(&c), sandbox.mangle(&d));
    }

    #[test]
    fn test_sanitize_none_is_mangle() {
        let (sandbox, _dir) = setup();
        let id = vfid();
        assert_eq!(sandbox.sanitize(&id, None).unwrap(), sandbox.mangle(&id));

        std::fs::create_dir_all(sandbox.mangle(&id)).unwrap();
        assert_eq!(sandbox.sanitize(&id, None).unwrap(), sandbox.mangle(&id));
    }

    #[test]
    fn test_sanitize_inside() {
        let (sandbox, _dir) = setup();
        let id = vfid();
        std::fs::create_dir_all(sandbox.mangle(&id).join("a")).unwrap();

        let p = sandbox.sanitize(&id, Some(Path::new("a/../b/c.txt"))).unwrap();
        assert_eq!(p, sandbox.mangle(&id).join("b/c.txt"));

        let p = sandbox.sanitize(&id, Some(Path::new("./a"))).unwrap();
        assert_eq!(p, sandbox.mangle(&id).join("a"));
    }

    #[test]
    fn test_sanitize_traversal_escape() {
        let (sandbox, _dir) = setup();
        let id = vfid();

        // Vfolder missing: resolution is purely lexical
        let result = sandbox.sanitize(&id, Some(Path::new("../../etc/passwd")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));

        std::fs::create_dir_all(sandbox.mangle(&id)).unwrap();
        let result = sandbox.sanitize(&id, Some(Path::new("../../etc/passwd")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));

        let result = sandbox.sanitize(&id, Some(Path::new("missing/../../sibling")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
    }

    #[test]
    fn test_sanitize_parent_of_root_escapes() {
        let (sandbox, _dir) = setup();
        let id = vfid();
        std::fs::create_dir_all(sandbox.mangle(&id)).unwrap();
        let result = sandbox.sanitize(&id, Some(Path::new("..")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
    }

    #[test]
    fn test_sanitize_absolute_escapes() {
        let (sandbox, _dir) = setup();
        let result = sandbox.sanitize(&vfid(), Some(Path::new("/etc/passwd")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
    }

    #[test]
    fn test_sanitize_prefix_sibling_is_not_inside() {
        let (sandbox, _dir) = setup();
        let id = vfid();
        let vfpath = sandbox.mangle(&id);
        // A sibling whose name extends the vfolder's name
        let sibling_name = format!(
            "{}extra",
            vfpath.file_name().unwrap().to_string_lossy()
        );
        let result = sandbox.sanitize(&id, Some(&Path::new("..").join(sibling_name)));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_to_outside_rejected() {
        let (sandbox, dir) = setup();
        let id = vfid();
        let vfpath = sandbox.mangle(&id);
        std::fs::create_dir_all(&vfpath).unwrap();

        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("secret.txt"), b"secret").unwrap();
        std::os::unix::fs::symlink(&outside, vfpath.join("escape")).unwrap();

        let result = sandbox.sanitize(&id, Some(Path::new("escape/secret.txt")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));

        // Even for a not-yet-existing target beneath the link
        let result = sandbox.sanitize(&id, Some(Path::new("escape/new.txt")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_to_outside_rejected() {
        let (sandbox, dir) = setup();
        let id = vfid();
        let vfpath = sandbox.mangle(&id);
        std::fs::create_dir_all(&vfpath).unwrap();

        // Neither the link target nor its directory exist yet
        let outside = dir.path().join("later/created.txt");
        std::os::unix::fs::symlink(&outside, vfpath.join("dangling")).unwrap();

        let result = sandbox.sanitize(&id, Some(Path::new("dangling")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
        let result = sandbox.sanitize(&id, Some(Path::new("dangling/below")));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_inside_followed() {
        let (sandbox, _dir) = setup();
        let id = vfid();
        let vfpath = sandbox.mangle(&id);
        std::fs::create_dir_all(&vfpath).unwrap();
        std::os::unix::fs::symlink("future.txt", vfpath.join("pending")).unwrap();

        let p = sandbox.sanitize(&id, Some(Path::new("pending"))).unwrap();
        assert_eq!(p, vfpath.join("future.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_loop_is_an_error() {
        let (sandbox, _dir) = setup();
        let id = vfid();
        let vfpath = sandbox.mangle(&id);
        std::fs::create_dir_all(&vfpath).unwrap();
        std::os::unix::fs::symlink("b", vfpath.join("a")).unwrap();
        std::os::unix::fs::symlink("a", vfpath.join("b")).unwrap();

        assert!(sandbox.sanitize(&id, Some(Path::new("a"))).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_followed() {
        let (sandbox, _dir) = setup();
        let id = vfid();
        let vfpath = sandbox.mangle(&id);
        std::fs::create_dir_all(vfpath.join("real")).unwrap();
        std::os::unix::fs::symlink(vfpath.join("real"), vfpath.join("alias")).unwrap();

        let p = sandbox.sanitize(&id, Some(Path::new("alias/file.txt"))).unwrap();
        assert_eq!(p, vfpath.join("real/file.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_sanitize_entry_keeps_leaf_link() {
        let (sandbox, dir) = setup();
        let id = vfid();
        let vfpath = sandbox.mangle(&id);
        std::fs::create_dir_all(vfpath.join("sub")).unwrap();
        std::os::unix::fs::symlink(dir.path(), vfpath.join("sub/out")).unwrap();

        // The link itself is addressable even though its target is outside
        let p = sandbox.sanitize_entry(&id, Path::new("sub/out")).unwrap();
        assert_eq!(p, vfpath.join("sub/out"));

        let result = sandbox.sanitize_entry(&id, Path::new("sub/out/file"));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
    }

    #[test]
    fn test_sanitize_entry_root_and_escape() {
        let (sandbox, _dir) = setup();
        let id = vfid();
        std::fs::create_dir_all(sandbox.mangle(&id)).unwrap();

        assert_eq!(
            sandbox.sanitize_entry(&id, Path::new(".")).unwrap(),
            sandbox.mangle(&id)
        );
        let result = sandbox.sanitize_entry(&id, Path::new("../sibling"));
        assert!(matches!(result, Err(VolumeError::PathEscape(_))));
        let result = sandbox.sanitize_entry(&id, Path::new("a/.."));
        assert_eq!(result.unwrap(), sandbox.mangle(&id));
    }

    #[test]
    fn test_resolve_file_parent() {
        let dir = TempDir::new().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        std::fs::write(root.join("f"), b"x").unwrap();
        // "f/.." is not a directory on disk; the tail is applied lexically
        assert_eq!(resolve(&root.join("f/..")).unwrap(), root);
    }

    #[test]
    fn test_relative_to_vfolder() {
        let sandbox = PathSandbox::new("/mnt/vol");
        let id = vfid();
        let abs = sandbox.mangle(&id).join("docs/readme.md");
        assert_eq!(
            sandbox.relative_to_vfolder(&id, &abs),
            PathBuf::from("docs/readme.md")
        );
    }
}
