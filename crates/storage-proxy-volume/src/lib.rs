//! # storage-proxy-volume
//!
//! Volume abstraction of the storage proxy.
//!
//! A volume is one storage backend bound to one physical mount. It hosts many
//! vfolders, each addressed by a [`VFolderId`](storage_proxy_types::VFolderId)
//! and laid out under the root by a deterministic two-level hex fan-out.
//! Key components:
//!
//! - [`AbstractVolume`] - The contract every backend implements
//! - [`PathSandbox`] - Mangling and the resolve-then-verify path checkpoint
//! - [`DirectoryScanner`] - Lazy, cancellable directory listings
//! - [`UploadSessions`] - Staged uploads published by atomic rename
//! - [`VolumeRegistry`] - Name → volume routing with capability gating
//! - [`VfsVolume`] - Plain local filesystem backend
//!
//! ## Design Decisions
//!
//! - **One checkpoint**: every `(vfid, relpath)` is sanitized before I/O;
//!   symlinks are followed during resolution and the result must stay inside
//!   the vfolder.
//! - **Capabilities, not stubs**: optional behaviour is advertised through
//!   [`CapabilitySet`](storage_proxy_types::CapabilitySet) and gated by the
//!   registry.
//! - **Streams are single-pass**: scans and reads suspend per element and
//!   release their handles on drop.

pub mod backends;
mod error;
mod registry;
mod sandbox;
mod scan;
mod upload;
mod volume;

pub use backends::{VfsOptions, VfsVolume};
pub use error::{VolumeError, VolumeResult};
pub use registry::{KNOWN_BACKENDS, VolumeRegistry, VolumeSummary, build_volume};
pub use sandbox::{PathSandbox, RESERVED_DIR, resolve};
pub use scan::{DirectoryScanner, walk_usage};
pub use upload::{EphemeralSession, QuotaBudget, StagedFile, UploadSession, UploadSessions, WriteBudget};
pub use volume::{
    AbstractVolume, ByteStream, CHUNK_SIZE_UNSET, ChunkStream, DEFAULT_CHUNK_SIZE, DirEntryStream,
    VolumeContext, VolumeInfo,
};
