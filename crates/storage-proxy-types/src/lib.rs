//! Shared identity and value types for the storage proxy.
//!
//! A pure leaf crate: typed ids, the capability vocabulary, and the snapshot
//! value types that cross the volume contract. No I/O lives here.
//!
//! # Key Types
//!
//! |---------------------------|---------------------------------------------|
//! | Type                      | Purpose                                     |
//! |---------------------------|---------------------------------------------|
//! | [`VFolderId`]             | Which virtual folder (caller-assigned)      |
//! | [`UploadSessionId`]       | Which upload staging session                |
//! | [`Capability`]            | One optional backend feature                |
//! | [`CapabilitySet`]         | What a backend advertises                   |
//! | [`DirEntry`]              | One listed filesystem entry                 |
//! | [`FsUsage`]               | Volume-wide capacity/usage snapshot         |
//! | [`VFolderUsage`]          | Per-vfolder usage snapshot                  |
//! | [`FsPerfMetric`]          | Volume performance counters                 |
//! |---------------------------|---------------------------------------------|

pub mod capability;
pub mod ids;
pub mod types;

pub use capability::{Capability, CapabilitySet};
pub use ids::{UploadSessionId, VFolderId};
pub use types::{
    DirEntry, DirEntryKind, FsPerfMetric, FsUsage, Stat, VFolderCreationOptions, VFolderUsage,
};
