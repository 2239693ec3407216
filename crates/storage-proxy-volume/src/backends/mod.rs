//! Volume backends.
//!
//! Backends implement [`AbstractVolume`](crate::AbstractVolume) for different
//! storage types.

mod vfs;

pub use vfs::{VfsOptions, VfsVolume};
