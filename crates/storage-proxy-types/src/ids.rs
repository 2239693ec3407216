//! Typed identifiers for virtual folders and upload sessions.
//!
//! Both wrap a UUID. They're opaque on the wire (16 bytes or UUID text) and
//! display as standard hyphenated UUID text for logging. The `short()` form
//! (first 8 hex chars) is for log lines and Debug output only; it is never used as a
//! lookup key.
//!
//! A [`VFolderId`] is always assigned by the caller. This layer never invents
//! one; `new_v4()` exists for callers and tests.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A virtual folder identifier (128-bit, caller-assigned).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VFolderId(uuid::Uuid);

/// An upload session token (UUIDv4, volume-assigned).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadSessionId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Create a new random ID (UUIDv4).
            pub fn new_v4() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// First 8 hex characters, for human display only. Not for lookup.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Full 32-character lowercase hex string (no hyphens).
            pub fn to_hex(&self) -> String {
                self.0.as_simple().to_string()
            }

            /// The raw 16 bytes.
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Reconstruct from 16 bytes.
            pub fn from_bytes(b: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(b))
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                uuid::Uuid::parse_str(s).map(Self)
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl From<$T> for uuid::Uuid {
            fn from(id: $T) -> uuid::Uuid {
                id.0
            }
        }

        impl From<[u8; 16]> for $T {
            fn from(b: [u8; 16]) -> Self {
                Self::from_bytes(b)
            }
        }

        impl FromStr for $T {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }
    };
}

impl_typed_id!(VFolderId, "VFolderId");
impl_typed_id!(UploadSessionId, "UploadSessionId");

impl fmt::Display for VFolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full UUID with hyphens for log readability
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UploadSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Session tokens travel in URLs; no hyphens
        write!(f, "{}", self.0.as_simple())
    }
}

impl VFolderId {
    /// Split the hex form into the three mangling segments: 2, 2 and 28 digits.
    ///
    /// The two leading 2-digit segments give a 256 × 256 fan-out, so no single
    /// directory on the backend ever holds more than a bounded share of vfolders.
    pub fn shard_segments(&self) -> (String, String, String) {
        let hex = self.to_hex();
        (hex[0..2].to_string(), hex[2..4].to_string(), hex[4..].to_string())
    }
}
