//! Capability vocabulary advertised by volume backends.
//!
//! The vocabulary is closed: a backend may advertise any subset of these four
//! flags and nothing else. Callers check the set before invoking the quota
//! and metric operation families.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString, IntoEnumIterator};

/// An optional feature a backend may support.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, EnumString,
    EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum Capability {
    /// Virtual folder management (create/delete/clone/...).
    #[serde(rename = "vfolder")]
    #[strum(serialize = "vfolder")]
    VFolder,
    /// Usage and performance metrics.
    #[serde(rename = "metric")]
    #[strum(serialize = "metric")]
    Metric,
    /// Per-vfolder quota enforcement.
    #[serde(rename = "quota")]
    #[strum(serialize = "quota")]
    Quota,
    /// Directory enumeration faster than a naive traversal.
    #[serde(rename = "fast-scan")]
    #[strum(serialize = "fast-scan")]
    FastScan,
}

impl Capability {
    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::VFolder => "vfolder",
            Capability::Metric => "metric",
            Capability::Quota => "quota",
            Capability::FastScan => "fast-scan",
        }
    }

    /// Every capability in the vocabulary.
    pub fn all() -> impl Iterator<Item = Capability> {
        Self::iter()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The set of capabilities a backend declares.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability (builder style).
    pub fn with(mut self, cap: Capability) -> Self {
        self.0.insert(cap);
        self
    }

    /// Add a capability.
    pub fn insert(&mut self, cap: Capability) -> bool {
        self.0.insert(cap)
    }

    /// Whether `cap` is advertised.
    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Iterate in vocabulary order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fail with the missing capability unless it is advertised.
    pub fn require(&self, cap: Capability) -> Result<(), Capability> {
        if self.contains(cap) { Ok(()) } else { Err(cap) }
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Capability::as_str).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}
