//! Volume registry: name → volume routing.
//!
//! Every worker builds its own registry from configuration, so there is no
//! cross-worker sharing and the table is immutable once built. Optional
//! operations go through the registry's gated helpers, which check the
//! volume's advertised capabilities before calling into the backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use storage_proxy_types::{Capability, CapabilitySet, FsPerfMetric, VFolderId};

use crate::backends::VfsVolume;
use crate::error::{VolumeError, VolumeResult};
use crate::volume::{AbstractVolume, VolumeContext, VolumeInfo};

/// Summary of a registered volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSummary {
    pub name: String,
    pub backend: String,
    pub capabilities: CapabilitySet,
}

/// Construct a backend by name.
pub fn build_volume(info: VolumeInfo, ctx: VolumeContext) -> VolumeResult<Arc<dyn AbstractVolume>> {
    match info.backend.as_str() {
        "vfs" => Ok(Arc::new(VfsVolume::new(info, ctx)?)),
        other => Err(VolumeError::UnknownBackend(other.to_string())),
    }
}

/// Backend names [`build_volume`] understands.
pub const KNOWN_BACKENDS: &[&str] = &["vfs"];

/// Routes requests to volumes by name.
#[derive(Default)]
pub struct VolumeRegistry {
    volumes: BTreeMap<String, Arc<dyn AbstractVolume>>,
}

impl std::fmt::Debug for VolumeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeRegistry")
            .field("volumes", &self.volumes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one volume per entry.
    pub fn from_infos<I>(infos: I, ctx: &VolumeContext) -> VolumeResult<Self>
    where
        I: IntoIterator<Item = (String, VolumeInfo)>,
    {
        let mut registry = Self::new();
        for (name, info) in infos {
            let volume = build_volume(info, ctx.clone())?;
            registry.insert(name, volume);
        }
        Ok(registry)
    }

    /// Register a volume. Replaces any volume of the same name.
    pub fn insert(&mut self, name: impl Into<String>, volume: Arc<dyn AbstractVolume>) {
        self.volumes.insert(name.into(), volume);
    }

    /// Look up a volume.
    pub fn get(&self, name: &str) -> VolumeResult<Arc<dyn AbstractVolume>> {
        self.volumes
            .get(name)
            .cloned()
            .ok_or_else(|| VolumeError::UnknownVolume(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.volumes.keys().map(String::as_str)
    }

    /// Name, backend and capabilities of every volume.
    pub async fn list(&self) -> Vec<VolumeSummary> {
        let mut out = Vec::with_capacity(self.volumes.len());
        for (name, volume) in &self.volumes {
            out.push(VolumeSummary {
                name: name.clone(),
                backend: volume.info().backend.clone(),
                capabilities: volume.get_capabilities().await,
            });
        }
        out
    }

    /// Initialize every volume, stopping at the first failure.
    pub async fn init_all(&self) -> VolumeResult<()> {
        for (name, volume) in &self.volumes {
            volume.init().await.inspect_err(|e| {
                tracing::error!(volume = %name, "volume init failed: {}", e);
            })?;
        }
        Ok(())
    }

    /// Shut down every volume. Failures are logged; the first is returned.
    pub async fn shutdown_all(&self) -> VolumeResult<()> {
        let mut first_error = None;
        for (name, volume) in &self.volumes {
            if let Err(e) = volume.shutdown().await {
                tracing::warn!(volume = %name, "volume shutdown failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Discard expired upload sessions on every volume.
    pub async fn reap_expired_uploads(&self) -> usize {
        let mut reaped = 0;
        for volume in self.volumes.values() {
            reaped += volume.reap_expired_uploads().await;
        }
        reaped
    }

    /// Fetch a volume that advertises `cap`.
    pub async fn require(
        &self,
        name: &str,
        cap: Capability,
    ) -> VolumeResult<Arc<dyn AbstractVolume>> {
        let volume = self.get(name)?;
        volume
            .get_capabilities()
            .await
            .require(cap)
            .map_err(VolumeError::CapabilityUnsupported)?;
        Ok(volume)
    }

    pub async fn get_quota(&self, name: &str, vfid: &VFolderId) -> VolumeResult<u64> {
        self.require(name, Capability::Quota)
            .await?
            .get_quota(vfid)
            .await
    }

    pub async fn set_quota(&self, name: &str, vfid: &VFolderId, size_bytes: u64) -> VolumeResult<()> {
        self.require(name, Capability::Quota)
            .await?
            .set_quota(vfid, size_bytes)
            .await
    }

    pub async fn get_performance_metric(&self, name: &str) -> VolumeResult<FsPerfMetric> {
        self.require(name, Capability::Metric)
            .await?
            .get_performance_metric()
            .await
    }
}
