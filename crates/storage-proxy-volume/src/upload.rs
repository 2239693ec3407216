//! Upload staging sessions.
//!
//! Every upload is first streamed into a private staging directory and only
//! renamed onto its destination once the payload completed. A partially
//! written file is therefore never visible at its final path.
//!
//! ```text
//! <root>/.storage-proxy/uploads/
//! └── <node-id>/                   one per proxy node sharing the volume
//!     └── <pid>/                   one per proxy process
//!         └── <session>/           one per prepare()
//!             ├── <uuid>.part      one per staged payload
//!             └── <uuid>.part
//! ```
//!
//! The staging area lives outside every vfolder subtree, so no sandboxed
//! relpath can reach it. Sessions are in-memory only: [`UploadSessions::init`]
//! wipes whatever earlier processes of the same node left behind. Other
//! nodes' directories are never touched. Workers of the same process share
//! the per-process directory, each tracking its own sessions.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use storage_proxy_types::{UploadSessionId, VFolderId};

use crate::error::{VolumeError, VolumeResult};
use crate::volume::ByteStream;

/// Limits enforced while a payload streams in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBudget {
    /// Maximum size of a single payload.
    pub max_upload_size: u64,
    /// Vfolder quota and its usage before this write, when enforced.
    pub quota: Option<QuotaBudget>,
}

/// Quota headroom of one vfolder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaBudget {
    pub limit: u64,
    pub used: u64,
}

impl WriteBudget {
    /// Budget with only the upload size ceiling.
    pub fn unbounded_quota(max_upload_size: u64) -> Self {
        Self {
            max_upload_size,
            quota: None,
        }
    }

    pub(crate) fn check(&self, written: u64) -> VolumeResult<()> {
        if written > self.max_upload_size {
            return Err(VolumeError::PayloadTooLarge {
                limit: self.max_upload_size,
            });
        }
        if let Some(quota) = self.quota {
            let attempted = quota.used.saturating_add(written);
            if attempted > quota.limit {
                return Err(VolumeError::QuotaExceeded {
                    limit: quota.limit,
                    attempted,
                });
            }
        }
        Ok(())
    }
}

/// A payload sitting in staging, waiting for commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Temp file inside the session directory.
    pub temp_path: PathBuf,
    /// Sanitized final path.
    pub destination: PathBuf,
    /// Bytes written.
    pub size: u64,
}

/// State of one upload session.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: UploadSessionId,
    pub vfid: VFolderId,
    /// Private staging directory.
    pub dir: PathBuf,
    pub created_at: Instant,
    last_activity: Instant,
    staged: Vec<StagedFile>,
}

impl UploadSession {
    /// Files staged so far, in staging order.
    pub fn staged(&self) -> &[StagedFile] {
        &self.staged
    }

    fn is_expired(&self, now: Instant, expire: Duration) -> bool {
        now.duration_since(self.last_activity) > expire
    }
}

/// Upload sessions of one volume.
///
/// Thread-safe via internal `DashMap`; callers never lock.
#[derive(Debug)]
pub struct UploadSessions {
    node_dir: PathBuf,
    staging_root: PathBuf,
    expire: Duration,
    sessions: DashMap<UploadSessionId, UploadSession>,
}

impl UploadSessions {
    /// Create the session table of node `node_id` under an uploads
    /// directory.
    pub fn new(uploads_dir: impl Into<PathBuf>, node_id: &str, expire: Duration) -> Self {
        let node_dir = uploads_dir.into().join(node_id);
        let staging_root = node_dir.join(std::process::id().to_string());
        Self {
            node_dir,
            staging_root,
            expire,
            sessions: DashMap::new(),
        }
    }

    /// This process' staging directory.
    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of a session.
    pub fn get(&self, id: &UploadSessionId) -> Option<UploadSession> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// Discard leftovers of earlier processes of this node and create the
    /// staging root.
    pub async fn init(&self) -> VolumeResult<()> {
        let mut discarded = 0;
        match tokio::fs::read_dir(&self.node_dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if path == self.staging_root {
                        continue;
                    }
                    let removed = match tokio::fs::remove_dir_all(&path).await {
                        Err(e) if e.kind() == std::io::ErrorKind::NotADirectory => {
                            tokio::fs::remove_file(&path).await
                        }
                        other => other,
                    };
                    match removed {
                        Ok(()) => discarded += 1,
                        // Sibling workers race us to the same leftovers
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(VolumeError::BackendIo(e)),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(VolumeError::BackendIo(e)),
        }
        if discarded > 0 {
            tracing::info!(
                path = %self.node_dir.display(),
                discarded,
                "discarded stale upload staging"
            );
        }
        tokio::fs::create_dir_all(&self.staging_root).await?;
        Ok(())
    }

    /// Allocate a staging directory bound to `vfid`.
    pub async fn prepare(&self, vfid: &VFolderId) -> VolumeResult<UploadSessionId> {
        let id = UploadSessionId::new_v4();
        let dir = self.staging_root.join(id.to_string());
        tokio::fs::create_dir_all(&dir).await?;

        let now = Instant::now();
        self.sessions.insert(
            id,
            UploadSession {
                id,
                vfid: *vfid,
                dir,
                created_at: now,
                last_activity: now,
                staged: Vec::new(),
            },
        );
        tracing::debug!(vfid = %vfid, session = %id, "upload session prepared");
        Ok(id)
    }

    /// Stream `payload` into a new temp file of the session.
    ///
    /// On any failure the temp file is removed and nothing is recorded.
    pub async fn stage(
        &self,
        id: &UploadSessionId,
        vfid: &VFolderId,
        destination: PathBuf,
        payload: ByteStream,
        budget: WriteBudget,
    ) -> VolumeResult<StagedFile> {
        let dir = self.session_dir(id, vfid)?;
        let temp_path = dir.join(format!("{}.part", uuid::Uuid::new_v4().as_simple()));

        let size = match write_stream(&temp_path, payload, budget).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(
                            path = %temp_path.display(),
                            "failed to remove partial upload: {}", cleanup
                        );
                    }
                }
                return Err(e);
            }
        };

        let staged = StagedFile {
            temp_path,
            destination,
            size,
        };
        match self.sessions.get_mut(id) {
            Some(mut session) => {
                session.last_activity = Instant::now();
                session.staged.push(staged.clone());
            }
            // Aborted or reaped while streaming
            None => {
                let _ = tokio::fs::remove_file(&staged.temp_path).await;
                return Err(VolumeError::not_found(format!("upload session {id}")));
            }
        }
        tracing::debug!(session = %id, size, "payload staged");
        Ok(staged)
    }

    /// Rename every staged file onto its destination and close the session.
    ///
    /// Files are published in staging order; a later file for the same
    /// destination wins.
    pub async fn commit(
        &self,
        id: &UploadSessionId,
        vfid: &VFolderId,
    ) -> VolumeResult<Vec<PathBuf>> {
        self.session_dir(id, vfid)?;
        let (_, session) = self
            .sessions
            .remove(id)
            .ok_or_else(|| VolumeError::not_found(format!("upload session {id}")))?;

        let mut published = Vec::with_capacity(session.staged.len());
        let mut result = Ok(());
        for staged in &session.staged {
            if let Err(e) = publish(staged).await {
                result = Err(e);
                break;
            }
            published.push(staged.destination.clone());
        }

        remove_session_dir(&session.dir).await;
        result?;
        tracing::debug!(session = %id, files = published.len(), "upload session committed");
        Ok(published)
    }

    /// Drop the session and everything staged in it.
    pub async fn abort(&self, id: &UploadSessionId, vfid: &VFolderId) -> VolumeResult<()> {
        self.session_dir(id, vfid)?;
        if let Some((_, session)) = self.sessions.remove(id) {
            remove_session_dir(&session.dir).await;
            tracing::debug!(session = %id, "upload session aborted");
        }
        Ok(())
    }

    /// Discard sessions idle for longer than the expiry. Returns how many.
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<UploadSessionId> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(now, self.expire))
            .map(|s| *s.key())
            .collect();

        let mut reaped = 0;
        for id in expired {
            if let Some((_, session)) = self.sessions.remove(&id) {
                remove_session_dir(&session.dir).await;
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::info!(reaped, "expired upload sessions discarded");
        }
        reaped
    }

    /// Remove every session (volume shutdown).
    pub async fn clear(&self) {
        let ids: Vec<UploadSessionId> = self.sessions.iter().map(|s| *s.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                remove_session_dir(&session.dir).await;
            }
        }
    }

    /// Ephemeral session that is discarded when the guard drops unless it was
    /// committed. Used for single-shot uploads.
    pub async fn ephemeral(&self, vfid: &VFolderId) -> VolumeResult<EphemeralSession<'_>> {
        let id = self.prepare(vfid).await?;
        Ok(EphemeralSession {
            sessions: self,
            id,
            armed: true,
        })
    }

    fn session_dir(&self, id: &UploadSessionId, vfid: &VFolderId) -> VolumeResult<PathBuf> {
        match self.sessions.get(id) {
            Some(session) if session.vfid == *vfid => Ok(session.dir.clone()),
            _ => Err(VolumeError::not_found(format!("upload session {id}"))),
        }
    }
}

/// Guard around a single-shot session; cleans up on every exit path,
/// including cancellation of the owning future.
pub struct EphemeralSession<'a> {
    sessions: &'a UploadSessions,
    id: UploadSessionId,
    armed: bool,
}

impl EphemeralSession<'_> {
    pub fn id(&self) -> &UploadSessionId {
        &self.id
    }

    /// Commit the session; the guard no longer cleans up.
    pub async fn commit(mut self, vfid: &VFolderId) -> VolumeResult<Vec<PathBuf>> {
        self.armed = false;
        self.sessions.commit(&self.id, vfid).await
    }
}

impl Drop for EphemeralSession<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some((_, session)) = self.sessions.sessions.remove(&self.id) {
            // Drop can't await; push the removal onto the blocking pool
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || {
                        let _ = std::fs::remove_dir_all(&session.dir);
                    });
                }
                Err(_) => {
                    let _ = std::fs::remove_dir_all(&session.dir);
                }
            }
        }
    }
}

async fn write_stream(path: &Path, mut payload: ByteStream, budget: WriteBudget) -> VolumeResult<u64> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;

    let mut written: u64 = 0;
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(VolumeError::BackendIo)?;
        written += chunk.len() as u64;
        budget.check(written)?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

async fn publish(staged: &StagedFile) -> VolumeResult<()> {
    if let Some(parent) = staged.destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| VolumeError::from_io(e, parent))?;
    }
    tokio::fs::rename(&staged.temp_path, &staged.destination)
        .await
        .map_err(|e| VolumeError::from_io(e, &staged.destination))
}

async fn remove_session_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %dir.display(), "failed to remove upload session: {}", e);
        }
    }
}
