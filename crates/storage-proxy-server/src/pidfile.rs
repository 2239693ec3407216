//! PID file handling.
//!
//! The file is written at startup and removed again when the guard drops.
//! An existing file naming a live process refuses the start; a stale one is
//! replaced.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Removes the PID file on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(pid) = read_pid(&path) {
            if is_process_running(pid) && pid != std::process::id() {
                bail!(
                    "storage proxy already running with PID {} ({})",
                    pid,
                    path.display()
                );
            }
            tracing::warn!(pid, path = %path.display(), "replacing stale PID file");
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create PID file directory: {}", parent.display())
            })?;
        }
        fs::write(&path, format!("{}\n", std::process::id()))
            .with_context(|| format!("Failed to write PID file: {}", path.display()))?;

        tracing::debug!(path = %path.display(), "PID file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "Failed to remove PID file: {}", e);
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Check if a process with the given PID is running.
fn is_process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        Path::new(&format!("/proc/{}/stat", pid)).exists()
    }

    // Without /proc we can't tell; assume the file is stale
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        false
    }
}
