//! Worker units.
//!
//! Each worker is one OS thread running a current-thread tokio runtime. It
//! builds and initializes its own [`VolumeRegistry`] from configuration and
//! owns it until shutdown; workers share nothing with each other. While
//! running, a worker periodically discards expired upload sessions.

use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::watch;
use tracing::Instrument;

use storage_proxy_volume::{VolumeContext, VolumeInfo, VolumeRegistry};

use crate::config::Config;

/// How often expired upload sessions are reaped.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Per-worker settings, cloned out of the configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub volumes: Vec<(String, VolumeInfo)>,
    pub context: VolumeContext,
    pub reap_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            volumes: config.volume_infos(),
            context: config.volume_context(),
            reap_interval: REAP_INTERVAL,
        }
    }
}

/// A set of running workers.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<(usize, JoinHandle<Result<()>>)>,
}

impl WorkerPool {
    /// Start `count` workers and wait until every one initialized its
    /// volumes. If any fails, the ones already running are stopped.
    pub fn spawn(count: usize, settings: WorkerSettings) -> Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = std_mpsc::channel::<(usize, Result<(), String>)>();

        let mut pool = Self {
            shutdown,
            handles: Vec::with_capacity(count),
        };

        for id in 0..count {
            let settings = settings.clone();
            let shutdown_rx = shutdown_rx.clone();
            let ready_tx = ready_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("storage-proxy-worker-{id}"))
                .spawn(move || run_worker(id, settings, shutdown_rx, ready_tx));
            match spawned {
                Ok(handle) => pool.handles.push((id, handle)),
                Err(e) => {
                    let _ = pool.stop();
                    return Err(e).context(format!("Failed to spawn worker {id}"));
                }
            }
        }
        drop(ready_tx);

        for _ in 0..count {
            let outcome = ready_rx
                .recv()
                .map_err(|_| anyhow!("worker exited before reporting readiness"));
            let failure = match outcome {
                Ok((_, Ok(()))) => continue,
                Ok((id, Err(e))) => anyhow!("worker {id} failed to start: {e}"),
                Err(e) => e,
            };
            let _ = pool.stop();
            return Err(failure);
        }

        tracing::info!(workers = count, "all workers ready");
        Ok(pool)
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker to shut down and wait for them.
    ///
    /// Every worker is joined; the first failure is returned.
    pub fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(true);

        let mut first_error = None;
        for (id, handle) in self.handles {
            let outcome = match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("worker {id} panicked")),
            };
            if let Err(e) = outcome {
                tracing::error!(worker = id, "worker stopped with error: {:#}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Worker thread body.
fn run_worker(
    id: usize,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
    ready: std_mpsc::Sender<(usize, Result<(), String>)>,
) -> Result<()> {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send((id, Err(e.to_string())));
            return Err(e).context("Failed to create tokio runtime");
        }
    };

    let span = tracing::info_span!("worker", id);
    rt.block_on(serve(id, settings, shutdown, ready).instrument(span))
}

async fn serve(
    id: usize,
    settings: WorkerSettings,
    mut shutdown: watch::Receiver<bool>,
    ready: std_mpsc::Sender<(usize, Result<(), String>)>,
) -> Result<()> {
    let registry = match start_registry(&settings).await {
        Ok(registry) => registry,
        Err(e) => {
            let _ = ready.send((id, Err(format!("{e:#}"))));
            return Err(e);
        }
    };
    let _ = ready.send((id, Ok(())));
    tracing::info!(volumes = registry.len(), "worker ready");

    let mut reap = tokio::time::interval(settings.reap_interval);
    reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = reap.tick() => {
                registry.reap_expired_uploads().await;
            }
            changed = shutdown.changed() => {
                // A dropped sender means the pool is gone; stop as well
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("worker shutting down");
    registry
        .shutdown_all()
        .await
        .context("Volume shutdown failed")
}

/// Build and initialize the worker's private volumes.
pub async fn start_registry(settings: &WorkerSettings) -> Result<VolumeRegistry> {
    let registry = VolumeRegistry::from_infos(settings.volumes.iter().cloned(), &settings.context)
        .context("Failed to build volumes")?;
    registry
        .init_all()
        .await
        .context("Failed to initialize volumes")?;
    Ok(registry)
}
