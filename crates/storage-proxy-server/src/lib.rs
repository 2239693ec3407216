//! Storage proxy process.
//!
//! Everything around the volume layer that turns it into a running service:
//!
//! - [`config`]: TOML configuration with validation and env overrides
//! - [`logging`]: tracing subscriber setup
//! - [`pidfile`]: PID file guard
//! - [`worker`]: worker threads, each owning a private set of volumes
//!
//! The network transport is a separate layer; it consumes a worker's
//! [`VolumeRegistry`](storage_proxy_volume::VolumeRegistry).

pub mod config;
pub mod logging;
pub mod pidfile;
pub mod worker;

pub use config::{Config, ConfigError, LogFormat};
pub use pidfile::PidFile;
pub use worker::{WorkerPool, WorkerSettings};
