//! # ha-tracker-core: per-process HA replica tracker
//!
//! Deduplicates incoming samples by electing exactly one replica per
//! `(tenant, replica_group)` pair, coordinating the election through a
//! pluggable CAS/watch-capable KV store ([`ha_tracker_kv::KvBackend`]).
//!
//! The entry point is [`TrackerHandle::start`], which validates a
//! [`Config`], registers metrics, and spawns the background tasks that keep
//! the local [`Cache`] in sync with the KV store and reap stale entries.
//! [`TrackerHandle::check_replica`] is the hot path every incoming sample
//! goes through.

mod cache;
mod clock;
mod config;
mod error;
mod lifecycle;
mod limits;
mod metrics;
mod reconcile;
mod tracker;

pub use cache::{ApplyOutcome, Cache};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::{Config, ConfigError, KvStoreConfig, KvStoreKind};
pub use error::{AdmissionError, StartError};
pub use lifecycle::{Jitter, TrackerHandle};
pub use limits::{Limits, NoLimits, UniformLimits};
pub use metrics::Metrics;
pub use tracker::Tracker;

/// Installs a `tracing` subscriber reading its filter from `RUST_LOG`
/// (falling back to `info`), matching the setup `kimberlite-server`'s
/// binaries use. Intended for examples and integration tests; library code
/// never installs a global subscriber itself.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
