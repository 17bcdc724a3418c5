//! Tracker configuration and construction-time validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only KV backends the tracker accepts. Gossip-based stores (e.g.
/// memberlist) are rejected at validation time: their propagation latency
/// is incompatible with the tracker's heartbeat timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvStoreKind {
    Consul,
    Etcd,
}

impl KvStoreKind {
    /// Parses a backend identifier from configuration, rejecting anything
    /// other than `consul` or `etcd`.
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name {
            "consul" => Ok(Self::Consul),
            "etcd" => Ok(Self::Etcd),
            other => Err(ConfigError::UnsupportedKvStore(other.to_string())),
        }
    }
}

/// KV-store-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// Backend identifier, validated against [`KvStoreKind`].
    pub store: String,
    /// Key prefix under which all tracker keys live (e.g. `"ha-tracker/"`).
    #[serde(default = "default_kv_prefix")]
    pub prefix: String,
}

fn default_kv_prefix() -> String {
    "ha-tracker/".to_string()
}

/// Top-level tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Whether HA tracking is enabled at all. When `false`, `check_replica`
    /// always accepts and no KV traffic is generated.
    #[serde(default)]
    pub enable_ha_tracker: bool,

    /// How long a heartbeat from the same replica is considered fresh
    /// without contacting the KV store.
    #[serde(default = "default_update_timeout", with = "duration_secs")]
    pub update_timeout: Duration,

    /// Maximum jitter applied to `update_timeout`, drawn once at
    /// construction from `[-max, +max]`.
    #[serde(default = "default_update_timeout_jitter_max", with = "duration_secs")]
    pub update_timeout_jitter_max: Duration,

    /// How long the elected replica must be silent before another replica
    /// may take over.
    #[serde(default = "default_failover_timeout", with = "duration_secs")]
    pub failover_timeout: Duration,

    /// KV backend selection.
    pub kv_store: KvStoreConfig,

    /// Interval between cleanup sweeps.
    #[serde(default = "default_cleanup_cycle_period", with = "duration_secs")]
    pub cleanup_cycle_period: Duration,

    /// Fraction of `cleanup_cycle_period` used as jitter bound (e.g. `0.2`
    /// for ±20%).
    #[serde(default = "default_cleanup_cycle_jitter_fraction")]
    pub cleanup_cycle_jitter_fraction: f64,

    /// How long an entry may go without a heartbeat (live) or how long a
    /// tombstone may exist (tombstoned) before the cleanup sweep acts on it.
    #[serde(default = "default_deletion_timeout", with = "duration_secs")]
    pub deletion_timeout: Duration,

    /// Interval between group-count gauge refreshes.
    #[serde(default = "default_group_count_refresh_period", with = "duration_secs")]
    pub group_count_refresh_period: Duration,
}

fn default_update_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_update_timeout_jitter_max() -> Duration {
    Duration::from_secs(5)
}

fn default_failover_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_cleanup_cycle_period() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_cleanup_cycle_jitter_fraction() -> f64 {
    0.2
}

fn default_deletion_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_group_count_refresh_period() -> Duration {
    Duration::from_secs(30)
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_ha_tracker: false,
            update_timeout: default_update_timeout(),
            update_timeout_jitter_max: default_update_timeout_jitter_max(),
            failover_timeout: default_failover_timeout(),
            kv_store: KvStoreConfig {
                store: String::new(),
                prefix: default_kv_prefix(),
            },
            cleanup_cycle_period: default_cleanup_cycle_period(),
            cleanup_cycle_jitter_fraction: default_cleanup_cycle_jitter_fraction(),
            deletion_timeout: default_deletion_timeout(),
            group_count_refresh_period: default_group_count_refresh_period(),
        }
    }
}

/// Errors from validating a [`Config`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// `kv_store.store` names a backend other than `consul` or `etcd`.
    #[error("unsupported KV store {0:?}; only \"consul\" and \"etcd\" are supported")]
    UnsupportedKvStore(String),

    /// `update_timeout_jitter_max` is negative (unrepresentable as a
    /// `Duration`, but kept as an explicit check for a clear error message
    /// if this type ever changes).
    #[error("update_timeout_jitter_max must be >= 0")]
    NegativeJitter,

    /// Invariant 5: `FailoverTimeout >= UpdateTimeout + JitterMax + 1s`.
    #[error(
        "failover_timeout ({failover_timeout_secs}s) must be >= update_timeout + \
         update_timeout_jitter_max + 1s ({min_secs}s)"
    )]
    FailoverTimeoutTooShort {
        failover_timeout_secs: f64,
        min_secs: f64,
    },
}

impl Config {
    /// Validates this configuration, refusing to start the tracker if it
    /// fails. Mirrors `kimberlite-cluster::ClusterConfig`'s fail-closed
    /// construction-time checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enable_ha_tracker {
            // Disabled trackers skip backend/timeout validation entirely;
            // `check_replica` short-circuits before touching any of it.
            return Ok(());
        }

        KvStoreKind::parse(&self.kv_store.store)?;

        if self.update_timeout_jitter_max < Duration::ZERO {
            return Err(ConfigError::NegativeJitter);
        }

        let min = self.update_timeout + self.update_timeout_jitter_max + Duration::from_secs(1);
        if self.failover_timeout < min {
            return Err(ConfigError::FailoverTimeoutTooShort {
                failover_timeout_secs: self.failover_timeout.as_secs_f64(),
                min_secs: min.as_secs_f64(),
            });
        }

        Ok(())
    }
}
