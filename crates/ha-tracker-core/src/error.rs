//! Error taxonomy for the admission check and reconciliation loop.
//!
//! Grounded on `kimberlite-cluster::error::Error` and
//! `kmb_server::error::ServerError`'s style: one variant per
//! caller-meaningful condition, carrying the structured context a caller
//! needs rather than a stringly-typed catch-all.

use thiserror::Error;

/// Errors returned by [`crate::Tracker::check_replica`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// A sample arrived from a replica other than the one currently
    /// elected, within its failover window. Expected and non-fatal: not
    /// logged as an error, and [`AdmissionError::is_expected_rejection`]
    /// returns `true` so telemetry layers can classify it as such.
    #[error("replica {replica:?} does not match elected replica {elected:?}")]
    ReplicasNotMatch { replica: String, elected: String },

    /// Admitting this new `(tenant, replica_group)` pair would exceed the
    /// tenant's configured cap.
    #[error("tenant has too many HA replica groups (limit {limit})")]
    TooManyReplicaGroups { limit: i64 },

    /// The KV backend failed with a transient error while evaluating the
    /// slow path. The caller may retry the write.
    #[error("KV backend error while checking replica: {0}")]
    KvTransient(String),
}

impl AdmissionError {
    /// Whether this is an expected, non-fatal rejection (as opposed to a
    /// backend failure) — used by telemetry layers to avoid alerting on
    /// ordinary HA dedup rejections.
    pub fn is_expected_rejection(&self) -> bool {
        matches!(
            self,
            Self::ReplicasNotMatch { .. } | Self::TooManyReplicaGroups { .. }
        )
    }
}

impl From<ha_tracker_kv::Error> for AdmissionError {
    fn from(err: ha_tracker_kv::Error) -> Self {
        Self::KvTransient(err.to_string())
    }
}

/// Errors from [`crate::TrackerHandle::start`].
#[derive(Debug, Error)]
pub enum StartError {
    /// Configuration failed validation; see [`crate::config::ConfigError`].
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// A metric could not be registered, most likely because the caller's
    /// registry already has a conflicting collector registered.
    #[error("failed to register tracker metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_rejections_are_flagged() {
        assert!(AdmissionError::ReplicasNotMatch {
            replica: "R2".into(),
            elected: "R1".into(),
        }
        .is_expected_rejection());
        assert!(AdmissionError::TooManyReplicaGroups { limit: 1 }.is_expected_rejection());
        assert!(!AdmissionError::KvTransient("boom".into()).is_expected_rejection());
    }
}
