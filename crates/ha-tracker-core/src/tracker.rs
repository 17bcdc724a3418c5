//! The admission check and the shared state it operates on.
//!
//! Grounded on `kmb_server::replication::CommandSubmitter::submit_with_idempotency`:
//! a cheap, lock-only check first; a slower, fallible path through a
//! mutable store second; structured `tracing` fields throughout; a typed
//! `Result` handed back to the caller instead of a boolean.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use ha_tracker_kv::{CasAction, KvBackend};
use ha_tracker_types::{Key, ReplicaDesc, Timestamp};
use tracing::{debug, warn};

use crate::cache::{ApplyOutcome, Cache};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::AdmissionError;
use crate::limits::Limits;
use crate::metrics::Metrics;

/// Shared tracker state: the cache, the KV backend, the limits collaborator,
/// metrics, the clock, and the resolved configuration. Cheaply clonable
/// (everything is behind an `Arc`) so the background tasks in
/// `crate::lifecycle` can hold their own handle without borrowing from the
/// foreground `TrackerHandle`.
#[derive(Clone)]
pub struct Tracker {
    pub(crate) config: Arc<Config>,
    pub(crate) cache: Arc<Cache>,
    pub(crate) kv: Arc<dyn KvBackend>,
    pub(crate) limits: Arc<dyn Limits>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) clock: Arc<dyn Clock>,
    /// Process-wide jitter, in milliseconds, drawn once at construction.
    pub(crate) jitter_millis: i64,
    /// Count of watch notifications ignored for lacking the `/` separator.
    /// Not a public metric (see `SPEC_FULL.md` §9): surfaced only via
    /// `debug!` logging and this counter, which tests can inspect.
    pub(crate) bad_key_events: Arc<AtomicU64>,
}

impl Tracker {
    fn update_window_millis(&self) -> i64 {
        self.config.update_timeout.as_millis() as i64 + self.jitter_millis
    }

    /// The cache is keyed by the bare `tenant/replica_group` string; the KV
    /// store is keyed by that string under the configured prefix. This
    /// joins the two.
    fn full_key(&self, bare_key: &str) -> String {
        format!("{}{}", self.config.kv_store.prefix, bare_key)
    }

    /// Hot-path admission decision. See `SPEC_FULL.md` §4.C for the full
    /// algorithm this implements.
    pub async fn check_replica(
        &self,
        tenant: &str,
        replica_group: &str,
        replica_id: &str,
        now: Timestamp,
    ) -> Result<(), AdmissionError> {
        if !self.config.enable_ha_tracker {
            return Ok(());
        }

        let key = Key::new(tenant, replica_group);
        let (entry, group_count) = self.cache.read(tenant, key.as_str());
        let window = self.update_window_millis();

        if let Some(entry) = &entry {
            if now.saturating_sub(entry.received_at) < window {
                if entry.replica == replica_id {
                    return Ok(());
                }
                debug!(
                    tenant,
                    replica_group,
                    replica = replica_id,
                    elected = %entry.replica,
                    "rejecting sample: replica does not match elected replica (fast path)"
                );
                return Err(AdmissionError::ReplicasNotMatch {
                    replica: replica_id.to_string(),
                    elected: entry.replica.clone(),
                });
            }
        }

        if entry.is_none() {
            let limit = self.limits.max_ha_replica_groups(tenant);
            if limit > 0 && group_count as i64 >= limit {
                debug!(tenant, replica_group, limit, "rejecting sample: too many HA replica groups");
                return Err(AdmissionError::TooManyReplicaGroups { limit });
            }
        }

        self.cas_elect(tenant, replica_group, key.as_str(), replica_id, now, window)
            .await
    }

    async fn cas_elect(
        &self,
        tenant: &str,
        replica_group: &str,
        key: &str,
        replica_id: &str,
        now: Timestamp,
        window: i64,
    ) -> Result<(), AdmissionError> {
        self.metrics
            .kv_store_cas_total
            .with_label_values(&[tenant, replica_group])
            .inc();

        let failover_timeout_millis = self.config.failover_timeout.as_millis() as i64;
        let reject: Arc<StdMutex<Option<AdmissionError>>> = Arc::new(StdMutex::new(None));
        let reject_clone = reject.clone();
        let replica_id_owned = replica_id.to_string();

        let result = self
            .kv
            .cas(
                &self.full_key(key),
                Box::new(move |current: Option<ReplicaDesc>| match &current {
                    Some(desc) if desc.is_live() => {
                        if desc.replica == replica_id_owned
                            && now.saturating_sub(desc.received_at) < window
                        {
                            CasAction::NoChange
                        } else if desc.replica != replica_id_owned
                            && now.saturating_sub(desc.received_at) < failover_timeout_millis
                        {
                            *reject_clone.lock().expect("reject lock poisoned") =
                                Some(AdmissionError::ReplicasNotMatch {
                                    replica: replica_id_owned.clone(),
                                    elected: desc.replica.clone(),
                                });
                            CasAction::Reject(ha_tracker_kv::Error::Transient(
                                "replica mismatch within failover window".to_string(),
                            ))
                        } else {
                            CasAction::Write(ReplicaDesc::elect(replica_id_owned.clone(), now))
                        }
                    }
                    _ => CasAction::Write(ReplicaDesc::elect(replica_id_owned.clone(), now)),
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(business_err) = reject.lock().expect("reject lock poisoned").take() {
                    Err(business_err)
                } else {
                    warn!(tenant, replica_group, error = %err, "KV backend error during admission CAS");
                    Err(AdmissionError::from(err))
                }
            }
        }
    }

    /// Applies a raw watch notification to the cache and updates the
    /// metrics that observe transitions: the change counter (once per
    /// observed flip), the last-received-at gauge, and the propagation
    /// latency histogram.
    pub fn apply_watch_event(&self, raw_key: &str, value: Option<ReplicaDesc>) {
        let bare_key = raw_key
            .strip_prefix(self.config.kv_store.prefix.as_str())
            .unwrap_or(raw_key);
        let Some(key) = Key::parse(bare_key) else {
            self.bad_key_events.fetch_add(1, Ordering::Relaxed);
            debug!(key = raw_key, "ignoring watch event for key without '/' separator");
            return;
        };

        if let Some(desc) = &value {
            let propagation_secs =
                (self.clock.now().saturating_sub(desc.received_at) as f64 / 1_000.0).max(0.0);
            self.metrics
                .elected_replica_change_propagation_seconds
                .observe(propagation_secs);
        }

        let outcome = self.cache.apply(bare_key, value.clone());

        match outcome {
            ApplyOutcome::Elected => {
                self.metrics
                    .elected_replica_changes_total
                    .with_label_values(&[key.tenant(), key.replica_group()])
                    .inc();
                if let Some(desc) = &value {
                    self.metrics
                        .elected_replica_timestamp_seconds
                        .with_label_values(&[key.tenant(), key.replica_group()])
                        .set(desc.received_at.as_millis() as f64 / 1_000.0);
                }
            }
            ApplyOutcome::Refreshed => {
                if let Some(desc) = &value {
                    self.metrics
                        .elected_replica_timestamp_seconds
                        .with_label_values(&[key.tenant(), key.replica_group()])
                        .set(desc.received_at.as_millis() as f64 / 1_000.0);
                }
            }
            ApplyOutcome::Removed | ApplyOutcome::IgnoredBadKey => {}
        }
    }

    /// Value-copy snapshot of the current election state.
    pub fn snapshot(&self) -> std::collections::HashMap<String, ReplicaDesc> {
        self.cache.snapshot()
    }

    /// Removes cached state and metric series for a departing tenant.
    pub fn cleanup_metrics_for_tenant(&self, tenant: &str) {
        let groups: Vec<String> = {
            let snapshot = self.cache.snapshot();
            snapshot
                .keys()
                .filter_map(|k| Key::parse(k))
                .filter(|k| k.tenant() == tenant)
                .map(|k| k.replica_group().to_string())
                .collect()
        };
        self.metrics.cleanup_metrics_for_tenant(tenant, &groups);
        self.cache.drop_tenant(tenant);
    }
}
