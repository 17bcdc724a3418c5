//! The two reconciliation tasks: the cleanup sweep and the group-count
//! refresher.
//!
//! Grounded on `kimberlite-cluster::supervisor::ClusterSupervisor`'s
//! node-monitor loop: a plain async fn driven by `tokio::time::interval`,
//! with the tricky bits (the sweep itself) factored out so they can be unit
//! tested without a running task.

use ha_tracker_kv::CasAction;
use tracing::{debug, warn};

use crate::tracker::Tracker;

/// Runs one cleanup sweep over every key under the configured prefix.
///
/// Blind-deletes expired tombstones and tombstones stale live entries via a
/// CAS that backs off if the descriptor changed underneath it. See
/// `SPEC_FULL.md` §4.D for the two-phase rationale.
pub async fn run_cleanup_sweep(tracker: &Tracker) {
    tracker.metrics.replicas_cleanup_started_total.inc();

    let prefix = &tracker.config.kv_store.prefix;
    let keys = match tracker.kv.list(prefix).await {
        Ok(keys) => keys,
        Err(err) => {
            warn!(error = %err, "cleanup sweep: failed to list keys");
            return;
        }
    };

    let deletion_timeout_millis = tracker.config.deletion_timeout.as_millis() as i64;
    let now = tracker.clock.now();

    for key in keys {
        let desc = match tracker.kv.get(&key).await {
            Ok(Some(desc)) => desc,
            Ok(None) => continue,
            Err(err) => {
                warn!(key, error = %err, "cleanup sweep: failed to read key");
                tracker.metrics.replicas_cleanup_delete_failed_total.inc();
                continue;
            }
        };

        if !desc.is_live() {
            if now.saturating_sub(desc.deleted_at) >= deletion_timeout_millis {
                match tracker.kv.delete(&key).await {
                    Ok(()) => {
                        debug!(key, "cleanup sweep: deleted expired tombstone");
                        tracker.metrics.replicas_cleanup_deleted_total.inc();
                    }
                    Err(err) => {
                        warn!(key, error = %err, "cleanup sweep: failed to delete tombstoned key");
                        tracker.metrics.replicas_cleanup_delete_failed_total.inc();
                    }
                }
            }
            continue;
        }

        if now.saturating_sub(desc.received_at) >= deletion_timeout_millis {
            let stale_replica = desc.replica.clone();
            let stale_received_at = desc.received_at;
            let result = tracker
                .kv
                .cas(
                    &key,
                    Box::new(move |current| match current {
                        Some(d)
                            if d.is_live()
                                && d.replica == stale_replica
                                && d.received_at == stale_received_at =>
                        {
                            CasAction::Write(d.tombstoned(now))
                        }
                        _ => CasAction::NoChange,
                    }),
                )
                .await;

            match result {
                Ok(()) => {
                    debug!(key, "cleanup sweep: tombstoned stale entry");
                    tracker.metrics.replicas_cleanup_marked_for_deletion_total.inc();
                }
                Err(err) => {
                    warn!(key, error = %err, "cleanup sweep: failed to tombstone stale entry");
                    tracker.metrics.replicas_cleanup_delete_failed_total.inc();
                }
            }
        }
    }
}

/// Re-exports `user_replica_group_count` for every tenant currently tracked
/// by the cache.
pub fn run_group_count_refresh(tracker: &Tracker) {
    for tenant in tracker.cache.tenants() {
        let count = tracker.cache.group_count(&tenant);
        tracker
            .metrics
            .user_replica_group_count
            .with_label_values(&[&tenant])
            .set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::clock::FakeClock;
    use crate::config::{Config, KvStoreConfig};
    use crate::limits::NoLimits;
    use crate::metrics::Metrics;
    use ha_tracker_kv::InMemoryBackend;
    use ha_tracker_types::{ReplicaDesc, Timestamp};
    use prometheus::Registry;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_tracker() -> (Tracker, Arc<FakeClock>) {
        let registry = Registry::new();
        let metrics = Arc::new(Metrics::register(&registry).unwrap());
        let clock = Arc::new(FakeClock::new(Timestamp::from_millis(2_000_000)));
        let config = Config {
            enable_ha_tracker: true,
            kv_store: KvStoreConfig {
                store: "consul".to_string(),
                prefix: "".to_string(),
            },
            deletion_timeout: Duration::from_secs(1_000),
            ..Config::default()
        };
        let tracker = Tracker {
            config: Arc::new(config),
            cache: Arc::new(Cache::new()),
            kv: Arc::new(InMemoryBackend::new()),
            limits: Arc::new(NoLimits),
            metrics,
            clock: clock.clone(),
            jitter_millis: 0,
            bad_key_events: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        };
        (tracker, clock)
    }

    #[tokio::test]
    async fn deletes_expired_tombstone() {
        let (tracker, _clock) = test_tracker();
        let tomb = ReplicaDesc::elect("R1", Timestamp::from_millis(0))
            .tombstoned(Timestamp::from_millis(500_000));
        tracker
            .kv
            .cas("t1/g1", Box::new(move |_| CasAction::Write(tomb.clone())))
            .await
            .unwrap();

        run_cleanup_sweep(&tracker).await;

        assert!(tracker.kv.get("t1/g1").await.unwrap().is_none());
        assert_eq!(tracker.metrics.replicas_cleanup_deleted_total.get(), 1.0);
    }

    #[tokio::test]
    async fn keeps_fresh_tombstone() {
        let (tracker, _clock) = test_tracker();
        let tomb = ReplicaDesc::elect("R1", Timestamp::from_millis(0))
            .tombstoned(Timestamp::from_millis(1_999_000));
        tracker
            .kv
            .cas("t1/g1", Box::new(move |_| CasAction::Write(tomb.clone())))
            .await
            .unwrap();

        run_cleanup_sweep(&tracker).await;

        assert!(tracker.kv.get("t1/g1").await.unwrap().is_some());
        assert_eq!(tracker.metrics.replicas_cleanup_deleted_total.get(), 0.0);
    }

    #[tokio::test]
    async fn tombstones_stale_live_entry() {
        let (tracker, _clock) = test_tracker();
        tracker
            .kv
            .cas(
                "t1/g1",
                Box::new(|_| CasAction::Write(ReplicaDesc::elect("R1", Timestamp::from_millis(0)))),
            )
            .await
            .unwrap();

        run_cleanup_sweep(&tracker).await;

        let desc = tracker.kv.get("t1/g1").await.unwrap().unwrap();
        assert!(!desc.is_live());
        assert_eq!(desc.deleted_at, Timestamp::from_millis(2_000_000));
        assert_eq!(
            tracker.metrics.replicas_cleanup_marked_for_deletion_total.get(),
            1.0
        );
    }

    #[tokio::test]
    async fn leaves_fresh_live_entry_untouched() {
        let (tracker, _clock) = test_tracker();
        tracker
            .kv
            .cas(
                "t1/g1",
                Box::new(|_| {
                    CasAction::Write(ReplicaDesc::elect("R1", Timestamp::from_millis(1_999_500)))
                }),
            )
            .await
            .unwrap();

        run_cleanup_sweep(&tracker).await;

        let desc = tracker.kv.get("t1/g1").await.unwrap().unwrap();
        assert!(desc.is_live());
    }

    #[test]
    fn group_count_refresh_sets_gauge_per_tenant() {
        let (tracker, _clock) = test_tracker();
        tracker.cache.apply("t1/g1", Some(ReplicaDesc::elect("R1", Timestamp::ZERO)));
        tracker.cache.apply("t1/g2", Some(ReplicaDesc::elect("R1", Timestamp::ZERO)));
        tracker.cache.apply("t2/g1", Some(ReplicaDesc::elect("R1", Timestamp::ZERO)));

        run_group_count_refresh(&tracker);

        assert_eq!(
            tracker
                .metrics
                .user_replica_group_count
                .with_label_values(&["t1"])
                .get(),
            2.0
        );
        assert_eq!(
            tracker
                .metrics
                .user_replica_group_count
                .with_label_values(&["t2"])
                .get(),
            1.0
        );
    }
}
