//! Prometheus metrics, registered against a caller-supplied
//! [`prometheus::Registry`].
//!
//! The metric names and labels match `SPEC_FULL.md` §4.E exactly; this is
//! the one place in the crate that talks to the `prometheus` crate
//! declared in the teacher's `kimberlite-server`/`kmb-server` dependency
//! tables.

use prometheus::{
    CounterVec, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
};

/// All metrics the tracker exports.
pub struct Metrics {
    pub elected_replica_changes_total: CounterVec,
    pub elected_replica_timestamp_seconds: GaugeVec,
    pub elected_replica_change_propagation_seconds: Histogram,
    pub kv_store_cas_total: CounterVec,
    pub user_replica_group_count: GaugeVec,
    pub replicas_cleanup_started_total: prometheus::Counter,
    pub replicas_cleanup_marked_for_deletion_total: prometheus::Counter,
    pub replicas_cleanup_deleted_total: prometheus::Counter,
    pub replicas_cleanup_delete_failed_total: prometheus::Counter,
}

impl Metrics {
    /// Builds and registers all tracker metrics against `registry`.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let elected_replica_changes_total = CounterVec::new(
            Opts::new(
                "elected_replica_changes_total",
                "Number of times the elected replica changed for a tenant/replica_group",
            ),
            &["tenant", "replica_group"],
        )?;
        registry.register(Box::new(elected_replica_changes_total.clone()))?;

        let elected_replica_timestamp_seconds = GaugeVec::new(
            Opts::new(
                "elected_replica_timestamp_seconds",
                "Timestamp of the last received sample from the elected replica",
            ),
            &["tenant", "replica_group"],
        )?;
        registry.register(Box::new(elected_replica_timestamp_seconds.clone()))?;

        let elected_replica_change_propagation_seconds = Histogram::with_opts(HistogramOpts::new(
            "elected_replica_change_propagation_seconds",
            "Time between a sample's received_at and the watch notification reaching this cache",
        ))?;
        registry.register(Box::new(elected_replica_change_propagation_seconds.clone()))?;

        let kv_store_cas_total = CounterVec::new(
            Opts::new("kv_store_cas_total", "Number of CAS attempts issued by this process"),
            &["tenant", "replica_group"],
        )?;
        registry.register(Box::new(kv_store_cas_total.clone()))?;

        let user_replica_group_count = GaugeVec::new(
            Opts::new("user_replica_group_count", "Number of tracked replica groups for a tenant"),
            &["tenant"],
        )?;
        registry.register(Box::new(user_replica_group_count.clone()))?;

        let replicas_cleanup_started_total = prometheus::Counter::with_opts(Opts::new(
            "replicas_cleanup_started_total",
            "Number of cleanup sweeps started",
        ))?;
        registry.register(Box::new(replicas_cleanup_started_total.clone()))?;

        let replicas_cleanup_marked_for_deletion_total = prometheus::Counter::with_opts(Opts::new(
            "replicas_cleanup_marked_for_deletion_total",
            "Number of entries tombstoned by a cleanup sweep",
        ))?;
        registry.register(Box::new(replicas_cleanup_marked_for_deletion_total.clone()))?;

        let replicas_cleanup_deleted_total = prometheus::Counter::with_opts(Opts::new(
            "replicas_cleanup_deleted_total",
            "Number of entries deleted from the KV store by a cleanup sweep",
        ))?;
        registry.register(Box::new(replicas_cleanup_deleted_total.clone()))?;

        let replicas_cleanup_delete_failed_total = prometheus::Counter::with_opts(Opts::new(
            "replicas_cleanup_delete_failed_total",
            "Number of cleanup sweep operations that failed with a transient KV error",
        ))?;
        registry.register(Box::new(replicas_cleanup_delete_failed_total.clone()))?;

        Ok(Self {
            elected_replica_changes_total,
            elected_replica_timestamp_seconds,
            elected_replica_change_propagation_seconds,
            kv_store_cas_total,
            user_replica_group_count,
            replicas_cleanup_started_total,
            replicas_cleanup_marked_for_deletion_total,
            replicas_cleanup_deleted_total,
            replicas_cleanup_delete_failed_total,
        })
    }

    /// Removes all labeled series for a departing tenant. `GaugeVec`s and
    /// `CounterVec`s expose `remove`, which drops that label combination
    /// from future scrapes.
    pub fn cleanup_metrics_for_tenant(&self, tenant: &str, replica_groups: &[String]) {
        for group in replica_groups {
            let _ = self
                .elected_replica_changes_total
                .remove_label_values(&[tenant, group]);
            let _ = self
                .elected_replica_timestamp_seconds
                .remove_label_values(&[tenant, group]);
            let _ = self.kv_store_cas_total.remove_label_values(&[tenant, group]);
        }
        let _ = self.user_replica_group_count.remove_label_values(&[tenant]);
    }
}
