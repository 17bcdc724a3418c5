//! Explicit start/stop lifecycle for the tracker's background tasks.
//!
//! Grounded on `kimberlite-cluster::supervisor::ClusterSupervisor::start`/
//! `shutdown`: a `tokio::sync::watch<bool>` cancellation signal raced via
//! `tokio::select!` against each task's timer or blocking call, joined with
//! a bounded timeout on `stop()` so a wedged task can't hang the caller
//! forever.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ha_tracker_kv::KvBackend;
use ha_tracker_types::ReplicaDesc;
use prometheus::Registry;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::StartError;
use crate::limits::Limits;
use crate::metrics::Metrics;
use crate::reconcile::{run_cleanup_sweep, run_group_count_refresh};
use crate::tracker::Tracker;

/// How the process-wide `update_timeout` jitter is chosen at construction.
pub enum Jitter {
    /// Draw once from `[-update_timeout_jitter_max, +update_timeout_jitter_max]`.
    Random,
    /// Use a fixed value, in milliseconds. Tests use this to make the
    /// effective update window deterministic.
    Fixed(i64),
}

/// How many consecutive times the watch loop may restart after
/// `WatchTerminated` before the handle is marked unhealthy. Each restart
/// still keeps retrying indefinitely; `healthy` only stops reporting green.
const WATCH_RETRY_BUDGET: u32 = 5;

/// A running tracker: background tasks plus the shared [`Tracker`] handle
/// used for `check_replica`/`snapshot`/`cleanup_metrics_for_tenant`.
pub struct TrackerHandle {
    tracker: Tracker,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    healthy: Arc<AtomicBool>,
}

impl TrackerHandle {
    /// Validates `config`, registers metrics against `registry`, and spawns
    /// the watch, cleanup-sweep, and group-count-refresh background tasks.
    pub fn start(
        config: Config,
        kv: Arc<dyn KvBackend>,
        limits: Arc<dyn Limits>,
        registry: &Registry,
        clock: Arc<dyn Clock>,
        jitter: Jitter,
    ) -> Result<Self, StartError> {
        config.validate()?;
        let metrics = Arc::new(Metrics::register(registry)?);

        let jitter_millis = match jitter {
            Jitter::Fixed(millis) => millis,
            Jitter::Random => {
                let max = config.update_timeout_jitter_max.as_millis() as i64;
                if max == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(-max..=max)
                }
            }
        };

        let tracker = Tracker {
            config: Arc::new(config),
            cache: Arc::new(Cache::new()),
            kv,
            limits,
            metrics,
            clock,
            jitter_millis,
            bad_key_events: Arc::new(AtomicU64::new(0)),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let healthy = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::with_capacity(3);
        tasks.push(spawn_watch_task(
            tracker.clone(),
            shutdown_rx.clone(),
            healthy.clone(),
        ));
        tasks.push(spawn_cleanup_task(tracker.clone(), shutdown_rx.clone()));
        tasks.push(spawn_group_count_task(tracker.clone(), shutdown_rx));

        Ok(Self {
            tracker,
            shutdown_tx,
            tasks,
            healthy,
        })
    }

    /// Whether the watch loop is within its restart budget. Flips to
    /// `false` once `WatchTerminated` has recurred `WATCH_RETRY_BUDGET`
    /// times in a row without a clean run in between; the watch loop keeps
    /// retrying regardless, so this is advisory for callers' own health
    /// checks, not a circuit breaker.
    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// The admission check. See [`Tracker::check_replica`].
    pub async fn check_replica(
        &self,
        tenant: &str,
        replica_group: &str,
        replica_id: &str,
        now: ha_tracker_types::Timestamp,
    ) -> Result<(), crate::error::AdmissionError> {
        self.tracker
            .check_replica(tenant, replica_group, replica_id, now)
            .await
    }

    /// Value-copy snapshot of the current election state.
    pub fn snapshot(&self) -> std::collections::HashMap<String, ReplicaDesc> {
        self.tracker.snapshot()
    }

    /// Removes cached state and metric series for a departing tenant.
    pub fn cleanup_metrics_for_tenant(&self, tenant: &str) {
        self.tracker.cleanup_metrics_for_tenant(tenant);
    }

    /// Signals every background task to stop and waits (with a generous
    /// bound) for them to finish.
    pub async fn stop(self) {
        info!("stopping HA tracker background tasks");
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .is_err()
            {
                warn!("HA tracker background task did not stop within the shutdown grace period");
            }
        }
    }
}

/// Runs `watch_prefix`, restarting it on `WatchTerminated` up to
/// `WATCH_RETRY_BUDGET` consecutive times before flipping `healthy` false.
/// A clean run longer than one cleanup cycle resets the consecutive count,
/// so a backend that is merely flaky over a long lifetime doesn't get
/// permanently marked unhealthy after its first bad week.
fn spawn_watch_task(
    tracker: Tracker,
    mut shutdown_rx: watch::Receiver<bool>,
    healthy: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let prefix = tracker.config.kv_store.prefix.clone();
        let mut consecutive_failures = 0u32;

        loop {
            let tracker_for_cb = tracker.clone();
            let watch_future = tracker.kv.watch_prefix(
                &prefix,
                Box::new(move |(key, value)| {
                    tracker_for_cb.apply_watch_event(&key, value);
                }),
            );
            let start = std::time::Instant::now();

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                result = watch_future => {
                    match result {
                        Ok(()) => return,
                        Err(err) => {
                            if start.elapsed() >= tracker.config.cleanup_cycle_period {
                                consecutive_failures = 0;
                                healthy.store(true, Ordering::Relaxed);
                            }
                            consecutive_failures += 1;
                            if consecutive_failures >= WATCH_RETRY_BUDGET {
                                healthy.store(false, Ordering::Relaxed);
                                warn!(
                                    error = %err,
                                    consecutive_failures,
                                    "HA tracker watch task exceeded its restart budget, marking unhealthy"
                                );
                            } else {
                                warn!(error = %err, consecutive_failures, "HA tracker watch task terminated, restarting");
                            }
                        }
                    }
                }
            }

            // A backend that fails watch_prefix synchronously (no network
            // round trip) would otherwise busy-loop restarting it; back off
            // briefly, still racing shutdown so the delay never blocks stop().
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                () = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    })
}

fn spawn_cleanup_task(tracker: Tracker, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let sleep = tokio::time::sleep(jittered_cleanup_period(&tracker.config));
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                () = sleep => {}
            }
            run_cleanup_sweep(&tracker).await;
        }
    })
}

fn spawn_group_count_task(tracker: Tracker, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tracker.config.group_count_refresh_period);
        interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return,
                _ = interval.tick() => {}
            }
            run_group_count_refresh(&tracker);
        }
    })
}

fn jittered_cleanup_period(config: &Config) -> Duration {
    let base = config.cleanup_cycle_period.as_secs_f64();
    let frac = config.cleanup_cycle_jitter_fraction;
    if frac <= 0.0 {
        return config.cleanup_cycle_period;
    }
    let delta = base * frac;
    let jittered = base + rand::thread_rng().gen_range(-delta..=delta);
    Duration::from_secs_f64(jittered.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::KvStoreConfig;
    use crate::limits::NoLimits;
    use ha_tracker_kv::InMemoryBackend;

    fn enabled_config() -> Config {
        Config {
            enable_ha_tracker: true,
            update_timeout: Duration::from_secs(15),
            update_timeout_jitter_max: Duration::from_secs(5),
            failover_timeout: Duration::from_secs(30),
            cleanup_cycle_period: Duration::from_millis(20),
            group_count_refresh_period: Duration::from_millis(20),
            kv_store: KvStoreConfig {
                store: "consul".to_string(),
                prefix: "ha-tracker/".to_string(),
            },
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn start_and_stop_round_trip() {
        let registry = Registry::new();
        let handle = TrackerHandle::start(
            enabled_config(),
            Arc::new(InMemoryBackend::new()),
            Arc::new(NoLimits),
            &registry,
            Arc::new(SystemClock),
            Jitter::Fixed(0),
        )
        .unwrap();

        // The watch task subscribes to the backend's broadcast channel only
        // once it is first polled, so a write issued immediately after
        // `start()` returns can race it and be missed (the tracker does no
        // catch-up resync on watch start, by design). Retry the heartbeat
        // until the watch task has had a chance to catch one.
        let mut synced = false;
        for millis in 0..50 {
            handle
                .check_replica(
                    "u1",
                    "c1",
                    "R1",
                    ha_tracker_types::Timestamp::from_millis(millis),
                )
                .await
                .unwrap();
            if !handle.snapshot().is_empty() {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced, "watch task should mirror the CAS write into the cache");

        handle.stop().await;
    }

    /// A backend whose `watch_prefix` always terminates immediately,
    /// exercising the watch task's restart budget without a real network
    /// flake.
    struct AlwaysTerminatesWatch {
        inner: InMemoryBackend,
    }

    #[async_trait::async_trait]
    impl KvBackend for AlwaysTerminatesWatch {
        async fn get(&self, key: &str) -> ha_tracker_kv::Result<Option<ReplicaDesc>> {
            self.inner.get(key).await
        }
        async fn list(&self, prefix: &str) -> ha_tracker_kv::Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        async fn delete(&self, key: &str) -> ha_tracker_kv::Result<()> {
            self.inner.delete(key).await
        }
        async fn cas(
            &self,
            key: &str,
            mutator: Box<
                dyn FnMut(Option<ReplicaDesc>) -> ha_tracker_kv::CasAction + Send + 'static,
            >,
        ) -> ha_tracker_kv::Result<()> {
            self.inner.cas(key, mutator).await
        }
        async fn watch_prefix(
            &self,
            _prefix: &str,
            _cb: Box<dyn FnMut(ha_tracker_kv::WatchEvent) + Send>,
        ) -> ha_tracker_kv::Result<()> {
            Err(ha_tracker_kv::Error::WatchTerminated("simulated flake".to_string()))
        }
    }

    #[tokio::test]
    async fn watch_task_flips_unhealthy_after_exhausting_retry_budget() {
        let registry = Registry::new();
        let handle = TrackerHandle::start(
            enabled_config(),
            Arc::new(AlwaysTerminatesWatch {
                inner: InMemoryBackend::new(),
            }),
            Arc::new(NoLimits),
            &registry,
            Arc::new(SystemClock),
            Jitter::Fixed(0),
        )
        .unwrap();

        assert!(handle.healthy());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while handle.healthy() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.healthy(), "watch task should exhaust its retry budget and flip unhealthy");

        handle.stop().await;
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let registry = Registry::new();
        let mut config = enabled_config();
        config.kv_store.store = "memberlist".to_string();
        let result = TrackerHandle::start(
            config,
            Arc::new(InMemoryBackend::new()),
            Arc::new(NoLimits),
            &registry,
            Arc::new(SystemClock),
            Jitter::Fixed(0),
        );
        assert!(result.is_err());
    }
}
