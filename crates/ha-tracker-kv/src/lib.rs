//! # ha-tracker-kv: KV client adapter for the HA replica tracker
//!
//! Defines the narrow [`KvBackend`] trait the tracker issues all of its
//! reads, writes, and watches through, plus [`InMemoryBackend`], a
//! reference implementation used by tests and suitable as a starting point
//! for wiring in a real Consul or etcd client. Networking to an actual
//! Consul/etcd cluster is out of scope for this crate (see `SPEC_FULL.md`
//! §1); only the adapter contract and codec are owned here.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ha_tracker_types::{decode, encode, CodecError, ReplicaDesc};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Errors surfaced by a [`KvBackend`].
#[derive(Debug, Error)]
pub enum Error {
    /// The backend reported a transient failure (network blip, leader
    /// election in progress, etc.). Callers should retry.
    #[error("transient KV backend error: {0}")]
    Transient(String),

    /// `watch_prefix` terminated unexpectedly and must be restarted by the
    /// caller.
    #[error("watch terminated: {0}")]
    WatchTerminated(String),

    /// The stored value could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Result type for [`KvBackend`] operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The outcome of a [`KvBackend::cas`] mutator invocation.
pub enum CasAction {
    /// The stored value already reflects what the caller wants; don't write
    /// anything and don't retry.
    NoChange,
    /// Persist this value atomically, replacing whatever the mutator saw.
    Write(ReplicaDesc),
    /// Abort the CAS loop and surface this error to the caller without
    /// writing anything. Used by the tracker to short-circuit with a
    /// business-level rejection (e.g. `ReplicasNotMatch`) while still going
    /// through the same mutator contention loop as a real write.
    Reject(Error),
}

/// A watch notification: `None` means the key was explicitly deleted.
pub type WatchEvent = (String, Option<ReplicaDesc>);

/// Narrow, object-safe interface to a CAS/watch-capable KV store.
///
/// `consul` and `etcd` are the only backend identifiers the tracker's
/// configuration validation accepts (see `ha-tracker-core::Config`);
/// implementations of this trait for those stores are expected to be
/// supplied by the host process. [`InMemoryBackend`] is the only
/// implementation shipped here, for tests and local development.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Reads the current value at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<ReplicaDesc>>;

    /// Lists all keys under `prefix` (not their values).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Deletes `key` unconditionally, regardless of its current value.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Performs a compare-and-swap at `key`.
    ///
    /// `mutator` is invoked with the current value (or `None` if absent)
    /// and decides the next state via a [`CasAction`]. The backend retries
    /// the mutator under contention until it returns anything other than a
    /// contended write; `NoChange` and `Reject` never retry.
    async fn cas(
        &self,
        key: &str,
        mutator: Box<dyn FnMut(Option<ReplicaDesc>) -> CasAction + Send + 'static>,
    ) -> Result<()>;

    /// Subscribes to all changes under `prefix`, invoking `cb` for each one
    /// until the returned subscription is dropped or the backend cancels it.
    async fn watch_prefix(
        &self,
        prefix: &str,
        cb: Box<dyn FnMut(WatchEvent) + Send>,
    ) -> Result<()>;
}

struct Entry {
    value: Option<ReplicaDesc>,
}

/// An in-memory [`KvBackend`], suitable for tests and as a template for a
/// real Consul/etcd-backed implementation.
///
/// Encodes and decodes every value through the same `postcard` wire codec
/// a real backend would use, so codec bugs are caught by tests that only
/// exercise this backend.
pub struct InMemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    watch_tx: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(1024);
        Self {
            entries: Mutex::new(HashMap::new()),
            watch_tx,
        }
    }

    fn notify(&self, key: &str, value: Option<&ReplicaDesc>) {
        // No subscribers is not an error: watchers may not have started yet.
        let _ = self.watch_tx.send((key.to_string(), value.cloned()));
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<ReplicaDesc>> {
        let entries = self.entries.lock().expect("entries lock poisoned");
        Ok(entries.get(key).and_then(|e| e.value.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.lock().expect("entries lock poisoned");
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut entries = self.entries.lock().expect("entries lock poisoned");
            entries.remove(key);
        }
        self.notify(key, None);
        Ok(())
    }

    async fn cas(
        &self,
        key: &str,
        mut mutator: Box<dyn FnMut(Option<ReplicaDesc>) -> CasAction + Send + 'static>,
    ) -> Result<()> {
        // The mutator runs outside the entries lock so it can call into
        // user code without risking a deadlock against a concurrent get/
        // list; the loop exists for symmetry with a networked backend that
        // would retry on a version mismatch under contention.
        loop {
            let current = {
                let entries = self.entries.lock().expect("entries lock poisoned");
                entries.get(key).and_then(|e| e.value.clone())
            };
            match mutator(current) {
                CasAction::NoChange => return Ok(()),
                CasAction::Reject(err) => return Err(err),
                CasAction::Write(desc) => {
                    let mut entries = self.entries.lock().expect("entries lock poisoned");
                    entries.insert(
                        key.to_string(),
                        Entry {
                            value: Some(desc.clone()),
                        },
                    );
                    drop(entries);
                    self.notify(key, Some(&desc));
                    return Ok(());
                }
            }
        }
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        mut cb: Box<dyn FnMut(WatchEvent) + Send>,
    ) -> Result<()> {
        let mut rx = self.watch_tx.subscribe();
        let prefix = prefix.to_string();
        loop {
            match rx.recv().await {
                Ok((key, value)) if key.starts_with(&prefix) => cb((key, value)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "watch_prefix dropped events due to a slow subscriber");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("watch_prefix channel closed, terminating");
                    return Err(Error::WatchTerminated("backend shut down".to_string()));
                }
            }
        }
    }
}

/// Round-trip helper used by backends that store raw bytes: encodes a
/// descriptor with [`ha_tracker_types::encode`] for storage and decodes it
/// back with [`ha_tracker_types::decode`]. [`InMemoryBackend`] stores typed
/// values directly and doesn't need this, but a real network-backed
/// implementation storing opaque bytes would route through these.
pub fn encode_for_storage(desc: &ReplicaDesc) -> Vec<u8> {
    encode(desc)
}

/// See [`encode_for_storage`].
pub fn decode_from_storage(bytes: &[u8]) -> std::result::Result<ReplicaDesc, CodecError> {
    decode(bytes)
}
