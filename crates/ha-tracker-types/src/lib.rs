//! # ha-tracker-types: Core types for the HA replica tracker
//!
//! Shared types used across the tracker's crates:
//! - Temporal types ([`Timestamp`])
//! - The persisted election record ([`ReplicaDesc`])
//! - The KV key namespace ([`Key`])
//! - The wire codec for [`ReplicaDesc`] ([`encode`], [`decode`])

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

mod codec;

pub use codec::{decode, encode, CodecError};

/// Wall-clock time expressed as milliseconds since the Unix epoch.
///
/// `ReplicaDesc` fields and admission-check inputs are always expressed in
/// this unit so that arithmetic on timeouts never has to guess a
/// granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch (1970-01-01 00:00:00 UTC).
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds since the Unix epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the Unix epoch.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Returns whether this timestamp is the zero value (`DeletedAt == 0`
    /// means "live", per the wire contract).
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// `self - other`, saturating rather than overflowing at the `i64` edges.
    pub fn saturating_sub(self, other: Timestamp) -> i64 {
        self.0.saturating_sub(other.0)
    }

    /// Adds a duration expressed in milliseconds.
    ///
    /// # Examples
    ///
    /// ```
    /// # use ha_tracker_types::Timestamp;
    /// let t = Timestamp::from_millis(1_000);
    /// assert_eq!(t.plus_millis(500).as_millis(), 1_500);
    /// ```
    pub fn plus_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<i64> for Timestamp {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

/// The value persisted at each KV key: the currently elected replica and
/// when it (or its tombstone) was last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaDesc {
    /// Opaque identifier of the currently elected replica.
    pub replica: String,
    /// Wall-clock time of the most recent sample observed from `replica`.
    pub received_at: Timestamp,
    /// Tombstone time; `Timestamp::ZERO` means the entry is live.
    pub deleted_at: Timestamp,
}

impl ReplicaDesc {
    /// Builds a fresh, live descriptor electing `replica` at `now`.
    pub fn elect(replica: impl Into<String>, now: Timestamp) -> Self {
        Self {
            replica: replica.into(),
            received_at: now,
            deleted_at: Timestamp::ZERO,
        }
    }

    /// Whether this descriptor has not been tombstoned.
    pub const fn is_live(&self) -> bool {
        self.deleted_at.is_zero()
    }

    /// Returns a copy with `deleted_at` set to `now`, tombstoning it.
    pub fn tombstoned(&self, now: Timestamp) -> Self {
        Self {
            replica: self.replica.clone(),
            received_at: self.received_at,
            deleted_at: now,
        }
    }
}

/// The `tenant/replica_group` key namespace.
///
/// A key is valid only if it contains at least one `/`; the tenant is
/// everything before the first separator, the replica group is everything
/// after it (replica group names may themselves contain `/`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    full: String,
    tenant_len: usize,
}

impl Key {
    /// Builds a key from a tenant and replica group, joining them with `/`.
    pub fn new(tenant: &str, replica_group: &str) -> Self {
        let mut full = String::with_capacity(tenant.len() + 1 + replica_group.len());
        full.push_str(tenant);
        full.push('/');
        full.push_str(replica_group);
        Self {
            full,
            tenant_len: tenant.len(),
        }
    }

    /// Parses a raw KV key, returning `None` if it lacks the `/` separator.
    ///
    /// Watchers use this to silently ignore keys that don't belong to this
    /// tracker's namespace, per the spec's separator-check open question.
    pub fn parse(raw: &str) -> Option<Self> {
        let sep = raw.find('/')?;
        Some(Self {
            full: raw.to_string(),
            tenant_len: sep,
        })
    }

    /// The tenant portion of the key.
    pub fn tenant(&self) -> &str {
        &self.full[..self.tenant_len]
    }

    /// The replica group portion of the key.
    pub fn replica_group(&self) -> &str {
        &self.full[self.tenant_len + 1..]
    }

    /// The full `tenant/replica_group` string, as stored in the KV store.
    pub fn as_str(&self) -> &str {
        &self.full
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trip() {
        let k = Key::new("tenant-a", "cluster-1");
        assert_eq!(k.as_str(), "tenant-a/cluster-1");
        assert_eq!(k.tenant(), "tenant-a");
        assert_eq!(k.replica_group(), "cluster-1");
    }

    #[test]
    fn key_replica_group_may_contain_slash() {
        let k = Key::new("tenant-a", "us-east/cluster-1");
        assert_eq!(k.tenant(), "tenant-a");
        assert_eq!(k.replica_group(), "us-east/cluster-1");
    }

    #[test]
    fn parse_rejects_missing_separator() {
        assert!(Key::parse("no-separator-here").is_none());
    }

    #[test]
    fn parse_accepts_separator() {
        let k = Key::parse("tenant-a/cluster-1").unwrap();
        assert_eq!(k.tenant(), "tenant-a");
        assert_eq!(k.replica_group(), "cluster-1");
    }

    #[test]
    fn replica_desc_tombstone_preserves_replica_and_received_at() {
        let desc = ReplicaDesc::elect("R1", Timestamp::from_millis(100));
        let tomb = desc.tombstoned(Timestamp::from_millis(200));
        assert_eq!(tomb.replica, "R1");
        assert_eq!(tomb.received_at, Timestamp::from_millis(100));
        assert_eq!(tomb.deleted_at, Timestamp::from_millis(200));
        assert!(!tomb.is_live());
        assert!(desc.is_live());
    }
}
