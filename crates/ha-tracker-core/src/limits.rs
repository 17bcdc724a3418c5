//! The tenant-limits collaborator, consumed read-only.
//!
//! Tenant limits configuration is an external collaborator per
//! `SPEC_FULL.md` §1; this crate only defines the narrow interface it
//! reads through.

/// Per-tenant limits, as owned by the host process's tenant configuration.
pub trait Limits: Send + Sync {
    /// Maximum number of HA replica groups a tenant may track. Zero or
    /// negative means unlimited.
    fn max_ha_replica_groups(&self, tenant: &str) -> i64;
}

/// A [`Limits`] implementation with a single limit applied to every tenant,
/// useful for tests and for simple deployments with no per-tenant overrides.
pub struct UniformLimits {
    pub max_ha_replica_groups: i64,
}

impl Limits for UniformLimits {
    fn max_ha_replica_groups(&self, _tenant: &str) -> i64 {
        self.max_ha_replica_groups
    }
}

/// Unlimited for every tenant.
pub struct NoLimits;

impl Limits for NoLimits {
    fn max_ha_replica_groups(&self, _tenant: &str) -> i64 {
        0
    }
}
