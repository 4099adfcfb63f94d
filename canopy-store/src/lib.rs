//! Topology bookkeeping store
//!
//! Persists the fleet's state between probe passes: instance snapshots,
//! maintenance/downtime flags, coordinate equivalences, the audit stream,
//! recovery records and the leader lease. The engine consumes the store
//! through the narrow [`TopologyStore`] capability; [`SqliteStore`] is the
//! shipped implementation (the schema is owned by this system and created at
//! startup).

pub mod models;
pub mod sqlite;

pub use models::{AuditEntry, BlockedRecovery, Downtime, LeaderLease, RecoveryRecord};
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;

use canopy_core::{BinlogCoordinates, Instance, InstanceKey, Result};

/// Bookkeeping store capability
///
/// All methods are transactional at row granularity. `begin_maintenance` and
/// `register_recovery` carry compare-and-set semantics: they fail with
/// `LockContended` when the lock row already exists.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    // ===== Instances =====

    /// Upsert the latest snapshot for an instance.
    async fn write_instance(&self, instance: &Instance) -> Result<()>;

    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>>;

    /// Direct downstream replicas of `key`.
    async fn read_replicas(&self, key: &InstanceKey) -> Result<Vec<Instance>>;

    async fn read_cluster_instances(&self, cluster: &str) -> Result<Vec<Instance>>;

    async fn read_cluster_names(&self) -> Result<Vec<String>>;

    async fn read_all_keys(&self) -> Result<Vec<InstanceKey>>;

    /// Keys not probed within `window`, due for a sweep.
    async fn read_outdated_keys(&self, window: Duration) -> Result<Vec<InstanceKey>>;

    /// Invalidate the last check without touching the snapshot.
    async fn mark_unreachable(&self, key: &InstanceKey) -> Result<()>;

    /// Remove an instance on operator command.
    async fn forget_instance(&self, key: &InstanceKey) -> Result<()>;

    // ===== Maintenance / downtime =====

    /// Take the mandatory per-instance operation lock. Returns a token to
    /// release with; fails `LockContended` when already held.
    async fn begin_maintenance(&self, key: &InstanceKey, owner: &str, reason: &str) -> Result<i64>;

    async fn end_maintenance(&self, token: i64) -> Result<()>;

    async fn in_maintenance(&self, key: &InstanceKey) -> Result<bool>;

    /// Set the advisory downtime flag; an existing flag is replaced.
    async fn begin_downtime(
        &self,
        key: &InstanceKey,
        owner: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<()>;

    async fn end_downtime(&self, key: &InstanceKey) -> Result<()>;

    async fn active_downtime(&self, key: &InstanceKey) -> Result<Option<Downtime>>;

    // ===== Coordinate equivalence =====

    /// Record that `(a, a_coords)` and `(b, b_coords)` denote the same
    /// logical replication point.
    async fn record_equivalence(
        &self,
        a: &InstanceKey,
        a_coords: &BinlogCoordinates,
        b: &InstanceKey,
        b_coords: &BinlogCoordinates,
    ) -> Result<()>;

    /// All known positions equivalent to `(key, coords)`, excluding itself.
    async fn find_equivalent(
        &self,
        key: &InstanceKey,
        coords: &BinlogCoordinates,
    ) -> Result<Vec<(InstanceKey, BinlogCoordinates)>>;

    // ===== Audit =====

    async fn append_audit(&self, key: Option<&InstanceKey>, message: &str) -> Result<()>;

    /// Most recent audit entries, newest first.
    async fn read_audit(&self, limit: i64) -> Result<Vec<AuditEntry>>;

    // ===== Recovery =====

    /// Open a recovery under the per-cluster lock. Fails `LockContended`
    /// when the cluster already has an open recovery.
    async fn register_recovery(
        &self,
        cluster: &str,
        analysis_code: &str,
        analyzed_key: &InstanceKey,
        analysis: &serde_json::Value,
    ) -> Result<RecoveryRecord>;

    /// Close a recovery, releasing the cluster lock.
    async fn resolve_recovery(
        &self,
        id: i64,
        success: bool,
        successor: Option<&InstanceKey>,
        participants: &[InstanceKey],
    ) -> Result<()>;

    async fn read_recovery(&self, id: i64) -> Result<Option<RecoveryRecord>>;

    async fn read_active_recovery(&self, cluster: &str) -> Result<Option<RecoveryRecord>>;

    /// Recoveries for `(cluster, code)` that completed within `within`.
    async fn read_recent_recoveries(
        &self,
        cluster: &str,
        analysis_code: &str,
        within: Duration,
    ) -> Result<Vec<RecoveryRecord>>;

    async fn acknowledge_recovery(&self, id: i64, by: &str, comment: &str) -> Result<()>;

    /// Acknowledge every completed recovery of a cluster; returns the count.
    async fn acknowledge_cluster_recoveries(
        &self,
        cluster: &str,
        by: &str,
        comment: &str,
    ) -> Result<u64>;

    async fn record_blocked_recovery(
        &self,
        cluster: &str,
        analysis_code: &str,
        analyzed_key: &InstanceKey,
        blocking_recovery_id: Option<i64>,
        reason: &str,
    ) -> Result<()>;

    async fn read_blocked_recoveries(&self, cluster: &str) -> Result<Vec<BlockedRecovery>>;

    // ===== Leader lease =====

    /// Take or renew the process-wide leader lease. Returns whether `owner`
    /// now holds it; a live lease owned by another process is not disturbed.
    async fn attempt_leader_lease(&self, owner: &str, ttl: Duration) -> Result<bool>;

    async fn current_leader(&self) -> Result<Option<LeaderLease>>;

    /// Give up the lease if held by `owner`.
    async fn release_leader_lease(&self, owner: &str) -> Result<()>;

    // ===== Cluster aliases and pools =====

    async fn set_cluster_alias(&self, cluster: &str, alias: &str) -> Result<()>;

    async fn cluster_for_alias(&self, alias: &str) -> Result<Option<String>>;

    async fn register_pool_instance(&self, pool: &str, key: &InstanceKey) -> Result<()>;

    async fn read_pool_instances(&self, pool: &str) -> Result<Vec<InstanceKey>>;
}
