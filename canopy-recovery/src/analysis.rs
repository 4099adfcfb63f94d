//! Analysis engine
//!
//! Classifies each cluster's current state into a closed set of failure
//! scenarios from recent probe data. The analyzer only reads the store and
//! emits entries; acting on them is the orchestrator's concern.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use canopy_core::{Instance, InstanceKey, Result};
use canopy_store::TopologyStore;

/// Closed set of recognized failure scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisCode {
    DeadPrimary,
    DeadPrimaryAndSomeReplicas,
    DeadIntermediatePrimary,
    UnreachablePrimary,
    AllPrimaryReplicasNotReplicating,
    FirstTierReplicaFailingToConnectToPrimary,
    BinlogServerFailure,
    NoProblem,
}

impl AnalysisCode {
    /// Codes the orchestrator acts on.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            Self::DeadPrimary | Self::DeadPrimaryAndSomeReplicas | Self::DeadIntermediatePrimary
        )
    }

    /// Whether the failed node is a cluster primary (as opposed to an
    /// intermediate), for filter scoping.
    pub fn concerns_primary(&self) -> bool {
        matches!(
            self,
            Self::DeadPrimary
                | Self::DeadPrimaryAndSomeReplicas
                | Self::UnreachablePrimary
                | Self::AllPrimaryReplicasNotReplicating
        )
    }
}

impl fmt::Display for AnalysisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One anomaly (or the healthy baseline) for one cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisEntry {
    pub code: AnalysisCode,
    pub cluster_name: String,
    pub analyzed_key: InstanceKey,
    pub count_replicas: usize,
    pub count_valid_replicas: usize,
    pub count_valid_replicating_replicas: usize,
    pub is_downtimed: bool,
    pub detected_at: DateTime<Utc>,
}

/// Analyzer over the store's snapshot of the fleet
pub struct Analyzer {
    store: Arc<dyn TopologyStore>,
}

impl Analyzer {
    pub fn new(store: Arc<dyn TopologyStore>) -> Self {
        Self { store }
    }

    /// One analysis pass over every known cluster.
    #[instrument(skip(self))]
    pub async fn analyze(&self) -> Result<Vec<AnalysisEntry>> {
        let mut entries = Vec::new();
        for cluster in self.store.read_cluster_names().await? {
            let instances = self.store.read_cluster_instances(&cluster).await?;
            entries.extend(self.analyze_cluster(&cluster, &instances).await?);
        }
        debug!(entries = entries.len(), "Analysis pass complete");
        Ok(entries)
    }

    /// Entries for one cluster; a healthy cluster yields one `NoProblem`
    /// baseline anchored at its primary.
    pub async fn analyze_cluster(
        &self,
        cluster: &str,
        instances: &[Instance],
    ) -> Result<Vec<AnalysisEntry>> {
        let mut replicas_of: HashMap<&InstanceKey, Vec<&Instance>> = HashMap::new();
        for instance in instances {
            if let Some(upstream) = &instance.upstream_key {
                replicas_of.entry(upstream).or_default().push(instance);
            }
        }

        let mut entries = Vec::new();
        for instance in instances {
            let replicas = replicas_of
                .get(&instance.key)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if let Some(code) = classify(instance, replicas) {
                entries.push(self.entry(cluster, code, instance, replicas).await?);
            }
        }

        if entries.is_empty() {
            let primary = instances
                .iter()
                .find(|instance| instance.is_primary())
                .or_else(|| instances.first());
            if let Some(primary) = primary {
                let replicas = replicas_of
                    .get(&primary.key)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                entries.push(
                    self.entry(cluster, AnalysisCode::NoProblem, primary, replicas)
                        .await?,
                );
            }
        }
        Ok(entries)
    }

    async fn entry(
        &self,
        cluster: &str,
        code: AnalysisCode,
        instance: &Instance,
        replicas: &[&Instance],
    ) -> Result<AnalysisEntry> {
        let is_downtimed = self
            .store
            .active_downtime(&instance.key)
            .await?
            .is_some();
        Ok(AnalysisEntry {
            code,
            cluster_name: cluster.to_string(),
            analyzed_key: instance.key.clone(),
            count_replicas: replicas.len(),
            count_valid_replicas: replicas
                .iter()
                .filter(|replica| replica.is_last_check_valid)
                .count(),
            count_valid_replicating_replicas: replicas
                .iter()
                .filter(|replica| replica.is_last_check_valid && replica.replication_running())
                .count(),
            is_downtimed,
            detected_at: Utc::now(),
        })
    }
}

/// Classification over one instance and its direct replicas. Uses only
/// recent probe data; `None` means no anomaly at this node.
fn classify(instance: &Instance, replicas: &[&Instance]) -> Option<AnalysisCode> {
    let valid = instance.is_last_check_valid;
    let valid_replicas: Vec<&&Instance> =
        replicas.iter().filter(|r| r.is_last_check_valid).collect();
    let unreachable_replicas = replicas.len() - valid_replicas.len();
    let replicating = valid_replicas
        .iter()
        .filter(|r| r.replication_running())
        .count();

    if instance.is_primary() {
        if !valid {
            if replicas.is_empty() {
                return Some(AnalysisCode::UnreachablePrimary);
            }
            if replicating == 0 {
                // Every replica is broken or gone: the primary is dead.
                if unreachable_replicas > 0 {
                    return Some(AnalysisCode::DeadPrimaryAndSomeReplicas);
                }
                return Some(AnalysisCode::DeadPrimary);
            }
            // Replicas still stream: the primary is merely unreachable to us.
            return Some(AnalysisCode::UnreachablePrimary);
        }
        if !valid_replicas.is_empty() && replicating == 0 {
            return Some(AnalysisCode::AllPrimaryReplicasNotReplicating);
        }
        let failing_to_connect = valid_replicas
            .iter()
            .filter(|r| !r.replica_io_running && r.last_io_error.is_some())
            .count();
        if failing_to_connect == 1 && replicating == valid_replicas.len() - 1 {
            return Some(AnalysisCode::FirstTierReplicaFailingToConnectToPrimary);
        }
        return None;
    }

    // Non-root nodes.
    if !valid {
        if instance.is_binlog_server {
            return Some(AnalysisCode::BinlogServerFailure);
        }
        if !valid_replicas.is_empty() {
            return Some(AnalysisCode::DeadIntermediatePrimary);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::gtid::GtidSet;
    use canopy_core::{BinlogCoordinates, PromotionRule};
    use canopy_store::SqliteStore;

    fn make_instance(host: &str, upstream: Option<&str>, valid: bool, io: bool, sql: bool) -> Instance {
        Instance {
            key: InstanceKey::new(host, 3306),
            server_id: 1,
            version: "8.0.36".to_string(),
            server_uuid: None,
            is_co_primary: false,
            is_binlog_server: false,
            log_bin_enabled: true,
            log_replica_updates: true,
            binlog_format: "ROW".to_string(),
            read_only: upstream.is_some(),
            upstream_key: upstream.map(|u| InstanceKey::new(u, 3306)),
            replica_io_running: io,
            replica_sql_running: sql,
            executed_gtid_set: GtidSet::new(),
            retrieved_gtid_set: GtidSet::new(),
            using_gtid: false,
            auto_position: false,
            seconds_behind_primary: None,
            last_io_error: (!io && upstream.is_some())
                .then(|| "error reconnecting to source".to_string()),
            last_sql_error: None,
            self_coordinates: Some(BinlogCoordinates::binary("mysql-bin.000001", 4)),
            read_binlog_coordinates: None,
            exec_binlog_coordinates: None,
            relaylog_coordinates: None,
            cluster_name: "main".to_string(),
            data_center: "dc1".to_string(),
            promotion_rule: PromotionRule::Neutral,
            is_last_check_valid: valid,
            last_seen: Some(Utc::now()),
        }
    }

    async fn analyzer_with(instances: Vec<Instance>) -> Analyzer {
        let store = SqliteStore::in_memory().await.unwrap();
        for instance in &instances {
            store.write_instance(instance).await.unwrap();
        }
        Analyzer::new(Arc::new(store))
    }

    fn codes(entries: &[AnalysisEntry]) -> Vec<AnalysisCode> {
        entries.iter().map(|entry| entry.code).collect()
    }

    #[tokio::test]
    async fn test_healthy_cluster_is_no_problem() {
        let analyzer = analyzer_with(vec![
            make_instance("p", None, true, false, false),
            make_instance("a", Some("p"), true, true, true),
        ])
        .await;
        let entries = analyzer.analyze().await.unwrap();
        assert_eq!(codes(&entries), vec![AnalysisCode::NoProblem]);
        assert_eq!(entries[0].analyzed_key, InstanceKey::new("p", 3306));
        assert_eq!(entries[0].count_valid_replicating_replicas, 1);
    }

    #[tokio::test]
    async fn test_dead_primary() {
        let analyzer = analyzer_with(vec![
            make_instance("p", None, false, false, false),
            make_instance("a", Some("p"), true, false, true),
            make_instance("b", Some("p"), true, false, true),
        ])
        .await;
        let entries = analyzer.analyze().await.unwrap();
        assert_eq!(codes(&entries), vec![AnalysisCode::DeadPrimary]);
        assert_eq!(entries[0].count_replicas, 2);
        assert_eq!(entries[0].count_valid_replicas, 2);
    }

    #[tokio::test]
    async fn test_dead_primary_and_some_replicas() {
        let analyzer = analyzer_with(vec![
            make_instance("p", None, false, false, false),
            make_instance("a", Some("p"), true, false, true),
            make_instance("b", Some("p"), false, false, false),
        ])
        .await;
        let entries = analyzer.analyze().await.unwrap();
        assert_eq!(codes(&entries), vec![AnalysisCode::DeadPrimaryAndSomeReplicas]);
    }

    #[tokio::test]
    async fn test_unreachable_primary_with_streaming_replicas() {
        let analyzer = analyzer_with(vec![
            make_instance("p", None, false, false, false),
            make_instance("a", Some("p"), true, true, true),
        ])
        .await;
        let entries = analyzer.analyze().await.unwrap();
        assert_eq!(codes(&entries), vec![AnalysisCode::UnreachablePrimary]);
    }

    #[tokio::test]
    async fn test_dead_intermediate_primary() {
        let analyzer = analyzer_with(vec![
            make_instance("p", None, true, false, false),
            make_instance("mid", Some("p"), false, false, false),
            make_instance("leaf", Some("mid"), true, false, true),
        ])
        .await;
        let entries = analyzer.analyze().await.unwrap();
        assert!(codes(&entries).contains(&AnalysisCode::DeadIntermediatePrimary));
        let entry = entries
            .iter()
            .find(|entry| entry.code == AnalysisCode::DeadIntermediatePrimary)
            .unwrap();
        assert_eq!(entry.analyzed_key, InstanceKey::new("mid", 3306));
    }

    #[tokio::test]
    async fn test_all_replicas_stopped() {
        let mut a = make_instance("a", Some("p"), true, false, false);
        a.last_io_error = None;
        let mut b = make_instance("b", Some("p"), true, false, false);
        b.last_io_error = None;
        let analyzer = analyzer_with(vec![
            make_instance("p", None, true, false, false),
            a,
            b,
        ])
        .await;
        let entries = analyzer.analyze().await.unwrap();
        assert_eq!(codes(&entries), vec![AnalysisCode::AllPrimaryReplicasNotReplicating]);
    }

    #[tokio::test]
    async fn test_single_replica_failing_to_connect() {
        let analyzer = analyzer_with(vec![
            make_instance("p", None, true, false, false),
            make_instance("a", Some("p"), true, true, true),
            make_instance("b", Some("p"), true, false, true),
        ])
        .await;
        let entries = analyzer.analyze().await.unwrap();
        assert_eq!(
            codes(&entries),
            vec![AnalysisCode::FirstTierReplicaFailingToConnectToPrimary]
        );
    }

    #[tokio::test]
    async fn test_binlog_server_failure() {
        let mut bls = make_instance("bls", Some("p"), false, false, false);
        bls.is_binlog_server = true;
        let analyzer = analyzer_with(vec![
            make_instance("p", None, true, false, false),
            make_instance("a", Some("p"), true, true, true),
            bls,
        ])
        .await;
        let entries = analyzer.analyze().await.unwrap();
        assert!(codes(&entries).contains(&AnalysisCode::BinlogServerFailure));
    }

    #[tokio::test]
    async fn test_downtime_annotation() {
        let store = SqliteStore::in_memory().await.unwrap();
        let p = make_instance("p", None, false, false, false);
        let a = make_instance("a", Some("p"), true, false, true);
        store.write_instance(&p).await.unwrap();
        store.write_instance(&a).await.unwrap();
        store
            .begin_downtime(&p.key, "ops", "planned failover drill", None)
            .await
            .unwrap();

        let analyzer = Analyzer::new(Arc::new(store));
        let entries = analyzer.analyze().await.unwrap();
        assert_eq!(entries[0].code, AnalysisCode::DeadPrimary);
        assert!(entries[0].is_downtimed);
    }

    #[test]
    fn test_code_scoping() {
        assert!(AnalysisCode::DeadPrimary.is_actionable());
        assert!(AnalysisCode::DeadIntermediatePrimary.is_actionable());
        assert!(!AnalysisCode::UnreachablePrimary.is_actionable());
        assert!(AnalysisCode::DeadPrimary.concerns_primary());
        assert!(!AnalysisCode::DeadIntermediatePrimary.concerns_primary());
    }
}
