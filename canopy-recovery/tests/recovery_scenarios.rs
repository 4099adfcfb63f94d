//! End-to-end recovery scenarios over the fleet simulator.

use std::sync::Arc;
use std::time::Duration;

use canopy_core::{
    CachingResolver, IdentityResolver, InstanceKey, PromotionRule, TopologyError,
};
use canopy_recovery::{
    AnalysisCode, AnalysisEntry, Analyzer, ElectionConfig, HookRunner, LeaderElector,
    OrchestratorConfig, RecoveryOrchestrator,
};
use canopy_relocator::{
    ProbeConfig, Prober, PseudoGtidConfig, PseudoGtidMatcher, RegroupConfig, Regrouper,
    Relocator, RelocatorConfig, ReplicationDriver, SimFleet,
};
use canopy_store::{SqliteStore, TopologyStore};

const MARKER: &str = "drop view if exists `_pseudo_gtid_hint__asc:0001`";

fn key(text: &str) -> InstanceKey {
    text.parse().unwrap()
}

struct Rig {
    fleet: SimFleet,
    store: Arc<dyn TopologyStore>,
    prober: Arc<Prober>,
    analyzer: Analyzer,
    regrouper: Arc<Regrouper>,
}

async fn rig(fleet: SimFleet) -> Rig {
    let driver: Arc<dyn ReplicationDriver> = Arc::new(fleet.clone());
    let store: Arc<dyn TopologyStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let resolver = Arc::new(CachingResolver::new(
        Box::new(IdentityResolver),
        Duration::from_secs(60),
    ));
    let prober = Arc::new(Prober::new(
        driver.clone(),
        store.clone(),
        resolver,
        ProbeConfig::default(),
    ));
    let relocator = Arc::new(Relocator::new(
        driver.clone(),
        store.clone(),
        prober.clone(),
        PseudoGtidMatcher::new(driver.clone(), PseudoGtidConfig::default()),
        RelocatorConfig::default(),
    ));
    let regrouper = Arc::new(Regrouper::new(
        driver,
        store.clone(),
        prober.clone(),
        relocator,
        RegroupConfig::default(),
    ));
    Rig {
        fleet,
        store: store.clone(),
        prober,
        analyzer: Analyzer::new(store),
        regrouper,
    }
}

impl Rig {
    async fn seed(&self) {
        for key in self.fleet.all_keys() {
            let _ = self.prober.refresh(&key).await;
        }
        for key in self.fleet.all_keys() {
            let _ = self.prober.refresh(&key).await;
        }
    }

    fn elector(&self, owner: &str) -> Arc<LeaderElector> {
        Arc::new(LeaderElector::new(
            self.store.clone(),
            ElectionConfig {
                owner: owner.to_string(),
                lease_ttl: Duration::from_secs(60),
                renew_interval: Duration::from_secs(5),
            },
        ))
    }

    fn orchestrator(&self, elector: Arc<LeaderElector>) -> RecoveryOrchestrator {
        RecoveryOrchestrator::new(
            self.store.clone(),
            self.regrouper.clone(),
            elector,
            HookRunner::default(),
            OrchestratorConfig {
                recovery_period_block: Duration::from_secs(3600),
                skip_processes: true,
                ..Default::default()
            },
        )
    }

    async fn dead_primary_entry(&self) -> AnalysisEntry {
        self.analyzer
            .analyze()
            .await
            .unwrap()
            .into_iter()
            .find(|entry| entry.code == AnalysisCode::DeadPrimary)
            .expect("dead primary detected")
    }
}

/// Builds P with replicas A (prefer, most advanced), C (neutral, behind)
/// and D (must_not), then kills P.
async fn dead_primary_fixture() -> Rig {
    let fleet = SimFleet::new();
    let p = fleet.add_primary("p:3306");
    let a = fleet.add_replica("a:3306", "p:3306");
    let c = fleet.add_replica("c:3306", "p:3306");
    let d = fleet.add_replica("d:3306", "p:3306");
    fleet.update(&a, |s| s.promotion_rule = PromotionRule::Prefer);
    fleet.update(&d, |s| s.promotion_rule = PromotionRule::MustNot);

    fleet.commit(&p, MARKER, 150);
    fleet.commit(&p, "insert into t values (1)", 100);
    fleet.stop_replica(&c).await.unwrap();
    fleet.commit(&p, "insert into t values (2)", 100);

    let rig = rig(fleet).await;
    rig.seed().await;

    rig.fleet.set_unreachable(&p);
    rig.seed().await;
    rig
}

/// S4: a dead primary is analyzed and recovered: the preferred,
/// most-advanced replica is promoted, the lagging sibling re-parented
/// beneath it, and the must_not replica left for the operator.
#[tokio::test]
async fn s4_dead_primary_recovery() {
    let rig = dead_primary_fixture().await;
    let entry = rig.dead_primary_entry().await;
    assert_eq!(entry.analyzed_key, key("p:3306"));
    assert_eq!(entry.count_replicas, 3);

    let elector = rig.elector("peer-1");
    assert!(elector.campaign_once().await.unwrap());
    let orchestrator = rig.orchestrator(elector);

    let recovery = orchestrator
        .consider(&entry, None)
        .await
        .unwrap()
        .expect("recovery executed");

    assert!(recovery.is_successful);
    assert_eq!(recovery.successor_key, Some(key("a:3306")));
    assert!(recovery.ended_at.is_some());
    assert!(recovery.participating_keys.contains(&key("d:3306")));

    // Topology: A promoted and writable, C beneath A, D untouched.
    assert_eq!(rig.fleet.server(&key("a:3306")).upstream, None);
    assert!(!rig.fleet.server(&key("a:3306")).read_only);
    assert_eq!(
        rig.fleet.server(&key("c:3306")).upstream,
        Some(key("a:3306"))
    );
    assert_eq!(
        rig.fleet.server(&key("d:3306")).upstream,
        Some(key("p:3306"))
    );

    // The cluster lock was released on completion.
    assert!(rig
        .store
        .read_active_recovery(&entry.cluster_name)
        .await
        .unwrap()
        .is_none());
}

/// S5: an immediate re-trigger of the same failure is debounced into a
/// blocked-recovery record; nothing runs.
#[tokio::test]
async fn s5_debounced_retrigger() {
    let rig = dead_primary_fixture().await;
    let entry = rig.dead_primary_entry().await;

    let elector = rig.elector("peer-1");
    assert!(elector.campaign_once().await.unwrap());
    let orchestrator = rig.orchestrator(elector);

    let first = orchestrator
        .consider(&entry, None)
        .await
        .unwrap()
        .expect("first recovery executed");

    // Inject the same analysis again.
    let second = orchestrator.consider(&entry, None).await.unwrap();
    assert!(second.is_none());

    let blocked = rig
        .store
        .read_blocked_recoveries(&entry.cluster_name)
        .await
        .unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].blocking_recovery_id, Some(first.id));

    // Exactly one recovery exists; none is open.
    let recent = rig
        .store
        .read_recent_recoveries(&entry.cluster_name, "DeadPrimary", Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);

    // Acknowledgement waives the debounce.
    orchestrator
        .acknowledge(first.id, "alice", "verified the promotion")
        .await
        .unwrap();
    let after_ack = orchestrator.consider(&entry, None).await;
    // The analysis is stale by now (the topology healed) so the recovery
    // itself fails, but it is no longer debounced: a new record opened.
    let recent = rig
        .store
        .read_recent_recoveries(&entry.cluster_name, "DeadPrimary", Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
    assert!(after_ack.is_err() || after_ack.unwrap().is_some());
}

/// S6: with peer-1 holding the lease, peer-2's attempt fails with
/// `LockContended` and the store ends up with exactly one recovery record.
#[tokio::test]
async fn s6_split_brain_guard() {
    let rig = dead_primary_fixture().await;
    let entry = rig.dead_primary_entry().await;

    let peer1 = rig.elector("peer-1");
    let peer2 = rig.elector("peer-2");
    assert!(peer1.campaign_once().await.unwrap());
    assert!(!peer2.campaign_once().await.unwrap());

    let orchestrator1 = rig.orchestrator(peer1);
    let orchestrator2 = rig.orchestrator(peer2);

    let rejected = orchestrator2.consider(&entry, None).await;
    assert!(matches!(rejected, Err(TopologyError::LockContended(_))));

    let recovery = orchestrator1
        .consider(&entry, None)
        .await
        .unwrap()
        .expect("leader recovered");
    assert!(recovery.is_successful);

    let recent = rig
        .store
        .read_recent_recoveries(&entry.cluster_name, "DeadPrimary", Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);
}

/// A candidate hint biases the election.
#[tokio::test]
async fn candidate_hint_biases_promotion() {
    let fleet = SimFleet::new();
    let p = fleet.add_primary("p:3306");
    fleet.add_replica("a:3306", "p:3306");
    fleet.add_replica("b:3306", "p:3306");
    fleet.commit(&p, "insert into t values (1)", 100);

    let rig = rig(fleet).await;
    rig.seed().await;
    rig.fleet.set_unreachable(&p);
    rig.seed().await;

    let entry = rig.dead_primary_entry().await;
    let elector = rig.elector("peer-1");
    assert!(elector.campaign_once().await.unwrap());
    let orchestrator = rig.orchestrator(elector);

    let hint = key("b:3306");
    let recovery = orchestrator
        .consider(&entry, Some(&hint))
        .await
        .unwrap()
        .expect("recovery executed");
    assert_eq!(recovery.successor_key, Some(hint));
}

/// A downtimed primary is filtered, recorded and left alone.
#[tokio::test]
async fn downtimed_cluster_is_filtered() {
    let rig = dead_primary_fixture().await;
    let entry = rig.dead_primary_entry().await;
    rig.store
        .begin_downtime(&entry.analyzed_key, "ops", "maintenance window", None)
        .await
        .unwrap();

    let elector = rig.elector("peer-1");
    assert!(elector.campaign_once().await.unwrap());
    let orchestrator = rig.orchestrator(elector);

    let outcome = orchestrator.consider(&entry, None).await.unwrap();
    assert!(outcome.is_none());

    let blocked = rig
        .store
        .read_blocked_recoveries(&entry.cluster_name)
        .await
        .unwrap();
    assert_eq!(blocked.len(), 1);
    assert!(blocked[0].reason.contains("downtimed"));
    // No promotion happened.
    assert_eq!(
        rig.fleet.server(&key("a:3306")).upstream,
        Some(key("p:3306"))
    );
}
