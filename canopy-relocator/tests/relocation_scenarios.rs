//! End-to-end relocation scenarios over the fleet simulator.

use std::sync::Arc;
use std::time::Duration;

use canopy_core::{CachingResolver, IdentityResolver, InstanceKey, TopologyError};
use canopy_relocator::{
    ProbeConfig, Prober, PseudoGtidConfig, PseudoGtidMatcher, Relocator, RelocatorConfig,
    ReplicationDriver, SimFleet,
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
    relocator: Relocator,
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
    let relocator = Relocator::new(
        driver.clone(),
        store.clone(),
        prober.clone(),
        PseudoGtidMatcher::new(driver, PseudoGtidConfig::default()),
        RelocatorConfig::default(),
    );
    Rig {
        fleet,
        store,
        prober,
        relocator,
    }
}

impl Rig {
    async fn seed(&self) {
        // Probe primaries before replicas so cluster names inherit.
        for key in self.fleet.all_keys() {
            let _ = self.prober.refresh(&key).await;
        }
        for key in self.fleet.all_keys() {
            let _ = self.prober.refresh(&key).await;
        }
    }
}

/// S1: with both siblings at the same position, the move is trivial and
/// disturbs neither the target nor the primary.
#[tokio::test]
async fn s1_trivial_sibling_move() {
    let fleet = SimFleet::new();
    let p = fleet.add_primary("p:3306");
    let a = fleet.add_replica("a:3306", "p:3306");
    let b = fleet.add_replica("b:3306", "p:3306");
    fleet.commit(&p, "insert into t values (1)", 100);

    let rig = rig(fleet).await;
    rig.seed().await;

    let p_before = rig.fleet.server(&p);
    let b_before = rig.fleet.server(&b);

    let moved = rig.relocator.relocate_below(&a, &b).await.unwrap();
    assert_eq!(moved.upstream_key, Some(b.clone()));

    // A replicates from B at B's own coordinates.
    let a_server = rig.fleet.server(&a);
    assert_eq!(a_server.upstream, Some(b.clone()));
    assert!(a_server
        .exec_upstream
        .as_ref()
        .unwrap()
        .equals(&b_before.binlog_tail()));

    // B and P are unchanged.
    let b_after = rig.fleet.server(&b);
    assert_eq!(b_after.upstream, Some(p.clone()));
    assert!(b_after.binlog_tail().equals(&b_before.binlog_tail()));
    let p_after = rig.fleet.server(&p);
    assert_eq!(p_after.upstream, None);
    assert!(p_after.binlog_tail().equals(&p_before.binlog_tail()));
}

/// S2: a GTID-capable grandchild hops over its intermediate onto the
/// primary without losing transactions.
#[tokio::test]
async fn s2_gtid_relocation_across_tiers() {
    let fleet = SimFleet::new();
    let p = fleet.add_primary("p:3306");
    let a = fleet.add_replica("a:3306", "p:3306");
    let b = fleet.add_replica("b:3306", "a:3306");
    for k in [&p, &a, &b] {
        fleet.update(k, |s| s.using_gtid = true);
    }
    let source = uuid::Uuid::new_v4();
    fleet.commit_gtid(&p, source, 1, "insert into t values (1)", 100);
    fleet.commit_gtid(&p, source, 2, "insert into t values (2)", 100);
    // B lags behind A so the move cannot be resolved by draining alone.
    fleet.stop_replica(&b).await.unwrap();
    fleet.commit_gtid(&p, source, 3, "insert into t values (3)", 100);

    let rig = rig(fleet).await;
    rig.seed().await;

    let executed_at_stop = rig.fleet.server(&b).executed_gtid.clone();

    let moved = rig.relocator.relocate_below(&b, &p).await.unwrap();
    assert_eq!(moved.upstream_key, Some(p.clone()));
    assert!(moved.auto_position);

    // Nothing executed was lost across the move.
    assert!(rig
        .fleet
        .server(&b)
        .executed_gtid
        .contains_set(&executed_at_stop));

    // B now receives directly from P.
    fleet_commit_and_assert(&rig, &p, &b, source).await;
}

async fn fleet_commit_and_assert(
    rig: &Rig,
    p: &InstanceKey,
    b: &InstanceKey,
    source: uuid::Uuid,
) {
    rig.fleet
        .commit_gtid(p, source, 4, "insert into t values (4)", 100);
    let b_server = rig.fleet.server(b);
    assert_eq!(b_server.executed_gtid.cardinality(), 4);
}

/// S3: a replica with an errant local write is refused: the histories have
/// diverged and no source change is executed.
#[tokio::test]
async fn s3_pseudo_gtid_divergence_aborts() {
    let fleet = SimFleet::new();
    let p = fleet.add_primary("p:3306");
    fleet.add_replica("a:3306", "p:3306");
    let b = fleet.add_replica("b:3306", "a:3306");

    fleet.commit(&p, MARKER, 150);
    fleet.commit(&p, "insert into t values (1)", 100);
    // B stops receiving, then an operator corrupts it with a direct write.
    fleet.stop_replica(&b).await.unwrap();
    fleet.commit(&p, "insert into t values (2)", 100);
    fleet.corrupt(&b, "insert into t values (666)", 100);

    let rig = rig(fleet).await;
    rig.seed().await;

    let result = rig.relocator.relocate_below(&b, &p).await;
    assert!(matches!(result, Err(TopologyError::DivergedHistories(_))));

    // No CHANGE REPLICATION SOURCE was executed against B.
    assert!(!rig
        .fleet
        .ops()
        .iter()
        .any(|op| op.starts_with("change-source b:3306")));
    assert_eq!(rig.fleet.server(&b).upstream, Some(key("a:3306")));

    // The failure is on the audit trail and the maintenance lock is free.
    assert!(!rig.store.in_maintenance(&b).await.unwrap());
    let audit = rig.store.read_audit(10).await.unwrap();
    assert!(audit
        .iter()
        .any(|entry| entry.message.contains("relocation below p:3306 failed")));
}
