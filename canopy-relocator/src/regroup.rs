//! Regroup engine
//!
//! When an upstream dies, its orphaned replicas elect a promotion candidate
//! and the rest are re-enslaved beneath it. Election ranks by candidate
//! hint, promotion rule, most-advanced applied position, data-center
//! affinity and version, with server-id as the deterministic tie breaker.

use std::cmp::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use canopy_core::{Instance, InstanceKey, PromotionRule, Result, TopologyError};
use canopy_store::TopologyStore;

use crate::driver::ReplicationDriver;
use crate::planner::Relocator;
use crate::probe::Prober;

/// Regroup configuration
#[derive(Debug, Clone)]
pub struct RegroupConfig {
    /// Bounded parallelism of the pre-election refresh
    pub refresh_parallelism: usize,
}

impl Default for RegroupConfig {
    fn default() -> Self {
        Self {
            refresh_parallelism: 8,
        }
    }
}

/// Outcome of one regroup
///
/// The buckets partition the dead upstream's replica set: every replica
/// lands in exactly one of them or is the promoted candidate.
#[derive(Debug)]
pub struct RegroupResult {
    /// Elected and detached new upstream
    pub promoted: Instance,
    /// Successfully re-enslaved beneath the promoted candidate
    pub equal: Vec<Instance>,
    /// More advanced than the promoted candidate; cannot follow without
    /// data loss and are left untouched
    pub ahead: Vec<Instance>,
    /// Unreachable, excluded by promotion rule, or failed by the planner
    pub lost: Vec<Instance>,
    /// Unable to replicate from the candidate (version or binlog format)
    pub cannot_replicate: Vec<Instance>,
}

impl RegroupResult {
    /// Keys of every instance touched by the regroup, the promoted one
    /// included.
    pub fn participants(&self) -> Vec<InstanceKey> {
        let mut keys = vec![self.promoted.key.clone()];
        for bucket in [&self.equal, &self.ahead, &self.lost, &self.cannot_replicate] {
            keys.extend(bucket.iter().map(|instance| instance.key.clone()));
        }
        keys
    }
}

/// Elects and promotes among orphaned siblings
pub struct Regrouper {
    driver: Arc<dyn ReplicationDriver>,
    store: Arc<dyn TopologyStore>,
    prober: Arc<Prober>,
    relocator: Arc<Relocator>,
    config: RegroupConfig,
}

impl Regrouper {
    pub fn new(
        driver: Arc<dyn ReplicationDriver>,
        store: Arc<dyn TopologyStore>,
        prober: Arc<Prober>,
        relocator: Arc<Relocator>,
        config: RegroupConfig,
    ) -> Self {
        Self {
            driver,
            store,
            prober,
            relocator,
            config,
        }
    }

    /// Regroup the replicas of a dead upstream beneath an elected candidate.
    #[instrument(skip(self), fields(dead = %dead_upstream))]
    pub async fn regroup(
        &self,
        dead_upstream: &InstanceKey,
        candidate_hint: Option<&InstanceKey>,
    ) -> Result<RegroupResult> {
        let stored = self.store.read_replicas(dead_upstream).await?;
        if stored.is_empty() {
            return Err(TopologyError::InvariantViolation(format!(
                "{dead_upstream} has no known replicas to regroup"
            )));
        }
        let dead_data_center = self
            .store
            .read_instance(dead_upstream)
            .await?
            .map(|instance| instance.data_center)
            .unwrap_or_default();

        // Refresh the orphans in parallel under a bounded pool; replicas
        // that no longer answer are lost up front.
        let semaphore = Arc::new(Semaphore::new(self.config.refresh_parallelism));
        let refreshed = join_all(stored.iter().map(|replica| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                (replica, self.prober.refresh(&replica.key).await)
            }
        }))
        .await;

        let mut live: Vec<Instance> = Vec::new();
        let mut lost: Vec<Instance> = Vec::new();
        for (stored_replica, result) in refreshed {
            match result {
                Ok(instance) => live.push(instance),
                Err(e) => {
                    warn!(key = %stored_replica.key, error = %e, "Orphan unreachable, marked lost");
                    lost.push(stored_replica.clone());
                }
            }
        }

        let promoted = self.elect(&live, candidate_hint, &dead_data_center)?;
        info!(promoted = %promoted.key, "Promotion candidate elected");

        // Detach the candidate and make it writable.
        self.driver.stop_replica(&promoted.key).await?;
        self.driver.reset_replica(&promoted.key).await?;
        self.driver.set_read_only(&promoted.key, false).await?;
        let promoted_refreshed = self.prober.refresh(&promoted.key).await?;
        self.store
            .append_audit(
                Some(&promoted.key),
                &format!("promoted in place of {dead_upstream}"),
            )
            .await?;

        let mut equal = Vec::new();
        let mut ahead = Vec::new();
        let mut cannot_replicate = Vec::new();
        for sibling in live {
            if sibling.key == promoted.key {
                continue;
            }
            if sibling.promotion_rule == PromotionRule::MustNot {
                // Excluded from automatic re-parenting; an operator decides.
                lost.push(sibling);
                continue;
            }
            if !can_follow(&sibling, &promoted) {
                cannot_replicate.push(sibling);
                continue;
            }
            if is_ahead_of(&sibling, &promoted) {
                ahead.push(sibling);
                continue;
            }
            match self
                .relocator
                .relocate_orphan(&sibling.key, &promoted.key)
                .await
            {
                Ok(moved) => equal.push(moved),
                Err(e) => {
                    warn!(key = %sibling.key, error = %e, "Re-enslaving failed, marked lost");
                    lost.push(sibling);
                }
            }
        }

        info!(
            promoted = %promoted_refreshed.key,
            joined = equal.len(),
            ahead = ahead.len(),
            lost = lost.len(),
            cannot_replicate = cannot_replicate.len(),
            "Regroup finished"
        );
        Ok(RegroupResult {
            promoted: promoted_refreshed,
            equal,
            ahead,
            lost,
            cannot_replicate,
        })
    }

    /// Rank the live orphans and pick the top candidate.
    fn elect(
        &self,
        live: &[Instance],
        candidate_hint: Option<&InstanceKey>,
        dead_data_center: &str,
    ) -> Result<Instance> {
        let mut candidates: Vec<&Instance> = live
            .iter()
            .filter(|instance| instance.can_be_upstream())
            .filter(|instance| instance.promotion_rule != PromotionRule::MustNot)
            .collect();
        if candidates.is_empty() {
            return Err(TopologyError::InvariantViolation(
                "no promotable candidate among the orphaned replicas".to_string(),
            ));
        }
        candidates.sort_by(|a, b| compare_candidates(a, b, candidate_hint, dead_data_center));
        Ok(candidates[0].clone())
    }
}

/// Whether `follower` can replicate from `candidate`.
///
/// The promoted version must be at or above its followers', and a
/// statement-format follower cannot apply a row-format stream.
fn can_follow(follower: &Instance, candidate: &Instance) -> bool {
    if compare_versions(&follower.version, &candidate.version) == Ordering::Greater {
        return false;
    }
    !(candidate.binlog_format == "ROW" && follower.binlog_format == "STATEMENT")
}

/// Whether `sibling` has applied more of the dead upstream's stream than
/// the candidate.
fn is_ahead_of(sibling: &Instance, candidate: &Instance) -> bool {
    if !candidate.executed_gtid_set.is_empty() || !sibling.executed_gtid_set.is_empty() {
        let extra = sibling.executed_gtid_set.subtract(&candidate.executed_gtid_set);
        if !extra.is_empty() {
            return true;
        }
        if !sibling.executed_gtid_set.is_empty() {
            return false;
        }
    }
    match (
        &sibling.exec_binlog_coordinates,
        &candidate.exec_binlog_coordinates,
    ) {
        (Some(sibling_exec), Some(candidate_exec)) => candidate_exec.smaller_than(sibling_exec),
        _ => false,
    }
}

/// Election order: better candidates sort first.
fn compare_candidates(
    a: &Instance,
    b: &Instance,
    hint: Option<&InstanceKey>,
    dead_data_center: &str,
) -> Ordering {
    let hinted = |instance: &Instance| Some(&instance.key) != hint;
    let dc_miss = |instance: &Instance| instance.data_center != dead_data_center;
    hinted(a)
        .cmp(&hinted(b))
        .then_with(|| a.promotion_rule.cmp(&b.promotion_rule))
        .then_with(|| compare_advancement(b, a))
        .then_with(|| dc_miss(a).cmp(&dc_miss(b)))
        .then_with(|| compare_versions(&b.version, &a.version))
        .then_with(|| a.server_id.cmp(&b.server_id))
}

/// More-advanced ordering: GTID superset wins, then upstream-space
/// coordinates, then executed-set cardinality.
fn compare_advancement(a: &Instance, b: &Instance) -> Ordering {
    let a_set = &a.executed_gtid_set;
    let b_set = &b.executed_gtid_set;
    if !a_set.is_empty() || !b_set.is_empty() {
        let a_over_b = a_set.contains_set(b_set);
        let b_over_a = b_set.contains_set(a_set);
        match (a_over_b, b_over_a) {
            (true, false) => return Ordering::Greater,
            (false, true) => return Ordering::Less,
            _ => {}
        }
    }
    if let (Some(a_exec), Some(b_exec)) =
        (&a.exec_binlog_coordinates, &b.exec_binlog_coordinates)
    {
        let by_coords = a_exec.cmp(b_exec);
        if by_coords != Ordering::Equal {
            return by_coords;
        }
    }
    a_set.cardinality().cmp(&b_set.cardinality())
}

/// Numeric segment comparison of dotted version strings.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |text: &str| -> Vec<u64> {
        text.split('.')
            .map(|segment| {
                segment
                    .chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };
    parse(a).cmp(&parse(b))
}
