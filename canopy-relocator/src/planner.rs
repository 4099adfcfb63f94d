//! Relocation planner
//!
//! Re-parents a replica (or a sibling group) under a new upstream while
//! preserving replication-stream consistency. Method selection is a pure
//! function over fresh snapshots; execution is `stop -> change source ->
//! start` under the store's per-instance maintenance lock.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use canopy_core::{Instance, InstanceKey, Result, TopologyError};
use canopy_store::TopologyStore;

use crate::driver::{ReplicationDriver, SourcePosition};
use crate::probe::Prober;
use crate::pseudo_gtid::{MarkerIndex, PseudoGtidMatcher};

/// How a re-parent is carried out, in selection preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationMethod {
    /// Target shares the source's upstream at the identical position
    TrivialSibling,
    /// Target is the source's grandparent and the source has drained its
    /// parent's binlog
    MoveUp,
    /// GTID auto-positioning
    Gtid,
    /// Target is a binlog server preserving upstream coordinates
    BinlogServer,
    /// A stored coordinate equivalence covers the source's position
    Equivalence,
    /// Pseudo-GTID marker matching
    PseudoGtid,
}

impl fmt::Display for RelocationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::TrivialSibling => "trivial-sibling",
            Self::MoveUp => "move-up",
            Self::Gtid => "gtid",
            Self::BinlogServer => "binlog-server",
            Self::Equivalence => "equivalence",
            Self::PseudoGtid => "pseudo-gtid",
        };
        write!(f, "{text}")
    }
}

/// Planner configuration
#[derive(Debug, Clone)]
pub struct RelocatorConfig {
    /// Budget for draining a replica's relay backlog before re-pointing
    pub stop_timeout: Duration,
    /// Bounded parallelism of bulk relocations
    pub bulk_parallelism: usize,
}

impl Default for RelocatorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(30),
            bulk_parallelism: 4,
        }
    }
}

/// Relocation engine
pub struct Relocator {
    driver: Arc<dyn ReplicationDriver>,
    store: Arc<dyn TopologyStore>,
    prober: Arc<Prober>,
    matcher: PseudoGtidMatcher,
    config: RelocatorConfig,
}

impl Relocator {
    pub fn new(
        driver: Arc<dyn ReplicationDriver>,
        store: Arc<dyn TopologyStore>,
        prober: Arc<Prober>,
        matcher: PseudoGtidMatcher,
        config: RelocatorConfig,
    ) -> Self {
        Self {
            driver,
            store,
            prober,
            matcher,
            config,
        }
    }

    /// Re-parent `source` such that its new upstream is `target`.
    ///
    /// Returns the refreshed source. Preconditions: both reachable, target
    /// distinct from source and not its descendant, cluster membership
    /// preserved.
    #[instrument(skip(self), fields(source = %source_key, target = %target_key))]
    pub async fn relocate_below(
        &self,
        source_key: &InstanceKey,
        target_key: &InstanceKey,
    ) -> Result<Instance> {
        let source = self.prober.read(source_key).await?;
        let target = self.prober.read(target_key).await?;
        self.check_preconditions(&source, &target, true).await?;
        self.execute(&source, &target, None, true).await
    }

    /// Variant used by the regroup engine: the orphans are already known to
    /// be one tree and cluster naming is in flux mid-failover, so cluster
    /// membership is not enforced; cycle protection still is.
    pub(crate) async fn relocate_orphan(
        &self,
        source_key: &InstanceKey,
        target_key: &InstanceKey,
    ) -> Result<Instance> {
        let source = self.prober.read(source_key).await?;
        let target = self.prober.read(target_key).await?;
        self.check_preconditions(&source, &target, false).await?;
        self.execute(&source, &target, None, false).await
    }

    /// Re-parent all of `source`'s replicas (optionally filtered by a
    /// hostname pattern) below `target`. Per-replica failures are collected
    /// rather than aborting the operation.
    #[instrument(skip(self), fields(source = %source_key, target = %target_key))]
    pub async fn relocate_replicas(
        &self,
        source_key: &InstanceKey,
        target_key: &InstanceKey,
        pattern: Option<&str>,
    ) -> Result<(Vec<Instance>, Vec<(InstanceKey, TopologyError)>)> {
        let target = self.prober.read(target_key).await?;
        let filter = pattern
            .map(Regex::new)
            .transpose()
            .map_err(|e| TopologyError::InvariantViolation(format!("bad hostname pattern: {e}")))?;

        let replicas: Vec<Instance> = self
            .store
            .read_replicas(source_key)
            .await?
            .into_iter()
            .filter(|replica| replica.key != target.key)
            .filter(|replica| {
                filter
                    .as_ref()
                    .map_or(true, |filter| filter.is_match(&replica.key.hostname))
            })
            .collect();

        let mut moved = Vec::new();
        let mut errors: Vec<(InstanceKey, TopologyError)> = Vec::new();

        // Bucket by planned method so the pseudo-gtid bucket can share one
        // target marker scan; everything else runs under the semaphore.
        let mut pseudo_bucket = Vec::new();
        let mut direct_bucket = Vec::new();
        for replica in replicas {
            match self.select_method(&replica, &target).await {
                Ok(RelocationMethod::PseudoGtid) => pseudo_bucket.push(replica),
                Ok(_) => direct_bucket.push(replica),
                Err(e) => errors.push((replica.key.clone(), e)),
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.bulk_parallelism));
        let target_ref = &target;
        let direct_results = join_all(direct_bucket.iter().map(|replica| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                (replica.key.clone(), self.execute(replica, target_ref, None, true).await)
            }
        }))
        .await;
        for (key, result) in direct_results {
            match result {
                Ok(instance) => moved.push(instance),
                Err(e) => errors.push((key, e)),
            }
        }

        if !pseudo_bucket.is_empty() {
            match self.matcher.build_marker_index(&target).await {
                Ok(index) => {
                    let index_ref = &index;
                    let results = join_all(pseudo_bucket.iter().map(|replica| {
                        let semaphore = semaphore.clone();
                        async move {
                            let _permit = semaphore.acquire().await.expect("semaphore open");
                            (
                                replica.key.clone(),
                                self.execute(replica, target_ref, Some(index_ref), true).await,
                            )
                        }
                    }))
                    .await;
                    for (key, result) in results {
                        match result {
                            Ok(instance) => moved.push(instance),
                            Err(e) => errors.push((key, e)),
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Shared marker scan failed; pseudo-gtid bucket skipped");
                    let reason = e.to_string();
                    for replica in pseudo_bucket {
                        errors.push((
                            replica.key.clone(),
                            TopologyError::NoSharedHistory {
                                src: replica.key.to_string(),
                                target: target.key.to_string(),
                                reason: reason.clone(),
                            },
                        ));
                    }
                }
            }
        }

        info!(moved = moved.len(), failed = errors.len(), "Bulk relocation finished");
        Ok((moved, errors))
    }

    /// Pick the first applicable method, highest preference first.
    pub async fn select_method(
        &self,
        source: &Instance,
        target: &Instance,
    ) -> Result<RelocationMethod> {
        // 1. Trivial sibling move: shared upstream, identical applied
        //    position; the source attaches at the target's own coordinates.
        if source.upstream_key.is_some()
            && source.upstream_key == target.upstream_key
            && target.can_be_upstream()
            && target.self_coordinates.is_some()
        {
            if let (Some(source_exec), Some(target_exec)) = (
                &source.exec_binlog_coordinates,
                &target.exec_binlog_coordinates,
            ) {
                if source_exec.equals(target_exec) {
                    return Ok(RelocationMethod::TrivialSibling);
                }
            }
        }

        // 2. Move up: target is the grandparent and the source has applied
        //    the whole of its parent's binlog.
        if let Some(parent_key) = &source.upstream_key {
            if let Some(parent) = self.store.read_instance(parent_key).await? {
                if parent.upstream_key.as_ref() == Some(&target.key)
                    && parent.exec_binlog_coordinates.is_some()
                {
                    if let (Some(source_exec), Some(parent_self)) =
                        (&source.exec_binlog_coordinates, &parent.self_coordinates)
                    {
                        if source_exec.equals(parent_self) {
                            return Ok(RelocationMethod::MoveUp);
                        }
                    }
                }
            }
        }

        // 3. GTID: both capable, sharing at least one source lineage.
        if source.supports_gtid()
            && target.supports_gtid()
            && source
                .executed_gtid_set
                .shares_source_with(&target.executed_gtid_set)
        {
            return Ok(RelocationMethod::Gtid);
        }

        // 4. Binlog servers mirror their upstream's coordinates; replicas
        //    may point at them verbatim.
        if target.is_binlog_server
            && source.upstream_key.is_some()
            && target.upstream_key == source.upstream_key
            && source.exec_binlog_coordinates.is_some()
        {
            return Ok(RelocationMethod::BinlogServer);
        }

        // 5. A previously observed equivalence covering the source's
        //    position on its upstream.
        if let (Some(upstream), Some(exec)) =
            (&source.upstream_key, &source.exec_binlog_coordinates)
        {
            let equivalents = self.store.find_equivalent(upstream, exec).await?;
            if equivalents.iter().any(|(key, _)| key == &target.key) {
                return Ok(RelocationMethod::Equivalence);
            }
        }

        // 6. Pseudo-GTID as the general fallback.
        if target.can_be_upstream() && target.self_coordinates.is_some() {
            return Ok(RelocationMethod::PseudoGtid);
        }

        Err(TopologyError::NoRelocationMethod {
            src: source.key.to_string(),
            target: target.key.to_string(),
        })
    }

    async fn check_preconditions(
        &self,
        source: &Instance,
        target: &Instance,
        enforce_cluster: bool,
    ) -> Result<()> {
        if source.key == target.key {
            return Err(TopologyError::InvariantViolation(format!(
                "cannot relocate {} below itself",
                source.key
            )));
        }
        if enforce_cluster && source.cluster_name != target.cluster_name {
            return Err(TopologyError::InvariantViolation(format!(
                "{} (cluster {}) and {} (cluster {}) are not cluster members",
                source.key, source.cluster_name, target.key, target.cluster_name
            )));
        }
        if self.is_descendant(&target.key, &source.key).await? {
            return Err(TopologyError::InvariantViolation(format!(
                "{} descends from {}; relocation would form a cycle",
                target.key, source.key
            )));
        }
        Ok(())
    }

    /// Whether `node` transitively replicates from `ancestor`, walking the
    /// stored upstream pointers with cycle protection.
    async fn is_descendant(&self, node: &InstanceKey, ancestor: &InstanceKey) -> Result<bool> {
        let mut seen: HashSet<InstanceKey> = HashSet::new();
        let mut current = node.clone();
        loop {
            let Some(instance) = self.store.read_instance(&current).await? else {
                return Ok(false);
            };
            let Some(upstream) = instance.upstream_key else {
                return Ok(false);
            };
            if upstream == *ancestor {
                return Ok(true);
            }
            if !seen.insert(upstream.clone()) {
                // Co-primary cycle exhausted.
                return Ok(false);
            }
            current = upstream;
        }
    }

    /// Stop, re-point, start; the source is maintenance-locked in the store
    /// for the duration and the lock is released on every exit path.
    async fn execute(
        &self,
        source: &Instance,
        target: &Instance,
        shared_index: Option<&MarkerIndex>,
        enforce_cluster: bool,
    ) -> Result<Instance> {
        // Re-read the source: stored snapshots (the bulk path) may be stale.
        let source = &self.prober.read(&source.key).await?;
        self.check_preconditions(source, target, enforce_cluster).await?;
        let token = self
            .store
            .begin_maintenance(
                &source.key,
                "canopy",
                &format!("relocating below {}", target.key),
            )
            .await?;
        let result = self.execute_locked(source, target, shared_index).await;
        if let Err(e) = self.store.end_maintenance(token).await {
            warn!(key = %source.key, error = %e, "Could not release maintenance");
        }
        match &result {
            Ok(_) => {
                let _ = self
                    .store
                    .append_audit(
                        Some(&source.key),
                        &format!("relocated below {}", target.key),
                    )
                    .await;
            }
            Err(e) => {
                let _ = self
                    .store
                    .append_audit(
                        Some(&source.key),
                        &format!("relocation below {} failed: {e}", target.key),
                    )
                    .await;
            }
        }
        result
    }

    async fn execute_locked(
        &self,
        source: &Instance,
        target: &Instance,
        shared_index: Option<&MarkerIndex>,
    ) -> Result<Instance> {
        // Drain the relay backlog before stopping so position translation
        // sees everything the source will have applied.
        self.driver
            .stop_replica_nicely(&source.key, self.config.stop_timeout)
            .await?;
        let stopped = self.prober.refresh(&source.key).await?;

        // Re-derive method and position from the quiesced snapshot; the
        // running one may have advanced since planning.
        let outcome = async {
            let method = self.select_method(&stopped, target).await?;
            let position = self
                .compute_position(&stopped, target, method, shared_index)
                .await?;
            Ok::<_, TopologyError>((method, position))
        }
        .await;
        let (method, position) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                // Nothing was re-pointed; resume the old stream.
                if stopped.upstream_key.is_some() {
                    let _ = self.driver.start_replica(&source.key).await;
                }
                return Err(e);
            }
        };

        info!(source = %source.key, target = %target.key, method = %method, "Relocating");
        self.driver
            .change_replication_source(&source.key, &target.key, position)
            .await?;
        self.driver.start_replica(&source.key).await?;

        let refreshed = self.prober.refresh(&source.key).await?;
        if refreshed.upstream_key.as_ref() != Some(&target.key) {
            return Err(TopologyError::InvariantViolation(format!(
                "{} does not replicate from {} after relocation",
                source.key, target.key
            )));
        }
        Ok(refreshed)
    }

    async fn compute_position(
        &self,
        source: &Instance,
        target: &Instance,
        method: RelocationMethod,
        shared_index: Option<&MarkerIndex>,
    ) -> Result<SourcePosition> {
        let position = match method {
            RelocationMethod::TrivialSibling => {
                let coordinates = target.self_coordinates.clone().ok_or_else(|| {
                    TopologyError::InvariantViolation(format!(
                        "{} has no binlog coordinates",
                        target.key
                    ))
                })?;
                SourcePosition::Coordinates(coordinates)
            }
            RelocationMethod::MoveUp => {
                let parent_key = source.upstream_key.clone().ok_or_else(|| {
                    TopologyError::InvariantViolation(format!("{} has no upstream", source.key))
                })?;
                let parent = self.prober.read(&parent_key).await?;
                let coordinates = parent.exec_binlog_coordinates.clone().ok_or_else(|| {
                    TopologyError::InvariantViolation(format!(
                        "{parent_key} records no position on its upstream"
                    ))
                })?;
                SourcePosition::Coordinates(coordinates)
            }
            RelocationMethod::Gtid => SourcePosition::AutoPosition,
            RelocationMethod::BinlogServer => {
                let coordinates = source.exec_binlog_coordinates.clone().ok_or_else(|| {
                    TopologyError::InvariantViolation(format!(
                        "{} has no executed coordinates",
                        source.key
                    ))
                })?;
                SourcePosition::Coordinates(coordinates)
            }
            RelocationMethod::Equivalence => {
                let (upstream, exec) = match (&source.upstream_key, &source.exec_binlog_coordinates)
                {
                    (Some(upstream), Some(exec)) => (upstream, exec),
                    _ => {
                        return Err(TopologyError::InvariantViolation(format!(
                            "{} has no upstream position for equivalence",
                            source.key
                        )))
                    }
                };
                let equivalents = self.store.find_equivalent(upstream, exec).await?;
                let coordinates = equivalents
                    .into_iter()
                    .find(|(key, _)| key == &target.key)
                    .map(|(_, coordinates)| coordinates)
                    .ok_or_else(|| TopologyError::NoRelocationMethod {
                        src: source.key.to_string(),
                        target: target.key.to_string(),
                    })?;
                SourcePosition::Coordinates(coordinates)
            }
            RelocationMethod::PseudoGtid => {
                let coordinates = match shared_index {
                    Some(index) => self.matcher.match_with_index(source, target, index).await?,
                    None => self.matcher.match_coordinates(source, target).await?,
                };
                SourcePosition::Coordinates(coordinates)
            }
        };
        Ok(position)
    }
}
