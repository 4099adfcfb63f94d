//! Recovery orchestrator
//!
//! Drives the recovery state machine: analyses are filtered against
//! configuration and downtime, debounced against recent recoveries, locked
//! per cluster through the store's compare-and-set, executed through the
//! regroup engine under the leader lease, and closed as durable audit
//! records awaiting operator acknowledgement.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use canopy_core::{InstanceKey, Result, TopologyError};
use canopy_relocator::Regrouper;
use canopy_store::{RecoveryRecord, TopologyStore};

use crate::analysis::AnalysisEntry;
use crate::election::{leadership_lost, LeaderElector};
use crate::hooks::{HookContext, HookRunner};

/// Which clusters and hosts automated recovery may touch
#[derive(Debug, Clone, Default)]
pub struct RecoveryFilters {
    /// Clusters eligible for primary recovery; empty means all
    pub primary_clusters: Vec<String>,
    /// Clusters eligible for intermediate-primary recovery; empty means all
    pub intermediate_clusters: Vec<String>,
    /// Hostname fragments never recovered automatically
    pub ignored_hostnames: Vec<String>,
}

impl RecoveryFilters {
    /// A reason this entry must not be actioned, if any.
    fn rejection_reason(&self, entry: &AnalysisEntry) -> Option<String> {
        if self
            .ignored_hostnames
            .iter()
            .any(|fragment| entry.analyzed_key.hostname.contains(fragment))
        {
            return Some(format!(
                "host {} matches the ignore list",
                entry.analyzed_key.hostname
            ));
        }
        let allowed = if entry.code.concerns_primary() {
            &self.primary_clusters
        } else {
            &self.intermediate_clusters
        };
        if !allowed.is_empty() && !allowed.contains(&entry.cluster_name) {
            return Some(format!(
                "cluster {} is not in the recovery allow-list",
                entry.cluster_name
            ));
        }
        None
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Completed recoveries block same-key re-triggers for this long
    /// (until acknowledged)
    pub recovery_period_block: Duration,
    pub filters: RecoveryFilters,
    /// Skip pre/post failover hooks
    pub skip_processes: bool,
    pub pre_hooks: Vec<String>,
    pub post_hooks: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            recovery_period_block: Duration::from_secs(3600),
            filters: RecoveryFilters::default(),
            skip_processes: false,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        }
    }
}

/// Executes recoveries for actionable analyses
pub struct RecoveryOrchestrator {
    store: Arc<dyn TopologyStore>,
    regrouper: Arc<Regrouper>,
    elector: Arc<LeaderElector>,
    hooks: HookRunner,
    config: OrchestratorConfig,
}

impl RecoveryOrchestrator {
    pub fn new(
        store: Arc<dyn TopologyStore>,
        regrouper: Arc<Regrouper>,
        elector: Arc<LeaderElector>,
        hooks: HookRunner,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            regrouper,
            elector,
            hooks,
            config,
        }
    }

    /// Consider one analysis entry for recovery.
    ///
    /// Returns the closed recovery record when one ran, `None` when the
    /// entry was not actionable or was filtered/debounced (recorded as a
    /// blocked recovery), and `LockContended` when exclusivity was not
    /// ours — this process is not the leader or the cluster already has an
    /// open recovery.
    #[instrument(skip(self, entry), fields(cluster = %entry.cluster_name, code = %entry.code))]
    pub async fn consider(
        &self,
        entry: &AnalysisEntry,
        candidate: Option<&InstanceKey>,
    ) -> Result<Option<RecoveryRecord>> {
        if !entry.code.is_actionable() {
            return Ok(None);
        }
        if !self.elector.is_leader() {
            return Err(TopologyError::LockContended(format!(
                "{} is not the recovery leader",
                self.elector.owner()
            )));
        }

        if let Some(reason) = self.filter_reason(entry).await? {
            info!(reason = %reason, "Recovery filtered");
            self.store
                .record_blocked_recovery(
                    &entry.cluster_name,
                    &entry.code.to_string(),
                    &entry.analyzed_key,
                    None,
                    &reason,
                )
                .await?;
            return Ok(None);
        }

        if let Some(prior) = self.debounced(entry).await? {
            let reason = format!(
                "recovery {} for the same failure completed recently and is unacknowledged",
                prior.id
            );
            info!(blocking = prior.id, "Recovery debounced");
            self.store
                .record_blocked_recovery(
                    &entry.cluster_name,
                    &entry.code.to_string(),
                    &entry.analyzed_key,
                    Some(prior.id),
                    &reason,
                )
                .await?;
            return Ok(None);
        }

        let analysis = serde_json::to_value(entry)
            .map_err(|e| TopologyError::Store(format!("analysis not serializable: {e}")))?;
        let recovery = self
            .store
            .register_recovery(
                &entry.cluster_name,
                &entry.code.to_string(),
                &entry.analyzed_key,
                &analysis,
            )
            .await?;
        info!(id = recovery.id, uid = %recovery.uid, "Recovery started");

        self.execute(&recovery, entry, candidate).await.map(Some)
    }

    /// Operator acknowledgement; waives the debounce for this key.
    pub async fn acknowledge(&self, recovery_id: i64, by: &str, comment: &str) -> Result<()> {
        self.store.acknowledge_recovery(recovery_id, by, comment).await?;
        self.store
            .append_audit(None, &format!("recovery {recovery_id} acknowledged by {by}"))
            .await
    }

    async fn filter_reason(&self, entry: &AnalysisEntry) -> Result<Option<String>> {
        if let Some(reason) = self.config.filters.rejection_reason(entry) {
            return Ok(Some(reason));
        }
        if let Some(downtime) = self.store.active_downtime(&entry.analyzed_key).await? {
            return Ok(Some(format!(
                "{} is downtimed by {}: {}",
                entry.analyzed_key, downtime.owner, downtime.reason
            )));
        }
        Ok(None)
    }

    /// A completed, unacknowledged recovery for the same `(cluster, code)`
    /// within the block period debounces this entry.
    async fn debounced(&self, entry: &AnalysisEntry) -> Result<Option<RecoveryRecord>> {
        let recent = self
            .store
            .read_recent_recoveries(
                &entry.cluster_name,
                &entry.code.to_string(),
                self.config.recovery_period_block,
            )
            .await?;
        Ok(recent.into_iter().find(|recovery| !recovery.acknowledged))
    }

    /// Run the recovery under the already-held cluster lock. All exit
    /// paths close the record (releasing the lock); no automatic retry.
    async fn execute(
        &self,
        recovery: &RecoveryRecord,
        entry: &AnalysisEntry,
        candidate: Option<&InstanceKey>,
    ) -> Result<RecoveryRecord> {
        let mut context = HookContext {
            cluster_name: entry.cluster_name.clone(),
            failed_key: entry.analyzed_key.clone(),
            successor_key: None,
            analysis_code: entry.code.to_string(),
        };

        if !self.config.skip_processes {
            if let Err(e) = self.hooks.run_pre(&self.config.pre_hooks, &context).await {
                error!(error = %e, "Pre-failover hook aborted the recovery");
                self.close(recovery.id, false, None, &[]).await;
                return Err(e);
            }
        }

        let mut leadership = self.elector.subscribe();
        let outcome = tokio::select! {
            outcome = self.regrouper.regroup(&entry.analyzed_key, candidate) => outcome,
            _ = leadership_lost(&mut leadership) => {
                warn!("Leadership lost mid-recovery; abandoning");
                self.close(recovery.id, false, None, &[]).await;
                return Err(TopologyError::LockContended(
                    "leadership lost during recovery".to_string(),
                ));
            }
        };

        match outcome {
            Ok(regroup) => {
                let successor = regroup.promoted.key.clone();
                let participants = regroup.participants();
                self.close(recovery.id, true, Some(&successor), &participants)
                    .await;
                info!(
                    id = recovery.id,
                    successor = %successor,
                    lost = regroup.lost.len(),
                    "Recovery succeeded"
                );
                if !self.config.skip_processes {
                    context.successor_key = Some(successor);
                    for (command, failure) in
                        self.hooks.run_post(&self.config.post_hooks, &context).await
                    {
                        let _ = self
                            .store
                            .append_audit(
                                Some(&entry.analyzed_key),
                                &format!("post-failover hook {command:?} failed: {failure}"),
                            )
                            .await;
                    }
                }
                self.store
                    .read_recovery(recovery.id)
                    .await?
                    .ok_or_else(|| {
                        TopologyError::Store(format!("recovery {} vanished", recovery.id))
                    })
            }
            Err(e) => {
                error!(id = recovery.id, error = %e, "Recovery failed");
                self.close(recovery.id, false, None, &[]).await;
                Err(e)
            }
        }
    }

    async fn close(
        &self,
        recovery_id: i64,
        success: bool,
        successor: Option<&InstanceKey>,
        participants: &[InstanceKey],
    ) {
        if let Err(e) = self
            .store
            .resolve_recovery(recovery_id, success, successor, participants)
            .await
        {
            error!(id = recovery_id, error = %e, "Could not close recovery record");
        }
    }
}
