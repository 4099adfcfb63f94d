//! Instance probe and discovery pool
//!
//! The prober turns one driver status read into a stored [`Instance`]
//! snapshot; the discovery pool runs probes over a bounded queue of keys
//! with duplicate suppression, feeding itself newly-seen upstream and
//! downstream keys.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use canopy_core::{CachingResolver, GtidSet, Instance, InstanceKey, Result, TopologyError};
use canopy_store::TopologyStore;

use crate::driver::{InstanceStatus, ReplicationDriver};

/// Probe configuration
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Interval between sweeps of one instance
    pub probe_interval: Duration,
    /// Deadline for one status read
    pub probe_timeout: Duration,
    /// Discovery pool worker count
    pub pool_size: usize,
    /// Bounded discovery queue depth
    pub queue_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            pool_size: 8,
            queue_capacity: 1024,
        }
    }
}

/// Reads instance snapshots and persists them
pub struct Prober {
    driver: Arc<dyn ReplicationDriver>,
    store: Arc<dyn TopologyStore>,
    resolver: Arc<CachingResolver>,
    config: ProbeConfig,
}

impl Prober {
    pub fn new(
        driver: Arc<dyn ReplicationDriver>,
        store: Arc<dyn TopologyStore>,
        resolver: Arc<CachingResolver>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            driver,
            store,
            resolver,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TopologyStore> {
        &self.store
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Read one server's snapshot without persisting it.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn read(&self, key: &InstanceKey) -> Result<Instance> {
        let key = self.resolver.resolve_key(key);
        let status = timeout(self.config.probe_timeout, self.driver.read_status(&key))
            .await
            .map_err(|_| TopologyError::Timeout(format!("probe of {key}")))??;
        self.build_instance(key, status).await
    }

    /// Read and persist, recording discovery side effects.
    pub async fn refresh(&self, key: &InstanceKey) -> Result<Instance> {
        self.refresh_discovering(key).await.map(|(instance, _)| instance)
    }

    /// Read and persist; also return neighbor keys worth discovering.
    pub async fn refresh_discovering(
        &self,
        key: &InstanceKey,
    ) -> Result<(Instance, Vec<InstanceKey>)> {
        let key = self.resolver.resolve_key(key);
        let status = match timeout(self.config.probe_timeout, self.driver.read_status(&key)).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(self.record_probe_failure(&key, e).await),
            Err(_) => {
                let e = TopologyError::Timeout(format!("probe of {key}"));
                return Err(self.record_probe_failure(&key, e).await);
            }
        };

        let neighbors = self.neighbor_keys(&status);
        let instance = self.build_instance(key, status).await?;
        self.store.write_instance(&instance).await?;
        self.record_equivalence(&instance).await;
        debug!(key = %instance.key, cluster = %instance.cluster_name, "Instance refreshed");
        Ok((instance, neighbors))
    }

    /// Remove an instance from the store on operator command.
    pub async fn forget(&self, key: &InstanceKey) -> Result<()> {
        let key = self.resolver.resolve_key(key);
        self.store.forget_instance(&key).await?;
        self.store
            .append_audit(Some(&key), "instance forgotten")
            .await
    }

    async fn record_probe_failure(&self, key: &InstanceKey, error: TopologyError) -> TopologyError {
        if error.invalidates_last_check() {
            if let Err(e) = self.store.mark_unreachable(key).await {
                warn!(key = %key, error = %e, "Could not invalidate last check");
            }
        }
        let _ = self
            .store
            .append_audit(Some(key), &format!("probe failed: {error}"))
            .await;
        error
    }

    fn neighbor_keys(&self, status: &InstanceStatus) -> Vec<InstanceKey> {
        let mut neighbors = Vec::new();
        if let (Some(host), Some(port)) = (&status.upstream_host, status.upstream_port) {
            neighbors.push(self.resolver.resolve_key(&InstanceKey::new(host.clone(), port)));
        }
        for key in &status.downstream_keys {
            neighbors.push(self.resolver.resolve_key(key));
        }
        neighbors
    }

    async fn build_instance(&self, key: InstanceKey, status: InstanceStatus) -> Result<Instance> {
        let upstream_key = match (&status.upstream_host, status.upstream_port) {
            (Some(host), Some(port)) => {
                Some(self.resolver.resolve_key(&InstanceKey::new(host.clone(), port)))
            }
            _ => None,
        };

        // Cluster name is inherited from the upstream along the tree; a
        // primary names the cluster after itself.
        let (cluster_name, is_co_primary) = match &upstream_key {
            None => (key.to_string(), false),
            Some(upstream) => match self.store.read_instance(upstream).await? {
                Some(upstream_instance) => {
                    let cycle = upstream_instance.upstream_key.as_ref() == Some(&key);
                    (upstream_instance.cluster_name, cycle)
                }
                None => (key.to_string(), false),
            },
        };

        let executed_gtid_set: GtidSet = status.executed_gtid_set.parse()?;
        let retrieved_gtid_set: GtidSet = status.retrieved_gtid_set.parse()?;

        Ok(Instance {
            key,
            server_id: status.server_id,
            version: status.version,
            server_uuid: status.server_uuid,
            is_co_primary,
            is_binlog_server: status.is_binlog_server,
            log_bin_enabled: status.log_bin_enabled,
            log_replica_updates: status.log_replica_updates,
            binlog_format: status.binlog_format,
            read_only: status.read_only,
            upstream_key,
            replica_io_running: status.replica_io_running,
            replica_sql_running: status.replica_sql_running,
            executed_gtid_set,
            retrieved_gtid_set,
            using_gtid: status.using_gtid,
            auto_position: status.auto_position,
            seconds_behind_primary: status.seconds_behind,
            last_io_error: status.last_io_error,
            last_sql_error: status.last_sql_error,
            self_coordinates: status.self_coordinates,
            read_binlog_coordinates: status.read_binlog_coordinates,
            exec_binlog_coordinates: status.exec_binlog_coordinates,
            relaylog_coordinates: status.relaylog_coordinates,
            cluster_name,
            data_center: status.data_center,
            promotion_rule: status.promotion_rule,
            is_last_check_valid: true,
            last_seen: Some(Utc::now()),
        })
    }

    /// A caught-up replica pins an equivalence between its applied upstream
    /// position and its own write position; relocation method 5 reuses it.
    async fn record_equivalence(&self, instance: &Instance) {
        let caught_up = instance.replication_running()
            && instance.seconds_behind_primary == Some(0)
            && matches!(
                (&instance.read_binlog_coordinates, &instance.exec_binlog_coordinates),
                (Some(read), Some(exec)) if read.equals(exec)
            );
        if !caught_up {
            return;
        }
        let (Some(upstream), Some(exec), Some(self_coords)) = (
            &instance.upstream_key,
            &instance.exec_binlog_coordinates,
            &instance.self_coordinates,
        ) else {
            return;
        };
        if let Err(e) = self
            .store
            .record_equivalence(upstream, exec, &instance.key, self_coords)
            .await
        {
            warn!(key = %instance.key, error = %e, "Could not record coordinate equivalence");
        }
    }
}

/// Fixed-size probe worker pool over a deduplicated key queue
pub struct DiscoveryPool {
    tx: mpsc::Sender<InstanceKey>,
    pending: Arc<Mutex<HashSet<InstanceKey>>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl DiscoveryPool {
    /// Spawn the pool's workers.
    pub fn start(prober: Arc<Prober>) -> Self {
        let config = prober.config().clone();
        let (tx, rx) = mpsc::channel::<InstanceKey>(config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending: Arc<Mutex<HashSet<InstanceKey>>> = Arc::new(Mutex::new(HashSet::new()));
        let (shutdown_tx, _) = watch::channel(false);

        let mut workers = Vec::with_capacity(config.pool_size);
        for worker_id in 0..config.pool_size {
            let rx = rx.clone();
            let pending = pending.clone();
            let prober = prober.clone();
            let tx = tx.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    let key = tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        key = async { rx.lock().await.recv().await } => match key {
                            Some(key) => key,
                            None => break,
                        },
                    };
                    pending.lock().expect("pending set poisoned").remove(&key);

                    match prober.refresh_discovering(&key).await {
                        Ok((_, neighbors)) => {
                            for neighbor in neighbors {
                                enqueue_if_unknown(&prober, &tx, &pending, neighbor).await;
                            }
                        }
                        Err(e) => {
                            debug!(worker_id, key = %key, error = %e, "Probe failed");
                        }
                    }
                }
                debug!(worker_id, "Discovery worker stopped");
            }));
        }

        info!(workers = config.pool_size, "Discovery pool started");
        Self {
            tx,
            pending,
            shutdown_tx,
            workers,
        }
    }

    /// Queue a key for probing. Duplicate keys already queued are dropped;
    /// returns whether the key was accepted.
    pub fn enqueue(&self, key: InstanceKey) -> bool {
        {
            let mut pending = self.pending.lock().expect("pending set poisoned");
            if !pending.insert(key.clone()) {
                return false;
            }
        }
        if self.tx.try_send(key.clone()).is_err() {
            // Queue full: drop, the next sweep re-feeds it.
            self.pending.lock().expect("pending set poisoned").remove(&key);
            return false;
        }
        true
    }

    /// Stop the workers and wait for them to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("Discovery pool stopped");
    }
}

async fn enqueue_if_unknown(
    prober: &Prober,
    tx: &mpsc::Sender<InstanceKey>,
    pending: &Arc<Mutex<HashSet<InstanceKey>>>,
    key: InstanceKey,
) {
    let known = matches!(prober.store().read_instance(&key).await, Ok(Some(_)));
    if known {
        return;
    }
    {
        let mut pending = pending.lock().expect("pending set poisoned");
        if !pending.insert(key.clone()) {
            return;
        }
    }
    if tx.try_send(key.clone()).is_err() {
        pending.lock().expect("pending set poisoned").remove(&key);
    }
}
