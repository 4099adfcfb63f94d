//! Leader election
//!
//! Recovery exclusivity across orchestrator peers rides on a single lease
//! row in the store: only the owner may renew it, and any peer may reclaim
//! it once expired. The elector renews on an interval and publishes
//! leadership transitions on a watch channel so an in-flight recovery can
//! be cancelled when the lease is lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use canopy_core::Result;
use canopy_store::TopologyStore;

/// Election configuration
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// This process's identity in the lease row
    pub owner: String,
    /// Lease lifetime; peers reclaim after expiry
    pub lease_ttl: Duration,
    /// Renewal cadence; must be well under the ttl
    pub renew_interval: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            owner: format!("canopy-{}", std::process::id()),
            lease_ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Campaigns for and renews the leader lease
pub struct LeaderElector {
    store: Arc<dyn TopologyStore>,
    config: ElectionConfig,
    leader_tx: watch::Sender<bool>,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn TopologyStore>, config: ElectionConfig) -> Self {
        let (leader_tx, _) = watch::channel(false);
        Self {
            store,
            config,
            leader_tx,
        }
    }

    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    /// Watch leadership transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    /// One acquisition/renewal attempt. Returns whether this process holds
    /// the lease afterwards.
    pub async fn campaign_once(&self) -> Result<bool> {
        let elected = self
            .store
            .attempt_leader_lease(&self.config.owner, self.config.lease_ttl)
            .await?;
        let previous = self.leader_tx.send_replace(elected);
        if previous != elected {
            if elected {
                info!(owner = %self.config.owner, "Acquired recovery leadership");
            } else {
                warn!(owner = %self.config.owner, "Lost recovery leadership");
            }
        }
        Ok(elected)
    }

    /// Give up the lease and leadership.
    pub async fn resign(&self) -> Result<()> {
        self.store
            .release_leader_lease(&self.config.owner)
            .await?;
        self.leader_tx.send_replace(false);
        info!(owner = %self.config.owner, "Resigned recovery leadership");
        Ok(())
    }

    /// Run the renewal loop until `shutdown` fires; resigns on the way out.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let elector = self;
        tokio::spawn(async move {
            let mut renew = tokio::time::interval(elector.config.renew_interval);
            loop {
                tokio::select! {
                    _ = renew.tick() => {
                        if let Err(e) = elector.campaign_once().await {
                            warn!(error = %e, "Lease renewal failed");
                            elector.leader_tx.send_replace(false);
                        }
                    }
                    _ = shutdown.changed() => {
                        if let Err(e) = elector.resign().await {
                            warn!(error = %e, "Resignation failed");
                        }
                        break;
                    }
                }
            }
        })
    }
}

/// Resolve once the subscribed elector is no longer leader.
pub async fn leadership_lost(rx: &mut watch::Receiver<bool>) {
    loop {
        if !*rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Elector gone; treat as lost.
            return;
        }
    }
}
