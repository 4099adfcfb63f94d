//! Canopy topology manager service
//!
//! Wires the engine together: a discovery pool sweeping instance probes
//! into the store, a periodic analysis pass, and a recovery orchestrator
//! gated by leader election. Without a replication driver deployment this
//! binary runs against the in-memory fleet simulator (development mode),
//! the same way the engine's scenario tests do.

mod config;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

use canopy_core::{CachingResolver, IdentityResolver, InstanceKey};
use canopy_recovery::{
    Analyzer, ElectionConfig, HookRunner, LeaderElector, OrchestratorConfig, RecoveryFilters,
    RecoveryOrchestrator,
};
use canopy_relocator::{
    DiscoveryPool, ProbeConfig, Prober, PseudoGtidConfig, PseudoGtidMatcher, RegroupConfig,
    Regrouper, Relocator, RelocatorConfig, ReplicationDriver, SimFleet,
};
use canopy_store::{SqliteStore, TopologyStore};

use config::CanopydConfig;

#[derive(Parser)]
#[command(name = "canopyd")]
#[command(about = "Replication topology manager")]
struct Cli {
    /// Store location (enables a durable store)
    #[arg(long, env = "CANOPY_DB_URL")]
    db_url: Option<String>,

    /// Seconds between probes of one instance
    #[arg(long, default_value = "5")]
    probe_interval: u64,

    /// Discovery pool worker count
    #[arg(long, default_value = "8")]
    discovery_workers: usize,

    /// Seconds between analysis passes
    #[arg(long, default_value = "10")]
    analysis_interval: u64,

    /// Detect and analyze but never execute recoveries
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

struct CanopyService {
    store: Arc<dyn TopologyStore>,
    prober: Arc<Prober>,
    pool: DiscoveryPool,
    analyzer: Analyzer,
    orchestrator: RecoveryOrchestrator,
    elector: Arc<LeaderElector>,
    config: CanopydConfig,
    dry_run: bool,
}

impl CanopyService {
    async fn new(config: CanopydConfig, dry_run: bool, fleet: SimFleet) -> anyhow::Result<Self> {
        let store: Arc<dyn TopologyStore> = match &config.db_url {
            Some(url) => Arc::new(SqliteStore::connect(url).await?),
            None => Arc::new(SqliteStore::in_memory().await?),
        };
        let driver: Arc<dyn ReplicationDriver> = Arc::new(fleet);
        let resolver = Arc::new(CachingResolver::new(
            Box::new(IdentityResolver),
            Duration::from_secs(300),
        ));

        let probe_config = ProbeConfig {
            probe_interval: config.probe_interval(),
            pool_size: config.discovery_workers,
            ..Default::default()
        };
        let prober = Arc::new(Prober::new(
            driver.clone(),
            store.clone(),
            resolver,
            probe_config,
        ));
        let pool = DiscoveryPool::start(prober.clone());

        let pseudo_gtid = PseudoGtidConfig {
            pattern: regex::Regex::new(&config.pseudo_gtid_pattern)
                .map_err(|e| anyhow::anyhow!("bad pseudo-gtid pattern: {e}"))?,
            ..Default::default()
        };
        let relocator = Arc::new(Relocator::new(
            driver.clone(),
            store.clone(),
            prober.clone(),
            PseudoGtidMatcher::new(driver.clone(), pseudo_gtid),
            RelocatorConfig::default(),
        ));
        let regrouper = Arc::new(Regrouper::new(
            driver,
            store.clone(),
            prober.clone(),
            relocator,
            RegroupConfig::default(),
        ));

        let elector = Arc::new(LeaderElector::new(
            store.clone(),
            ElectionConfig {
                lease_ttl: Duration::from_secs(config.lease_ttl_secs),
                renew_interval: Duration::from_secs(config.lease_renew_secs),
                ..Default::default()
            },
        ));
        let orchestrator = RecoveryOrchestrator::new(
            store.clone(),
            regrouper,
            elector.clone(),
            HookRunner::default(),
            OrchestratorConfig {
                recovery_period_block: Duration::from_secs(config.recovery_period_block_secs),
                filters: RecoveryFilters {
                    ignored_hostnames: config.ignored_hostnames.clone(),
                    ..Default::default()
                },
                skip_processes: config.skip_processes,
                pre_hooks: config.pre_failover_hooks.clone(),
                post_hooks: config.post_failover_hooks.clone(),
            },
        );

        Ok(Self {
            analyzer: Analyzer::new(store.clone()),
            store,
            prober,
            pool,
            orchestrator,
            elector,
            config,
            dry_run,
        })
    }

    /// Seed the discovery queue and run the sweep/analyze/recover loop
    /// until shutdown.
    async fn run(self, seeds: Vec<InstanceKey>, shutdown_tx: watch::Sender<bool>) {
        for seed in seeds {
            self.pool.enqueue(seed);
        }
        let election_task = self.elector.clone().start(shutdown_tx.subscribe());

        let mut sweep = tokio::time::interval(self.config.probe_interval());
        let mut analyze = tokio::time::interval(self.config.analysis_interval());
        loop {
            tokio::select! {
                _ = sweep.tick() => self.sweep().await,
                _ = analyze.tick() => self.analyze_and_recover().await,
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        self.pool.shutdown().await;
        if let Err(e) = election_task.await {
            warn!(error = %e, "Election task ended abnormally");
        }
        info!("Canopy service stopped");
    }

    /// Feed instances due for probing back into the pool.
    async fn sweep(&self) {
        match self
            .store
            .read_outdated_keys(self.prober.config().probe_interval)
            .await
        {
            Ok(keys) => {
                for key in keys {
                    self.pool.enqueue(key);
                }
            }
            Err(e) => error!(error = %e, "Sweep failed"),
        }
    }

    async fn analyze_and_recover(&self) {
        let entries = match self.analyzer.analyze().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Analysis pass failed");
                return;
            }
        };
        for entry in entries {
            if !entry.code.is_actionable() {
                continue;
            }
            warn!(
                cluster = %entry.cluster_name,
                code = %entry.code,
                key = %entry.analyzed_key,
                "Failure detected"
            );
            if self.dry_run {
                info!("Dry run mode, not recovering");
                continue;
            }
            match self.orchestrator.consider(&entry, None).await {
                Ok(Some(recovery)) => info!(
                    id = recovery.id,
                    successor = ?recovery.successor_key,
                    "Recovery completed"
                ),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Recovery not executed"),
            }
        }
    }
}

/// Development fleet: one primary, an intermediate and two leaves, with a
/// few replicated statements and a pseudo-gtid marker.
fn demo_fleet() -> (SimFleet, Vec<InstanceKey>) {
    let fleet = SimFleet::new();
    let primary = fleet.add_primary("primary:3306");
    fleet.add_replica("relay:3306", "primary:3306");
    fleet.add_replica("leaf-1:3306", "relay:3306");
    fleet.add_replica("leaf-2:3306", "primary:3306");
    fleet.commit(&primary, "drop view if exists `_pseudo_gtid_hint__asc:0001`", 150);
    fleet.commit(&primary, "insert into app.events values (1)", 100);
    (fleet, vec![primary])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let mut config = CanopydConfig::from_env();
    config.db_url = cli.db_url.clone().or(config.db_url);
    config.probe_interval_secs = cli.probe_interval;
    config.discovery_workers = cli.discovery_workers;
    config.analysis_interval_secs = cli.analysis_interval;

    let mode = if config.db_url.is_some() {
        "durable store"
    } else {
        "in-memory store"
    };
    info!(
        probe_interval = config.probe_interval_secs,
        discovery_workers = config.discovery_workers,
        analysis_interval = config.analysis_interval_secs,
        dry_run = cli.dry_run,
        mode = mode,
        "Starting canopy (development mode: simulated fleet)"
    );

    let (fleet, seeds) = demo_fleet();
    let (shutdown_tx, _) = watch::channel(false);
    let service = CanopyService::new(config, cli.dry_run, fleet).await?;
    service.run(seeds, shutdown_tx).await;
    Ok(())
}
