//! Service configuration
//!
//! Loaded from environment variables with parse-or-default; command line
//! flags override the handful of common knobs.

use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct CanopydConfig {
    /// Store location; `None` runs on a private in-memory store
    pub db_url: Option<String>,

    /// Seconds between probes of one instance
    pub probe_interval_secs: u64,

    /// Discovery pool worker count
    pub discovery_workers: usize,

    /// Seconds between analysis passes
    pub analysis_interval_secs: u64,

    /// Debounce window for completed recoveries
    pub recovery_period_block_secs: u64,

    /// Leader lease lifetime and renewal cadence
    pub lease_ttl_secs: u64,
    pub lease_renew_secs: u64,

    /// Pattern recognizing injected pseudo-gtid markers
    pub pseudo_gtid_pattern: String,

    /// Skip pre/post failover hooks
    pub skip_processes: bool,
    pub pre_failover_hooks: Vec<String>,
    pub post_failover_hooks: Vec<String>,

    /// Hostname fragments never recovered automatically
    pub ignored_hostnames: Vec<String>,
}

impl Default for CanopydConfig {
    fn default() -> Self {
        Self {
            db_url: None,
            probe_interval_secs: 5,
            discovery_workers: 8,
            analysis_interval_secs: 10,
            recovery_period_block_secs: 3600,
            lease_ttl_secs: 15,
            lease_renew_secs: 5,
            pseudo_gtid_pattern: r"^drop view if exists `_pseudo_gtid_hint__".to_string(),
            skip_processes: false,
            pre_failover_hooks: Vec::new(),
            post_failover_hooks: Vec::new(),
            ignored_hostnames: Vec::new(),
        }
    }
}

impl CanopydConfig {
    /// Create configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            db_url: std::env::var("CANOPY_DB_URL").ok(),
            probe_interval_secs: env_parse("CANOPY_PROBE_INTERVAL_SECS", defaults.probe_interval_secs),
            discovery_workers: env_parse("CANOPY_DISCOVERY_WORKERS", defaults.discovery_workers),
            analysis_interval_secs: env_parse(
                "CANOPY_ANALYSIS_INTERVAL_SECS",
                defaults.analysis_interval_secs,
            ),
            recovery_period_block_secs: env_parse(
                "CANOPY_RECOVERY_PERIOD_BLOCK_SECS",
                defaults.recovery_period_block_secs,
            ),
            lease_ttl_secs: env_parse("CANOPY_LEASE_TTL_SECS", defaults.lease_ttl_secs),
            lease_renew_secs: env_parse("CANOPY_LEASE_RENEW_SECS", defaults.lease_renew_secs),
            pseudo_gtid_pattern: std::env::var("CANOPY_PSEUDO_GTID_PATTERN")
                .unwrap_or(defaults.pseudo_gtid_pattern),
            skip_processes: std::env::var("CANOPY_SKIP_PROCESSES")
                .map(|value| value == "true" || value == "1")
                .unwrap_or(false),
            pre_failover_hooks: env_list("CANOPY_PRE_FAILOVER_HOOKS"),
            post_failover_hooks: env_list("CANOPY_POST_FAILOVER_HOOKS"),
            ignored_hostnames: env_list("CANOPY_IGNORED_HOSTNAMES"),
        }
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn analysis_interval(&self) -> Duration {
        Duration::from_secs(self.analysis_interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
