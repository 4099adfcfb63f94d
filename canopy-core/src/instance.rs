//! Instance snapshot model
//!
//! An `Instance` is one probe's view of a server: identity, role flags,
//! replica state, log positions and derivations. Snapshots are immutable
//! values; the store persists the latest one per key.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::coordinates::BinlogCoordinates;
use crate::error::TopologyError;
use crate::gtid::GtidSet;
use crate::key::InstanceKey;

/// Per-instance bias for promotion candidate election
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionRule {
    Must,
    Prefer,
    Neutral,
    PreferNot,
    MustNot,
}

impl Default for PromotionRule {
    fn default() -> Self {
        Self::Neutral
    }
}

impl fmt::Display for PromotionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Must => "must",
            Self::Prefer => "prefer",
            Self::Neutral => "neutral",
            Self::PreferNot => "prefer_not",
            Self::MustNot => "must_not",
        };
        write!(f, "{text}")
    }
}

impl FromStr for PromotionRule {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "must" => Ok(Self::Must),
            "prefer" => Ok(Self::Prefer),
            "neutral" => Ok(Self::Neutral),
            "prefer_not" => Ok(Self::PreferNot),
            "must_not" => Ok(Self::MustNot),
            other => Err(TopologyError::InvariantViolation(format!(
                "unknown promotion rule: {other:?}"
            ))),
        }
    }
}

/// Position of an instance within its replication tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceRole {
    /// Primary of a tree
    Root,
    /// Replica that itself has downstream replicas
    Intermediate,
    /// Replica with no downstream
    Leaf,
    /// Member of a two-node co-primary cycle
    CoPrimary,
}

/// Snapshot of one server as seen by the probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    // Identity
    pub key: InstanceKey,
    pub server_id: u32,
    pub version: String,
    pub server_uuid: Option<Uuid>,

    // Role
    pub is_co_primary: bool,
    pub is_binlog_server: bool,
    pub log_bin_enabled: bool,
    pub log_replica_updates: bool,
    pub binlog_format: String,
    pub read_only: bool,

    // As a replica
    pub upstream_key: Option<InstanceKey>,
    pub replica_io_running: bool,
    pub replica_sql_running: bool,
    pub executed_gtid_set: GtidSet,
    pub retrieved_gtid_set: GtidSet,
    pub using_gtid: bool,
    pub auto_position: bool,
    pub seconds_behind_primary: Option<u32>,
    pub last_io_error: Option<String>,
    pub last_sql_error: Option<String>,

    // Positions
    /// Own write position (primaries and log-bin replicas)
    pub self_coordinates: Option<BinlogCoordinates>,
    /// I/O thread position within the upstream's binlog
    pub read_binlog_coordinates: Option<BinlogCoordinates>,
    /// SQL thread position within the upstream's binlog
    pub exec_binlog_coordinates: Option<BinlogCoordinates>,
    /// SQL thread position within the local relay log
    pub relaylog_coordinates: Option<BinlogCoordinates>,

    // Derivations
    pub cluster_name: String,
    pub data_center: String,
    pub promotion_rule: PromotionRule,
    pub is_last_check_valid: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Instance {
    /// A primary is a server that is not replicating from anyone.
    pub fn is_primary(&self) -> bool {
        self.upstream_key.is_none()
    }

    pub fn is_replica(&self) -> bool {
        self.upstream_key.is_some()
    }

    /// Both replication threads healthy.
    pub fn replication_running(&self) -> bool {
        self.replica_io_running && self.replica_sql_running
    }

    /// GTID-based relocation is possible onto/from this server.
    pub fn supports_gtid(&self) -> bool {
        self.using_gtid && !self.executed_gtid_set.is_empty()
    }

    /// Whether this server can act as an upstream for others.
    pub fn can_be_upstream(&self) -> bool {
        self.log_bin_enabled && (self.is_primary() || self.log_replica_updates)
    }

    /// Snapshot freshness: seen within twice the probe interval.
    pub fn is_up_to_date(&self, probe_interval: Duration, now: DateTime<Utc>) -> bool {
        let Some(last_seen) = self.last_seen else {
            return false;
        };
        let window = ChronoDuration::from_std(probe_interval * 2)
            .unwrap_or_else(|_| ChronoDuration::seconds(i64::MAX / 2));
        now - last_seen <= window
    }

    /// Role within the tree, given whether downstream replicas exist.
    pub fn role(&self, has_downstream: bool) -> InstanceRole {
        if self.is_co_primary {
            InstanceRole::CoPrimary
        } else if self.is_primary() {
            InstanceRole::Root
        } else if has_downstream {
            InstanceRole::Intermediate
        } else {
            InstanceRole::Leaf
        }
    }

    /// Whether `self` and `other` form a two-node co-primary cycle.
    pub fn forms_co_primary_cycle_with(&self, other: &Instance) -> bool {
        self.upstream_key.as_ref() == Some(&other.key)
            && other.upstream_key.as_ref() == Some(&self.key)
    }
}
