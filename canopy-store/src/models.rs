//! Store record models
//!
//! Rows kept by the bookkeeping store around the instance snapshots:
//! downtime flags, audit entries, recovery records, blocked recoveries and
//! the leader lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use canopy_core::InstanceKey;

/// Advisory flag suppressing recoveries for one instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Downtime {
    pub key: InstanceKey,
    pub owner: String,
    pub reason: String,
    pub began_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl Downtime {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.ends_at {
            Some(ends_at) => now < ends_at,
            None => true,
        }
    }
}

/// One line of the operational audit stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub key: Option<InstanceKey>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Durable record of one recovery attempt
///
/// Opened under the per-cluster lock, closed on completion or timeout;
/// remains as an audit record until acknowledged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub id: i64,
    pub uid: Uuid,
    pub cluster_name: String,
    pub analysis_code: String,
    pub analyzed_key: InstanceKey,
    /// Snapshot of the triggering analysis, as JSON
    pub analysis: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub successor_key: Option<InstanceKey>,
    pub is_successful: bool,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_comment: Option<String>,
    pub participating_keys: Vec<InstanceKey>,
    pub processed: bool,
}

/// Record of an analysis that was filtered or debounced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedRecovery {
    pub id: i64,
    pub cluster_name: String,
    pub analysis_code: String,
    pub analyzed_key: InstanceKey,
    /// Recovery this one was blocked behind, if debounced
    pub blocking_recovery_id: Option<i64>,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The single leader lease row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl LeaderLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_downtime_activity() {
        let now = Utc::now();
        let open_ended = Downtime {
            key: InstanceKey::new("db1", 3306),
            owner: "ops".to_string(),
            reason: "maintenance window".to_string(),
            began_at: now,
            ends_at: None,
        };
        assert!(open_ended.is_active(now));

        let expired = Downtime {
            ends_at: Some(now - Duration::minutes(1)),
            ..open_ended.clone()
        };
        assert!(!expired.is_active(now));
    }

    #[test]
    fn test_lease_expiry() {
        let now = Utc::now();
        let lease = LeaderLease {
            owner: "node-1".to_string(),
            expires_at: now + Duration::seconds(10),
        };
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + Duration::seconds(11)));
    }
}
