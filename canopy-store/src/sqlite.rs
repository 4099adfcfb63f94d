//! SQLite store implementation
//!
//! CRUD over the canopy schema using SQLx. The schema is owned by this
//! system and created idempotently at connect time. Lock rows (maintenance,
//! open recovery) use partial unique indexes so that acquisition is a single
//! compare-and-set insert.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use async_trait::async_trait;
use canopy_core::{BinlogCoordinates, Instance, InstanceKey, Result, TopologyError};

use crate::models::{AuditEntry, BlockedRecovery, Downtime, LeaderLease, RecoveryRecord};
use crate::TopologyStore;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS instances (
        hostname TEXT NOT NULL,
        port INTEGER NOT NULL,
        cluster_name TEXT NOT NULL,
        upstream_hostname TEXT,
        upstream_port INTEGER,
        last_check_valid INTEGER NOT NULL DEFAULT 0,
        last_seen INTEGER,
        snapshot TEXT NOT NULL,
        PRIMARY KEY (hostname, port)
    )",
    "CREATE INDEX IF NOT EXISTS idx_instances_cluster ON instances (cluster_name)",
    "CREATE INDEX IF NOT EXISTS idx_instances_upstream ON instances (upstream_hostname, upstream_port)",
    "CREATE TABLE IF NOT EXISTS maintenance (
        token INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT NOT NULL,
        port INTEGER NOT NULL,
        owner TEXT NOT NULL,
        reason TEXT NOT NULL,
        began_at INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 1
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_maintenance_active
        ON maintenance (hostname, port) WHERE active = 1",
    "CREATE TABLE IF NOT EXISTS downtime (
        hostname TEXT NOT NULL,
        port INTEGER NOT NULL,
        owner TEXT NOT NULL,
        reason TEXT NOT NULL,
        began_at INTEGER NOT NULL,
        ends_at INTEGER,
        PRIMARY KEY (hostname, port)
    )",
    "CREATE TABLE IF NOT EXISTS coordinate_equivalence (
        hostname TEXT NOT NULL,
        port INTEGER NOT NULL,
        log_file TEXT NOT NULL,
        log_pos INTEGER NOT NULL,
        equivalence_id INTEGER NOT NULL,
        PRIMARY KEY (hostname, port, log_file, log_pos)
    )",
    "CREATE INDEX IF NOT EXISTS idx_equivalence_group ON coordinate_equivalence (equivalence_id)",
    "CREATE TABLE IF NOT EXISTS audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        hostname TEXT,
        port INTEGER,
        message TEXT NOT NULL,
        at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS topology_recovery (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uid TEXT NOT NULL,
        cluster_name TEXT NOT NULL,
        analysis_code TEXT NOT NULL,
        analyzed_hostname TEXT NOT NULL,
        analyzed_port INTEGER NOT NULL,
        analysis TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        ended_at INTEGER,
        successor_hostname TEXT,
        successor_port INTEGER,
        is_successful INTEGER NOT NULL DEFAULT 0,
        acknowledged INTEGER NOT NULL DEFAULT 0,
        acknowledged_by TEXT,
        acknowledged_comment TEXT,
        participants TEXT NOT NULL DEFAULT '[]',
        processed INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_recovery_open
        ON topology_recovery (cluster_name) WHERE ended_at IS NULL",
    "CREATE TABLE IF NOT EXISTS blocked_recovery (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cluster_name TEXT NOT NULL,
        analysis_code TEXT NOT NULL,
        hostname TEXT NOT NULL,
        port INTEGER NOT NULL,
        blocking_recovery_id INTEGER,
        reason TEXT NOT NULL,
        at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS leader_lease (
        anchor INTEGER PRIMARY KEY CHECK (anchor = 1),
        owner TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cluster_alias (
        cluster_name TEXT NOT NULL PRIMARY KEY,
        alias TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS pool_instance (
        pool TEXT NOT NULL,
        hostname TEXT NOT NULL,
        port INTEGER NOT NULL,
        PRIMARY KEY (pool, hostname, port)
    )",
];

fn db_err(e: sqlx::Error) -> TopologyError {
    TopologyError::Store(e.to_string())
}

fn json_err(e: serde_json::Error) -> TopologyError {
    TopologyError::Store(e.to_string())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// SQLite-backed topology store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a store at `url`, e.g.
    /// `sqlite:///var/lib/canopy/canopy.db`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(url = %url, "Topology store opened");
        Ok(store)
    }

    /// Fresh private in-memory store, used by tests and the simulator mode.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(db_err)?;
        // A single connection keeps every caller on the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    fn instance_from_row(row: &SqliteRow) -> Result<Instance> {
        let snapshot: String = row.get("snapshot");
        let mut instance: Instance = serde_json::from_str(&snapshot).map_err(json_err)?;
        // The indexed columns are authoritative over the serialized copy.
        instance.is_last_check_valid = row.get::<i64, _>("last_check_valid") != 0;
        instance.last_seen = row.get::<Option<i64>, _>("last_seen").map(ts);
        Ok(instance)
    }

    fn recovery_from_row(row: &SqliteRow) -> Result<RecoveryRecord> {
        let uid: String = row.get("uid");
        let analysis: String = row.get("analysis");
        let participants: String = row.get("participants");
        let participant_keys: Vec<String> =
            serde_json::from_str(&participants).map_err(json_err)?;
        let participating_keys = participant_keys
            .iter()
            .map(|text| text.parse())
            .collect::<Result<Vec<InstanceKey>>>()?;
        let successor_key = row
            .get::<Option<String>, _>("successor_hostname")
            .map(|hostname| {
                InstanceKey::new(
                    hostname,
                    row.get::<Option<i64>, _>("successor_port").unwrap_or(0) as u16,
                )
            });
        Ok(RecoveryRecord {
            id: row.get("id"),
            uid: Uuid::parse_str(&uid)
                .map_err(|e| TopologyError::Store(format!("malformed recovery uid: {e}")))?,
            cluster_name: row.get("cluster_name"),
            analysis_code: row.get("analysis_code"),
            analyzed_key: InstanceKey::new(
                row.get::<String, _>("analyzed_hostname"),
                row.get::<i64, _>("analyzed_port") as u16,
            ),
            analysis: serde_json::from_str(&analysis).map_err(json_err)?,
            started_at: ts(row.get("started_at")),
            ended_at: row.get::<Option<i64>, _>("ended_at").map(ts),
            successor_key,
            is_successful: row.get::<i64, _>("is_successful") != 0,
            acknowledged: row.get::<i64, _>("acknowledged") != 0,
            acknowledged_by: row.get("acknowledged_by"),
            acknowledged_comment: row.get("acknowledged_comment"),
            participating_keys,
            processed: row.get::<i64, _>("processed") != 0,
        })
    }

    fn blocked_from_row(row: &SqliteRow) -> BlockedRecovery {
        BlockedRecovery {
            id: row.get("id"),
            cluster_name: row.get("cluster_name"),
            analysis_code: row.get("analysis_code"),
            analyzed_key: InstanceKey::new(
                row.get::<String, _>("hostname"),
                row.get::<i64, _>("port") as u16,
            ),
            blocking_recovery_id: row.get("blocking_recovery_id"),
            reason: row.get("reason"),
            at: ts(row.get("at")),
        }
    }

    /// Existing equivalence group for a position, if any.
    async fn equivalence_group(
        &self,
        key: &InstanceKey,
        coords: &BinlogCoordinates,
    ) -> Result<Option<i64>> {
        sqlx::query_scalar::<_, i64>(
            "SELECT equivalence_id FROM coordinate_equivalence
             WHERE hostname = ? AND port = ? AND log_file = ? AND log_pos = ?",
        )
        .bind(&key.hostname)
        .bind(key.port as i64)
        .bind(&coords.log_file)
        .bind(coords.log_pos)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl TopologyStore for SqliteStore {
    #[instrument(skip(self, instance), fields(key = %instance.key))]
    async fn write_instance(&self, instance: &Instance) -> Result<()> {
        let snapshot = serde_json::to_string(instance).map_err(json_err)?;
        sqlx::query(
            "INSERT INTO instances
                (hostname, port, cluster_name, upstream_hostname, upstream_port,
                 last_check_valid, last_seen, snapshot)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (hostname, port) DO UPDATE SET
                cluster_name = excluded.cluster_name,
                upstream_hostname = excluded.upstream_hostname,
                upstream_port = excluded.upstream_port,
                last_check_valid = excluded.last_check_valid,
                last_seen = excluded.last_seen,
                snapshot = excluded.snapshot",
        )
        .bind(&instance.key.hostname)
        .bind(instance.key.port as i64)
        .bind(&instance.cluster_name)
        .bind(instance.upstream_key.as_ref().map(|k| k.hostname.clone()))
        .bind(instance.upstream_key.as_ref().map(|k| k.port as i64))
        .bind(instance.is_last_check_valid as i64)
        .bind(instance.last_seen.map(|t| t.timestamp()))
        .bind(snapshot)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        debug!("Instance snapshot written");
        Ok(())
    }

    async fn read_instance(&self, key: &InstanceKey) -> Result<Option<Instance>> {
        let row = sqlx::query("SELECT * FROM instances WHERE hostname = ? AND port = ?")
            .bind(&key.hostname)
            .bind(key.port as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::instance_from_row).transpose()
    }

    async fn read_replicas(&self, key: &InstanceKey) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT * FROM instances WHERE upstream_hostname = ? AND upstream_port = ?
             ORDER BY hostname, port",
        )
        .bind(&key.hostname)
        .bind(key.port as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::instance_from_row).collect()
    }

    async fn read_cluster_instances(&self, cluster: &str) -> Result<Vec<Instance>> {
        let rows = sqlx::query(
            "SELECT * FROM instances WHERE cluster_name = ? ORDER BY hostname, port",
        )
        .bind(cluster)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::instance_from_row).collect()
    }

    async fn read_cluster_names(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT cluster_name FROM instances ORDER BY cluster_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn read_all_keys(&self) -> Result<Vec<InstanceKey>> {
        let rows = sqlx::query("SELECT hostname, port FROM instances ORDER BY hostname, port")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| {
                InstanceKey::new(row.get::<String, _>("hostname"), row.get::<i64, _>("port") as u16)
            })
            .collect())
    }

    async fn read_outdated_keys(&self, window: Duration) -> Result<Vec<InstanceKey>> {
        let cutoff = Utc::now().timestamp() - window.as_secs() as i64;
        let rows = sqlx::query(
            "SELECT hostname, port FROM instances
             WHERE last_seen IS NULL OR last_seen < ?
             ORDER BY hostname, port",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| {
                InstanceKey::new(row.get::<String, _>("hostname"), row.get::<i64, _>("port") as u16)
            })
            .collect())
    }

    async fn mark_unreachable(&self, key: &InstanceKey) -> Result<()> {
        sqlx::query("UPDATE instances SET last_check_valid = 0 WHERE hostname = ? AND port = ?")
            .bind(&key.hostname)
            .bind(key.port as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn forget_instance(&self, key: &InstanceKey) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE hostname = ? AND port = ?")
            .bind(&key.hostname)
            .bind(key.port as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        debug!(key = %key, "Instance forgotten");
        Ok(())
    }

    async fn begin_maintenance(&self, key: &InstanceKey, owner: &str, reason: &str) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO maintenance (hostname, port, owner, reason, began_at, active)
             VALUES (?, ?, ?, ?, ?, 1)",
        )
        .bind(&key.hostname)
        .bind(key.port as i64)
        .bind(owner)
        .bind(reason)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(e) if is_unique_violation(&e) => Err(TopologyError::LockContended(format!(
                "{key} is already under maintenance"
            ))),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn end_maintenance(&self, token: i64) -> Result<()> {
        sqlx::query("UPDATE maintenance SET active = 0 WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn in_maintenance(&self, key: &InstanceKey) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM maintenance WHERE hostname = ? AND port = ? AND active = 1",
        )
        .bind(&key.hostname)
        .bind(key.port as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn begin_downtime(
        &self,
        key: &InstanceKey,
        owner: &str,
        reason: &str,
        duration: Option<Duration>,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let ends_at = duration.map(|d| now + d.as_secs() as i64);
        sqlx::query(
            "INSERT INTO downtime (hostname, port, owner, reason, began_at, ends_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (hostname, port) DO UPDATE SET
                owner = excluded.owner,
                reason = excluded.reason,
                began_at = excluded.began_at,
                ends_at = excluded.ends_at",
        )
        .bind(&key.hostname)
        .bind(key.port as i64)
        .bind(owner)
        .bind(reason)
        .bind(now)
        .bind(ends_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn end_downtime(&self, key: &InstanceKey) -> Result<()> {
        sqlx::query("DELETE FROM downtime WHERE hostname = ? AND port = ?")
            .bind(&key.hostname)
            .bind(key.port as i64)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn active_downtime(&self, key: &InstanceKey) -> Result<Option<Downtime>> {
        let row = sqlx::query("SELECT * FROM downtime WHERE hostname = ? AND port = ?")
            .bind(&key.hostname)
            .bind(key.port as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let downtime = Downtime {
            key: key.clone(),
            owner: row.get("owner"),
            reason: row.get("reason"),
            began_at: ts(row.get("began_at")),
            ends_at: row.get::<Option<i64>, _>("ends_at").map(ts),
        };
        if downtime.is_active(Utc::now()) {
            Ok(Some(downtime))
        } else {
            Ok(None)
        }
    }

    async fn record_equivalence(
        &self,
        a: &InstanceKey,
        a_coords: &BinlogCoordinates,
        b: &InstanceKey,
        b_coords: &BinlogCoordinates,
    ) -> Result<()> {
        let group_a = self.equivalence_group(a, a_coords).await?;
        let group_b = self.equivalence_group(b, b_coords).await?;
        let group = match (group_a, group_b) {
            (Some(ga), Some(gb)) => {
                if ga != gb {
                    // Two observed chains turn out to be one; merge them.
                    sqlx::query(
                        "UPDATE coordinate_equivalence SET equivalence_id = ? WHERE equivalence_id = ?",
                    )
                    .bind(ga)
                    .bind(gb)
                    .execute(&self.pool)
                    .await
                    .map_err(db_err)?;
                }
                ga
            }
            (Some(g), None) | (None, Some(g)) => g,
            (None, None) => sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(equivalence_id), 0) + 1 FROM coordinate_equivalence",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?,
        };
        for (key, coords) in [(a, a_coords), (b, b_coords)] {
            sqlx::query(
                "INSERT INTO coordinate_equivalence (hostname, port, log_file, log_pos, equivalence_id)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT (hostname, port, log_file, log_pos)
                 DO UPDATE SET equivalence_id = excluded.equivalence_id",
            )
            .bind(&key.hostname)
            .bind(key.port as i64)
            .bind(&coords.log_file)
            .bind(coords.log_pos)
            .bind(group)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn find_equivalent(
        &self,
        key: &InstanceKey,
        coords: &BinlogCoordinates,
    ) -> Result<Vec<(InstanceKey, BinlogCoordinates)>> {
        let Some(group) = self.equivalence_group(key, coords).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query(
            "SELECT hostname, port, log_file, log_pos FROM coordinate_equivalence
             WHERE equivalence_id = ? AND NOT (hostname = ? AND port = ?)",
        )
        .bind(group)
        .bind(&key.hostname)
        .bind(key.port as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    InstanceKey::new(
                        row.get::<String, _>("hostname"),
                        row.get::<i64, _>("port") as u16,
                    ),
                    BinlogCoordinates::binary(
                        row.get::<String, _>("log_file"),
                        row.get::<i64, _>("log_pos"),
                    ),
                )
            })
            .collect())
    }

    async fn append_audit(&self, key: Option<&InstanceKey>, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO audit (hostname, port, message, at) VALUES (?, ?, ?, ?)")
            .bind(key.map(|k| k.hostname.clone()))
            .bind(key.map(|k| k.port as i64))
            .bind(message)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn read_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query("SELECT * FROM audit ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                key: row.get::<Option<String>, _>("hostname").map(|hostname| {
                    InstanceKey::new(hostname, row.get::<Option<i64>, _>("port").unwrap_or(0) as u16)
                }),
                message: row.get("message"),
                at: ts(row.get("at")),
            })
            .collect())
    }

    #[instrument(skip(self, analysis), fields(cluster = %cluster, code = %analysis_code))]
    async fn register_recovery(
        &self,
        cluster: &str,
        analysis_code: &str,
        analyzed_key: &InstanceKey,
        analysis: &serde_json::Value,
    ) -> Result<RecoveryRecord> {
        let uid = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO topology_recovery
                (uid, cluster_name, analysis_code, analyzed_hostname, analyzed_port,
                 analysis, started_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uid.to_string())
        .bind(cluster)
        .bind(analysis_code)
        .bind(&analyzed_key.hostname)
        .bind(analyzed_key.port as i64)
        .bind(analysis.to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;
        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                return Err(TopologyError::LockContended(format!(
                    "cluster {cluster} already has an active recovery"
                )))
            }
            Err(e) => return Err(db_err(e)),
        };
        debug!(id, "Recovery registered");
        self.read_recovery(id).await?.ok_or_else(|| {
            TopologyError::Store(format!("recovery {id} vanished after registration"))
        })
    }

    async fn resolve_recovery(
        &self,
        id: i64,
        success: bool,
        successor: Option<&InstanceKey>,
        participants: &[InstanceKey],
    ) -> Result<()> {
        let participants_json = serde_json::to_string(
            &participants.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
        )
        .map_err(json_err)?;
        sqlx::query(
            "UPDATE topology_recovery SET
                ended_at = ?,
                is_successful = ?,
                successor_hostname = ?,
                successor_port = ?,
                participants = ?,
                processed = 1
             WHERE id = ? AND ended_at IS NULL",
        )
        .bind(Utc::now().timestamp())
        .bind(success as i64)
        .bind(successor.map(|k| k.hostname.clone()))
        .bind(successor.map(|k| k.port as i64))
        .bind(participants_json)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn read_recovery(&self, id: i64) -> Result<Option<RecoveryRecord>> {
        let row = sqlx::query("SELECT * FROM topology_recovery WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::recovery_from_row).transpose()
    }

    async fn read_active_recovery(&self, cluster: &str) -> Result<Option<RecoveryRecord>> {
        let row = sqlx::query(
            "SELECT * FROM topology_recovery WHERE cluster_name = ? AND ended_at IS NULL",
        )
        .bind(cluster)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(Self::recovery_from_row).transpose()
    }

    async fn read_recent_recoveries(
        &self,
        cluster: &str,
        analysis_code: &str,
        within: Duration,
    ) -> Result<Vec<RecoveryRecord>> {
        let cutoff = Utc::now().timestamp() - within.as_secs() as i64;
        let rows = sqlx::query(
            "SELECT * FROM topology_recovery
             WHERE cluster_name = ? AND analysis_code = ?
               AND ended_at IS NOT NULL AND ended_at >= ?
             ORDER BY ended_at DESC",
        )
        .bind(cluster)
        .bind(analysis_code)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(Self::recovery_from_row).collect()
    }

    async fn acknowledge_recovery(&self, id: i64, by: &str, comment: &str) -> Result<()> {
        sqlx::query(
            "UPDATE topology_recovery SET acknowledged = 1, acknowledged_by = ?, acknowledged_comment = ?
             WHERE id = ?",
        )
        .bind(by)
        .bind(comment)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn acknowledge_cluster_recoveries(
        &self,
        cluster: &str,
        by: &str,
        comment: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE topology_recovery SET acknowledged = 1, acknowledged_by = ?, acknowledged_comment = ?
             WHERE cluster_name = ? AND acknowledged = 0 AND ended_at IS NOT NULL",
        )
        .bind(by)
        .bind(comment)
        .bind(cluster)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn record_blocked_recovery(
        &self,
        cluster: &str,
        analysis_code: &str,
        analyzed_key: &InstanceKey,
        blocking_recovery_id: Option<i64>,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO blocked_recovery
                (cluster_name, analysis_code, hostname, port, blocking_recovery_id, reason, at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(cluster)
        .bind(analysis_code)
        .bind(&analyzed_key.hostname)
        .bind(analyzed_key.port as i64)
        .bind(blocking_recovery_id)
        .bind(reason)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn read_blocked_recoveries(&self, cluster: &str) -> Result<Vec<BlockedRecovery>> {
        let rows = sqlx::query(
            "SELECT * FROM blocked_recovery WHERE cluster_name = ? ORDER BY id DESC",
        )
        .bind(cluster)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.iter().map(Self::blocked_from_row).collect())
    }

    async fn attempt_leader_lease(&self, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl.as_secs() as i64;
        let result = sqlx::query(
            "INSERT INTO leader_lease (anchor, owner, expires_at) VALUES (1, ?, ?)
             ON CONFLICT (anchor) DO UPDATE SET
                owner = excluded.owner,
                expires_at = excluded.expires_at
             WHERE leader_lease.owner = excluded.owner OR leader_lease.expires_at < ?",
        )
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn current_leader(&self) -> Result<Option<LeaderLease>> {
        let row = sqlx::query("SELECT owner, expires_at FROM leader_lease WHERE anchor = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|row| LeaderLease {
            owner: row.get("owner"),
            expires_at: ts(row.get("expires_at")),
        }))
    }

    async fn release_leader_lease(&self, owner: &str) -> Result<()> {
        sqlx::query("UPDATE leader_lease SET expires_at = 0 WHERE anchor = 1 AND owner = ?")
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_cluster_alias(&self, cluster: &str, alias: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO cluster_alias (cluster_name, alias) VALUES (?, ?)
             ON CONFLICT (cluster_name) DO UPDATE SET alias = excluded.alias",
        )
        .bind(cluster)
        .bind(alias)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn cluster_for_alias(&self, alias: &str) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>("SELECT cluster_name FROM cluster_alias WHERE alias = ?")
            .bind(alias)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn register_pool_instance(&self, pool: &str, key: &InstanceKey) -> Result<()> {
        sqlx::query(
            "INSERT INTO pool_instance (pool, hostname, port) VALUES (?, ?, ?)
             ON CONFLICT (pool, hostname, port) DO NOTHING",
        )
        .bind(pool)
        .bind(&key.hostname)
        .bind(key.port as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn read_pool_instances(&self, pool: &str) -> Result<Vec<InstanceKey>> {
        let rows = sqlx::query(
            "SELECT hostname, port FROM pool_instance WHERE pool = ? ORDER BY hostname, port",
        )
        .bind(pool)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| {
                InstanceKey::new(row.get::<String, _>("hostname"), row.get::<i64, _>("port") as u16)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_core::gtid::GtidSet;
    use canopy_core::PromotionRule;

    fn make_instance(host: &str, upstream: Option<&str>, cluster: &str) -> Instance {
        Instance {
            key: InstanceKey::new(host, 3306),
            server_id: 1,
            version: "8.0.36".to_string(),
            server_uuid: None,
            is_co_primary: false,
            is_binlog_server: false,
            log_bin_enabled: true,
            log_replica_updates: true,
            binlog_format: "ROW".to_string(),
            read_only: upstream.is_some(),
            upstream_key: upstream.map(|u| InstanceKey::new(u, 3306)),
            replica_io_running: upstream.is_some(),
            replica_sql_running: upstream.is_some(),
            executed_gtid_set: GtidSet::new(),
            retrieved_gtid_set: GtidSet::new(),
            using_gtid: false,
            auto_position: false,
            seconds_behind_primary: None,
            last_io_error: None,
            last_sql_error: None,
            self_coordinates: Some(BinlogCoordinates::binary("mysql-bin.000001", 4)),
            read_binlog_coordinates: None,
            exec_binlog_coordinates: None,
            relaylog_coordinates: None,
            cluster_name: cluster.to_string(),
            data_center: "dc1".to_string(),
            promotion_rule: PromotionRule::Neutral,
            is_last_check_valid: true,
            last_seen: Some(Utc::now()),
        }
    }

    fn key(host: &str) -> InstanceKey {
        InstanceKey::new(host, 3306)
    }

    #[tokio::test]
    async fn test_instance_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let instance = make_instance("db1", None, "main");
        store.write_instance(&instance).await.unwrap();

        let read = store.read_instance(&key("db1")).await.unwrap().unwrap();
        assert_eq!(read.key, instance.key);
        assert_eq!(read.cluster_name, "main");
        assert!(read.is_last_check_valid);
        assert!(store.read_instance(&key("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replicas_and_clusters() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.write_instance(&make_instance("db1", None, "main")).await.unwrap();
        store.write_instance(&make_instance("db2", Some("db1"), "main")).await.unwrap();
        store.write_instance(&make_instance("db3", Some("db1"), "main")).await.unwrap();
        store.write_instance(&make_instance("other1", None, "other")).await.unwrap();

        let replicas = store.read_replicas(&key("db1")).await.unwrap();
        assert_eq!(replicas.len(), 2);
        assert_eq!(store.read_cluster_instances("main").await.unwrap().len(), 3);
        assert_eq!(store.read_cluster_names().await.unwrap(), vec!["main", "other"]);
        assert_eq!(store.read_all_keys().await.unwrap().len(), 4);

        store.forget_instance(&key("db3")).await.unwrap();
        assert_eq!(store.read_replicas(&key("db1")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_unreachable() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.write_instance(&make_instance("db1", None, "main")).await.unwrap();
        store.mark_unreachable(&key("db1")).await.unwrap();
        let read = store.read_instance(&key("db1")).await.unwrap().unwrap();
        assert!(!read.is_last_check_valid);
    }

    #[tokio::test]
    async fn test_outdated_keys() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut stale = make_instance("db1", None, "main");
        stale.last_seen = Some(Utc::now() - chrono::Duration::minutes(10));
        store.write_instance(&stale).await.unwrap();
        store.write_instance(&make_instance("db2", None, "main")).await.unwrap();

        let outdated = store.read_outdated_keys(Duration::from_secs(60)).await.unwrap();
        assert_eq!(outdated, vec![key("db1")]);
    }

    #[tokio::test]
    async fn test_maintenance_is_exclusive() {
        let store = SqliteStore::in_memory().await.unwrap();
        let token = store.begin_maintenance(&key("db1"), "ops", "relocation").await.unwrap();
        assert!(store.in_maintenance(&key("db1")).await.unwrap());

        let second = store.begin_maintenance(&key("db1"), "ops2", "again").await;
        assert!(matches!(second, Err(TopologyError::LockContended(_))));

        store.end_maintenance(token).await.unwrap();
        assert!(!store.in_maintenance(&key("db1")).await.unwrap());
        store.begin_maintenance(&key("db1"), "ops2", "again").await.unwrap();
    }

    #[tokio::test]
    async fn test_downtime_lifecycle() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.active_downtime(&key("db1")).await.unwrap().is_none());

        store
            .begin_downtime(&key("db1"), "ops", "planned", Some(Duration::from_secs(3600)))
            .await
            .unwrap();
        let downtime = store.active_downtime(&key("db1")).await.unwrap().unwrap();
        assert_eq!(downtime.owner, "ops");
        assert!(downtime.ends_at.is_some());

        store.end_downtime(&key("db1")).await.unwrap();
        assert!(store.active_downtime(&key("db1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_equivalence_groups() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = BinlogCoordinates::binary("mysql-bin.000010", 100);
        let b = BinlogCoordinates::binary("mysql-bin.000003", 900);
        store.record_equivalence(&key("db1"), &a, &key("db2"), &b).await.unwrap();

        let found = store.find_equivalent(&key("db1"), &a).await.unwrap();
        assert_eq!(found, vec![(key("db2"), b.clone())]);
        let found = store.find_equivalent(&key("db2"), &b).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(store
            .find_equivalent(&key("db1"), &BinlogCoordinates::binary("mysql-bin.000010", 101))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_recovery_lock_and_lifecycle() {
        let store = SqliteStore::in_memory().await.unwrap();
        let analysis = serde_json::json!({"code": "DeadPrimary"});
        let recovery = store
            .register_recovery("main", "DeadPrimary", &key("db1"), &analysis)
            .await
            .unwrap();
        assert!(recovery.ended_at.is_none());

        // Second registration for the same cluster loses the CAS.
        let contended = store
            .register_recovery("main", "DeadPrimary", &key("db1"), &analysis)
            .await;
        assert!(matches!(contended, Err(TopologyError::LockContended(_))));

        // A different cluster is unaffected.
        store
            .register_recovery("other", "DeadPrimary", &key("o1"), &analysis)
            .await
            .unwrap();

        store
            .resolve_recovery(recovery.id, true, Some(&key("db2")), &[key("db2"), key("db3")])
            .await
            .unwrap();
        let resolved = store.read_recovery(recovery.id).await.unwrap().unwrap();
        assert!(resolved.is_successful);
        assert_eq!(resolved.successor_key, Some(key("db2")));
        assert_eq!(resolved.participating_keys.len(), 2);
        assert!(store.read_active_recovery("main").await.unwrap().is_none());

        // Lock is released: a new recovery may open.
        store
            .register_recovery("main", "DeadPrimary", &key("db1"), &analysis)
            .await
            .unwrap();

        let recent = store
            .read_recent_recoveries("main", "DeadPrimary", Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, recovery.id);
    }

    #[tokio::test]
    async fn test_acknowledgement() {
        let store = SqliteStore::in_memory().await.unwrap();
        let analysis = serde_json::json!({});
        let recovery = store
            .register_recovery("main", "DeadPrimary", &key("db1"), &analysis)
            .await
            .unwrap();
        store.resolve_recovery(recovery.id, true, None, &[]).await.unwrap();
        store.acknowledge_recovery(recovery.id, "alice", "verified").await.unwrap();

        let read = store.read_recovery(recovery.id).await.unwrap().unwrap();
        assert!(read.acknowledged);
        assert_eq!(read.acknowledged_by.as_deref(), Some("alice"));

        let second = store
            .register_recovery("main", "DeadPrimary", &key("db1"), &analysis)
            .await
            .unwrap();
        store.resolve_recovery(second.id, false, None, &[]).await.unwrap();
        let count = store
            .acknowledge_cluster_recoveries("main", "bob", "bulk")
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_blocked_recoveries() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .record_blocked_recovery("main", "DeadPrimary", &key("db1"), Some(7), "debounced")
            .await
            .unwrap();
        let blocked = store.read_blocked_recoveries("main").await.unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].blocking_recovery_id, Some(7));
        assert_eq!(blocked[0].reason, "debounced");
    }

    #[tokio::test]
    async fn test_leader_lease_contention_and_reclaim() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.attempt_leader_lease("node-1", Duration::from_secs(60)).await.unwrap());
        // Holder renews freely.
        assert!(store.attempt_leader_lease("node-1", Duration::from_secs(60)).await.unwrap());
        // Another node cannot take a live lease.
        assert!(!store.attempt_leader_lease("node-2", Duration::from_secs(60)).await.unwrap());

        let lease = store.current_leader().await.unwrap().unwrap();
        assert_eq!(lease.owner, "node-1");

        // After release the lease is reclaimable.
        store.release_leader_lease("node-1").await.unwrap();
        assert!(store.attempt_leader_lease("node-2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.current_leader().await.unwrap().unwrap().owner, "node-2");
    }

    #[tokio::test]
    async fn test_audit_stream() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.append_audit(Some(&key("db1")), "relocated below db2").await.unwrap();
        store.append_audit(None, "analysis pass complete").await.unwrap();

        let entries = store.read_audit(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "analysis pass complete");
        assert!(entries[0].key.is_none());
        assert_eq!(entries[1].key, Some(key("db1")));
    }

    #[tokio::test]
    async fn test_alias_and_pools() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.set_cluster_alias("main-cluster", "prod").await.unwrap();
        assert_eq!(
            store.cluster_for_alias("prod").await.unwrap(),
            Some("main-cluster".to_string())
        );
        assert!(store.cluster_for_alias("missing").await.unwrap().is_none());

        store.register_pool_instance("readers", &key("db2")).await.unwrap();
        store.register_pool_instance("readers", &key("db2")).await.unwrap();
        assert_eq!(store.read_pool_instances("readers").await.unwrap(), vec![key("db2")]);
    }
}
