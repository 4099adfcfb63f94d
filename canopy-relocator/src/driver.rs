//! Replication driver capability
//!
//! The narrow interface through which the engine drives an external
//! replication subsystem: status reads, replica thread control, source
//! changes and binary log scans. Deployments back this with their SQL
//! dialect; the [`crate::sim`] module provides a deterministic in-memory
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use uuid::Uuid;

use canopy_core::{BinlogCoordinates, BinlogType, InstanceKey, PromotionRule, Result};

/// One entry of a binary or relay log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogEvent {
    pub coordinates: BinlogCoordinates,
    /// Declared on-disk length; the next entry begins at `log_pos + length`.
    pub length: i64,
    pub text: String,
}

impl BinlogEvent {
    /// Position immediately after this entry.
    pub fn next_coordinates(&self) -> BinlogCoordinates {
        BinlogCoordinates {
            log_file: self.coordinates.log_file.clone(),
            log_pos: self.coordinates.log_pos + self.length,
            kind: self.coordinates.kind,
        }
    }
}

/// Where a re-pointed replica resumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourcePosition {
    /// Explicit binlog coordinates on the new upstream
    Coordinates(BinlogCoordinates),
    /// GTID auto-positioning; no coordinate arithmetic
    AutoPosition,
}

/// Raw replication state of one server, as reported by its dialect probe
#[derive(Debug, Clone, Default)]
pub struct InstanceStatus {
    pub server_id: u32,
    pub version: String,
    pub server_uuid: Option<Uuid>,
    pub log_bin_enabled: bool,
    pub log_replica_updates: bool,
    pub binlog_format: String,
    pub read_only: bool,
    pub is_binlog_server: bool,
    pub data_center: String,
    pub promotion_rule: PromotionRule,

    pub upstream_host: Option<String>,
    pub upstream_port: Option<u16>,
    pub replica_io_running: bool,
    pub replica_sql_running: bool,
    pub executed_gtid_set: String,
    pub retrieved_gtid_set: String,
    pub using_gtid: bool,
    pub auto_position: bool,
    pub seconds_behind: Option<u32>,
    pub last_io_error: Option<String>,
    pub last_sql_error: Option<String>,

    pub self_coordinates: Option<BinlogCoordinates>,
    pub read_binlog_coordinates: Option<BinlogCoordinates>,
    pub exec_binlog_coordinates: Option<BinlogCoordinates>,
    pub relaylog_coordinates: Option<BinlogCoordinates>,

    /// Downstream replicas the server reports, for auto-discovery
    pub downstream_keys: Vec<InstanceKey>,
}

/// Replication control capability
///
/// Every call may suspend on I/O and respects the caller's deadline; errors
/// classify through `TopologyError` (`Unreachable`, `AuthDenied`,
/// `ProtocolMismatch`, `Timeout`).
#[async_trait]
pub trait ReplicationDriver: Send + Sync {
    /// Read a full replication status snapshot.
    async fn read_status(&self, key: &InstanceKey) -> Result<InstanceStatus>;

    async fn stop_replica(&self, key: &InstanceKey) -> Result<()>;

    async fn start_replica(&self, key: &InstanceKey) -> Result<()>;

    /// Stop only once the SQL thread has caught up with the I/O thread.
    async fn stop_replica_nicely(&self, key: &InstanceKey, timeout: Duration) -> Result<()>;

    /// Re-point the replica at a new upstream.
    async fn change_replication_source(
        &self,
        key: &InstanceKey,
        upstream: &InstanceKey,
        position: SourcePosition,
    ) -> Result<()>;

    /// Clear all replication configuration.
    async fn reset_replica(&self, key: &InstanceKey) -> Result<()>;

    async fn skip_next_event(&self, key: &InstanceKey) -> Result<()>;

    async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<()>;

    async fn kill_process(&self, key: &InstanceKey, process_id: i64) -> Result<()>;

    /// Names of the server's log files for one stream, oldest first.
    async fn log_files(&self, key: &InstanceKey, kind: BinlogType) -> Result<Vec<String>>;

    /// Entries of one log file from `from` up to `to` (when `to` addresses
    /// the same file) or end-of-file. `filter` restricts to entries whose
    /// text equals it exactly.
    async fn scan_binary_log(
        &self,
        key: &InstanceKey,
        from: &BinlogCoordinates,
        to: Option<&BinlogCoordinates>,
        filter: Option<&str>,
    ) -> Result<Vec<BinlogEvent>>;

    /// The most recent entry at/before `from` matching `pattern`, scanning
    /// backward across at most `max_backward_files` rotated files.
    async fn find_pseudo_gtid(
        &self,
        key: &InstanceKey,
        pattern: &Regex,
        from: &BinlogCoordinates,
        max_backward_files: usize,
    ) -> Result<Option<BinlogEvent>> {
        let window = backward_window(self, key, from, max_backward_files).await?;
        Ok(window.into_iter().rev().find(|event| pattern.is_match(&event.text)))
    }
}

/// All entries of the backward scan window ending at `from`, oldest first.
///
/// Walks the rotated file list backward from `from`'s file, bounded by
/// `max_backward_files`, then scans forward within the window.
pub async fn backward_window<D: ReplicationDriver + ?Sized>(
    driver: &D,
    key: &InstanceKey,
    from: &BinlogCoordinates,
    max_backward_files: usize,
) -> Result<Vec<BinlogEvent>> {
    let files = driver.log_files(key, from.kind).await?;
    let end_index = files
        .iter()
        .position(|file| file == &from.log_file || file.as_str() == from.file_basename());
    let Some(end_index) = end_index else {
        return Ok(Vec::new());
    };
    let start_index = end_index.saturating_sub(max_backward_files.saturating_sub(1));

    let mut window = Vec::new();
    for (index, file) in files[start_index..=end_index].iter().enumerate() {
        let file_start = BinlogCoordinates {
            log_file: file.clone(),
            log_pos: 0,
            kind: from.kind,
        };
        let is_last = start_index + index == end_index;
        let to = if is_last { Some(from) } else { None };
        let events = driver.scan_binary_log(key, &file_start, to, None).await?;
        window.extend(events);
    }
    Ok(window)
}
