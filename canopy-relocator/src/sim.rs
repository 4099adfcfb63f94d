//! In-memory fleet simulator
//!
//! A deterministic [`ReplicationDriver`] over a scripted fleet: servers hold
//! real per-server binary and relay logs, statements committed on a primary
//! propagate down the replication tree, and control operations mutate the
//! same state the probe then observes. Used by the scenario tests and by the
//! daemon's development mode.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use canopy_core::{
    BinlogCoordinates, BinlogType, GtidInterval, GtidSet, InstanceKey, PromotionRule, Result,
    TopologyError,
};

use crate::driver::{BinlogEvent, InstanceStatus, ReplicationDriver, SourcePosition};

const INITIAL_POS: i64 = 4;

#[derive(Debug, Clone)]
struct SimLogFile {
    name: String,
    events: Vec<BinlogEvent>,
    next_pos: i64,
}

impl SimLogFile {
    fn new(name: String) -> Self {
        Self {
            name,
            events: Vec::new(),
            next_pos: INITIAL_POS,
        }
    }

    fn append(&mut self, kind: BinlogType, text: &str, length: i64) -> BinlogCoordinates {
        let coordinates = BinlogCoordinates {
            log_file: self.name.clone(),
            log_pos: self.next_pos,
            kind,
        };
        self.events.push(BinlogEvent {
            coordinates: coordinates.clone(),
            length,
            text: text.to_string(),
        });
        self.next_pos += length;
        coordinates
    }

    /// Position one past the last entry.
    fn tail(&self, kind: BinlogType) -> BinlogCoordinates {
        BinlogCoordinates {
            log_file: self.name.clone(),
            log_pos: self.next_pos,
            kind,
        }
    }
}

/// One simulated server
#[derive(Debug, Clone)]
pub struct SimServer {
    pub key: InstanceKey,
    pub server_id: u32,
    pub version: String,
    pub server_uuid: Option<Uuid>,
    pub log_bin: bool,
    pub log_replica_updates: bool,
    pub binlog_format: String,
    pub read_only: bool,
    pub is_binlog_server: bool,
    pub data_center: String,
    pub promotion_rule: PromotionRule,
    pub reachable: bool,

    pub upstream: Option<InstanceKey>,
    pub io_running: bool,
    pub sql_running: bool,
    pub auto_position: bool,
    pub using_gtid: bool,
    pub executed_gtid: GtidSet,
    pub retrieved_gtid: GtidSet,
    pub last_io_error: Option<String>,
    pub last_sql_error: Option<String>,
    pub seconds_behind: Option<u32>,

    /// SQL thread position within the upstream's binlog
    pub exec_upstream: Option<BinlogCoordinates>,
    /// I/O thread position within the upstream's binlog
    pub read_upstream: Option<BinlogCoordinates>,
    /// SQL thread position within the local relay log
    pub relay_exec: Option<BinlogCoordinates>,

    binlog: Vec<SimLogFile>,
    relay: Vec<SimLogFile>,
}

impl SimServer {
    fn new(key: InstanceKey, server_id: u32) -> Self {
        let binlog_name = format!("{}-bin.000001", key.hostname);
        let relay_name = format!("{}-relay.000001", key.hostname);
        Self {
            key,
            server_id,
            version: "8.0.36".to_string(),
            server_uuid: Some(Uuid::new_v4()),
            log_bin: true,
            log_replica_updates: true,
            binlog_format: "ROW".to_string(),
            read_only: false,
            is_binlog_server: false,
            data_center: "dc1".to_string(),
            promotion_rule: PromotionRule::Neutral,
            reachable: true,
            upstream: None,
            io_running: false,
            sql_running: false,
            auto_position: false,
            using_gtid: false,
            executed_gtid: GtidSet::new(),
            retrieved_gtid: GtidSet::new(),
            last_io_error: None,
            last_sql_error: None,
            seconds_behind: None,
            exec_upstream: None,
            read_upstream: None,
            relay_exec: None,
            binlog: vec![SimLogFile::new(binlog_name)],
            relay: vec![SimLogFile::new(relay_name)],
        }
    }

    /// Own write position.
    pub fn binlog_tail(&self) -> BinlogCoordinates {
        self.binlog
            .last()
            .map(|file| file.tail(BinlogType::Binary))
            .unwrap_or_else(|| BinlogCoordinates::binary("", INITIAL_POS))
    }

    fn relay_tail(&self) -> BinlogCoordinates {
        self.relay
            .last()
            .map(|file| file.tail(BinlogType::Relay))
            .unwrap_or_else(|| BinlogCoordinates::relay("", INITIAL_POS))
    }

    /// Append to the local binlog (and relay log when replicating).
    fn apply_local(&mut self, text: &str, length: i64, via_replication: bool) {
        if via_replication {
            if let Some(file) = self.relay.last_mut() {
                file.append(BinlogType::Relay, text, length);
            }
            self.relay_exec = Some(self.relay_tail());
        }
        if self.log_bin && (!via_replication || self.log_replica_updates) {
            if let Some(file) = self.binlog.last_mut() {
                file.append(BinlogType::Binary, text, length);
            }
        }
    }

    fn files(&self, kind: BinlogType) -> &[SimLogFile] {
        match kind {
            BinlogType::Binary => &self.binlog,
            BinlogType::Relay => &self.relay,
        }
    }
}

#[derive(Default)]
struct FleetState {
    servers: BTreeMap<InstanceKey, SimServer>,
    /// Control-operation journal, for assertions on side effects
    ops: Vec<String>,
    next_server_id: u32,
}

/// Handle to a simulated fleet; cheap to clone
#[derive(Clone, Default)]
pub struct SimFleet {
    state: Arc<Mutex<FleetState>>,
}

impl SimFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FleetState> {
        self.state.lock().expect("sim fleet poisoned")
    }

    /// Add a standalone primary.
    pub fn add_primary(&self, key: &str) -> InstanceKey {
        let key: InstanceKey = key.parse().expect("malformed sim key");
        let mut state = self.lock();
        state.next_server_id += 1;
        let server = SimServer::new(key.clone(), state.next_server_id);
        state.servers.insert(key.clone(), server);
        key
    }

    /// Add a replica attached to `upstream`, caught up to its current tail.
    pub fn add_replica(&self, key: &str, upstream: &str) -> InstanceKey {
        let key = self.add_primary(key);
        let upstream: InstanceKey = upstream.parse().expect("malformed sim key");
        let mut state = self.lock();
        let upstream_tail = state
            .servers
            .get(&upstream)
            .map(|server| server.binlog_tail())
            .expect("unknown upstream in sim");
        let server = state.servers.get_mut(&key).expect("server just added");
        server.upstream = Some(upstream);
        server.io_running = true;
        server.sql_running = true;
        server.read_only = true;
        server.seconds_behind = Some(0);
        server.exec_upstream = Some(upstream_tail.clone());
        server.read_upstream = Some(upstream_tail);
        server.relay_exec = Some(server.relay_tail());
        key
    }

    /// Mutate one server in place.
    pub fn update<F: FnOnce(&mut SimServer)>(&self, key: &InstanceKey, f: F) {
        let mut state = self.lock();
        let server = state.servers.get_mut(key).expect("unknown sim server");
        f(server);
    }

    pub fn server(&self, key: &InstanceKey) -> SimServer {
        self.lock().servers.get(key).expect("unknown sim server").clone()
    }

    pub fn all_keys(&self) -> Vec<InstanceKey> {
        self.lock().servers.keys().cloned().collect()
    }

    /// Make a server unreachable (and, implicitly, break its replicas' I/O).
    pub fn set_unreachable(&self, key: &InstanceKey) {
        let mut state = self.lock();
        if let Some(server) = state.servers.get_mut(key) {
            server.reachable = false;
        }
        let downstream: Vec<InstanceKey> = state
            .servers
            .values()
            .filter(|server| server.upstream.as_ref() == Some(key))
            .map(|server| server.key.clone())
            .collect();
        for replica_key in downstream {
            let replica = state.servers.get_mut(&replica_key).expect("replica exists");
            replica.io_running = false;
            replica.last_io_error = Some("error reconnecting to source".to_string());
            replica.seconds_behind = None;
        }
    }

    /// Commit a statement on a primary and replicate it down the tree.
    pub fn commit(&self, key: &InstanceKey, text: &str, length: i64) -> BinlogCoordinates {
        self.commit_inner(key, text, length, None)
    }

    /// Commit a GTID-stamped transaction and replicate it down the tree.
    pub fn commit_gtid(
        &self,
        key: &InstanceKey,
        source: Uuid,
        txn: u64,
        text: &str,
        length: i64,
    ) -> BinlogCoordinates {
        self.commit_inner(key, text, length, Some((source, txn)))
    }

    fn commit_inner(
        &self,
        key: &InstanceKey,
        text: &str,
        length: i64,
        gtid: Option<(Uuid, u64)>,
    ) -> BinlogCoordinates {
        let mut state = self.lock();
        let origin = state.servers.get_mut(key).expect("unknown sim server");
        origin.apply_local(text, length, false);
        if let Some((source, txn)) = gtid {
            origin.executed_gtid.add(source, GtidInterval::new(txn, txn));
        }
        let coordinates = origin.binlog_tail();
        Self::deliver(&mut state, key, text, length, gtid);
        coordinates
    }

    /// Recursively deliver a replicated statement to running replicas.
    fn deliver(
        state: &mut FleetState,
        upstream: &InstanceKey,
        text: &str,
        length: i64,
        gtid: Option<(Uuid, u64)>,
    ) {
        let upstream_tail = match state.servers.get(upstream) {
            Some(server) => server.binlog_tail(),
            None => return,
        };
        let receivers: Vec<InstanceKey> = state
            .servers
            .values()
            .filter(|server| {
                server.upstream.as_ref() == Some(upstream)
                    && server.reachable
                    && server.io_running
                    && server.sql_running
            })
            .map(|server| server.key.clone())
            .collect();
        for replica_key in receivers {
            {
                let replica = state.servers.get_mut(&replica_key).expect("replica exists");
                replica.apply_local(text, length, true);
                replica.exec_upstream = Some(upstream_tail.clone());
                replica.read_upstream = Some(upstream_tail.clone());
                if let Some((source, txn)) = gtid {
                    replica.executed_gtid.add(source, GtidInterval::new(txn, txn));
                    replica.retrieved_gtid.add(source, GtidInterval::new(txn, txn));
                }
            }
            Self::deliver(state, &replica_key, text, length, gtid);
        }
    }

    /// Apply a statement on one server only: an errant local write.
    pub fn corrupt(&self, key: &InstanceKey, text: &str, length: i64) {
        let mut state = self.lock();
        let server = state.servers.get_mut(key).expect("unknown sim server");
        server.apply_local(text, length, false);
    }

    /// Rotate a server's binary log.
    pub fn rotate_binlog(&self, key: &InstanceKey) {
        let mut state = self.lock();
        let server = state.servers.get_mut(key).expect("unknown sim server");
        let tail = server.binlog_tail();
        let next = tail.next_file().expect("sim binlog names are numeric");
        server.binlog.push(SimLogFile::new(next.log_file));
    }

    /// Control operations executed so far.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    fn record(&self, op: String) {
        self.lock().ops.push(op);
    }

    fn with_reachable<T>(
        &self,
        key: &InstanceKey,
        f: impl FnOnce(&mut SimServer) -> T,
    ) -> Result<T> {
        let mut state = self.lock();
        let server = state.servers.get_mut(key).ok_or_else(|| TopologyError::Unreachable {
            key: key.to_string(),
            reason: "unknown host".to_string(),
        })?;
        if !server.reachable {
            return Err(TopologyError::Unreachable {
                key: key.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(f(server))
    }
}

#[async_trait]
impl ReplicationDriver for SimFleet {
    async fn read_status(&self, key: &InstanceKey) -> Result<InstanceStatus> {
        let downstream_keys: Vec<InstanceKey> = {
            let state = self.lock();
            state
                .servers
                .values()
                .filter(|server| server.upstream.as_ref() == Some(key))
                .map(|server| server.key.clone())
                .collect()
        };
        self.with_reachable(key, |server| InstanceStatus {
            server_id: server.server_id,
            version: server.version.clone(),
            server_uuid: server.server_uuid,
            log_bin_enabled: server.log_bin,
            log_replica_updates: server.log_replica_updates,
            binlog_format: server.binlog_format.clone(),
            read_only: server.read_only,
            is_binlog_server: server.is_binlog_server,
            data_center: server.data_center.clone(),
            promotion_rule: server.promotion_rule,
            upstream_host: server.upstream.as_ref().map(|k| k.hostname.clone()),
            upstream_port: server.upstream.as_ref().map(|k| k.port),
            replica_io_running: server.io_running,
            replica_sql_running: server.sql_running,
            executed_gtid_set: server.executed_gtid.to_string(),
            retrieved_gtid_set: server.retrieved_gtid.to_string(),
            using_gtid: server.using_gtid,
            auto_position: server.auto_position,
            seconds_behind: server.seconds_behind,
            last_io_error: server.last_io_error.clone(),
            last_sql_error: server.last_sql_error.clone(),
            self_coordinates: server.log_bin.then(|| server.binlog_tail()),
            read_binlog_coordinates: server.read_upstream.clone(),
            exec_binlog_coordinates: server.exec_upstream.clone(),
            relaylog_coordinates: server.relay_exec.clone(),
            downstream_keys,
        })
    }

    async fn stop_replica(&self, key: &InstanceKey) -> Result<()> {
        self.record(format!("stop-replica {key}"));
        self.with_reachable(key, |server| {
            server.io_running = false;
            server.sql_running = false;
        })
    }

    async fn start_replica(&self, key: &InstanceKey) -> Result<()> {
        self.record(format!("start-replica {key}"));
        let mut state = self.lock();
        let Some(server) = state.servers.get(key) else {
            return Err(TopologyError::Unreachable {
                key: key.to_string(),
                reason: "unknown host".to_string(),
            });
        };
        if !server.reachable {
            return Err(TopologyError::Unreachable {
                key: key.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let upstream = server.upstream.clone();
        let auto_position = server.auto_position;
        let upstream_state = upstream
            .as_ref()
            .and_then(|up| state.servers.get(up))
            .map(|up| (up.executed_gtid.clone(), up.binlog_tail()));

        let server = state.servers.get_mut(key).expect("server present");
        if upstream.is_some() {
            server.io_running = true;
            server.sql_running = true;
            server.last_io_error = None;
            server.seconds_behind = Some(0);
            // Auto-positioning fetches whatever the upstream executed that
            // this server has not.
            if auto_position {
                if let Some((upstream_executed, upstream_tail)) = upstream_state {
                    server.executed_gtid = server.executed_gtid.union(&upstream_executed);
                    server.retrieved_gtid = server.retrieved_gtid.union(&upstream_executed);
                    server.exec_upstream = Some(upstream_tail.clone());
                    server.read_upstream = Some(upstream_tail);
                }
            }
        }
        Ok(())
    }

    async fn stop_replica_nicely(&self, key: &InstanceKey, _timeout: Duration) -> Result<()> {
        self.record(format!("stop-replica-nicely {key}"));
        self.with_reachable(key, |server| {
            // SQL thread catches up with the I/O thread before stopping.
            if let Some(read) = server.read_upstream.clone() {
                server.exec_upstream = Some(read);
            }
            server.io_running = false;
            server.sql_running = false;
        })
    }

    async fn change_replication_source(
        &self,
        key: &InstanceKey,
        upstream: &InstanceKey,
        position: SourcePosition,
    ) -> Result<()> {
        self.record(format!("change-source {key} -> {upstream} ({position:?})"));
        self.with_reachable(key, |server| {
            server.upstream = Some(upstream.clone());
            match position {
                SourcePosition::Coordinates(coords) => {
                    server.auto_position = false;
                    server.exec_upstream = Some(coords.clone());
                    server.read_upstream = Some(coords);
                }
                SourcePosition::AutoPosition => {
                    server.auto_position = true;
                    server.exec_upstream = None;
                    server.read_upstream = None;
                }
            }
        })
    }

    async fn reset_replica(&self, key: &InstanceKey) -> Result<()> {
        self.record(format!("reset-replica {key}"));
        self.with_reachable(key, |server| {
            server.upstream = None;
            server.io_running = false;
            server.sql_running = false;
            server.auto_position = false;
            server.exec_upstream = None;
            server.read_upstream = None;
            server.relay_exec = None;
            server.seconds_behind = None;
        })
    }

    async fn skip_next_event(&self, key: &InstanceKey) -> Result<()> {
        self.record(format!("skip-next-event {key}"));
        self.with_reachable(key, |_| ())
    }

    async fn set_read_only(&self, key: &InstanceKey, read_only: bool) -> Result<()> {
        self.record(format!("set-read-only {key} {read_only}"));
        self.with_reachable(key, |server| {
            server.read_only = read_only;
        })
    }

    async fn kill_process(&self, key: &InstanceKey, process_id: i64) -> Result<()> {
        self.record(format!("kill-process {key} {process_id}"));
        self.with_reachable(key, |_| ())
    }

    async fn log_files(&self, key: &InstanceKey, kind: BinlogType) -> Result<Vec<String>> {
        self.with_reachable(key, |server| {
            server.files(kind).iter().map(|file| file.name.clone()).collect()
        })
    }

    async fn scan_binary_log(
        &self,
        key: &InstanceKey,
        from: &BinlogCoordinates,
        to: Option<&BinlogCoordinates>,
        filter: Option<&str>,
    ) -> Result<Vec<BinlogEvent>> {
        self.with_reachable(key, |server| {
            let Some(file) = server
                .files(from.kind)
                .iter()
                .find(|file| file.name == from.log_file)
            else {
                return Vec::new();
            };
            file.events
                .iter()
                .filter(|event| event.coordinates.log_pos >= from.log_pos)
                .filter(|event| match to {
                    Some(to) if to.log_file == file.name => event.coordinates.log_pos <= to.log_pos,
                    _ => true,
                })
                .filter(|event| filter.map_or(true, |text| event.text == text))
                .cloned()
                .collect()
        })
    }

}
