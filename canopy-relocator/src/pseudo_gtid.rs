//! Pseudo-GTID matching
//!
//! When native GTID is unavailable, an operator-injected unique marker in
//! the binary log lets us translate a replica's execution point into a new
//! target's coordinates: find the shared marker in both logs, then replay
//! the replica's suffix against the target, advancing by entry lengths.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, instrument};

use canopy_core::{BinlogCoordinates, Instance, Result, TopologyError};

use crate::driver::{backward_window, BinlogEvent, ReplicationDriver};

/// Matcher configuration
#[derive(Debug, Clone)]
pub struct PseudoGtidConfig {
    /// Pattern recognizing injected markers
    pub pattern: Regex,
    /// Rotated-file bound for backward scans
    pub max_backward_files: usize,
    /// How many older markers to fall back to when the newest is not found
    /// on the target
    pub marker_retries: usize,
}

impl Default for PseudoGtidConfig {
    fn default() -> Self {
        Self {
            pattern: Regex::new(r"^drop view if exists `_pseudo_gtid_hint__")
                .expect("static marker pattern compiles"),
            max_backward_files: 4,
            marker_retries: 3,
        }
    }
}

/// Marker occurrences within one target's scan window
///
/// Built once per target; bulk sibling matches share it so the backward
/// scan is amortized.
#[derive(Debug, Default)]
pub struct MarkerIndex {
    entries: HashMap<String, (BinlogCoordinates, usize)>,
}

impl MarkerIndex {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Coordinates of the last occurrence plus occurrence count.
    fn locate(&self, text: &str) -> Option<&(BinlogCoordinates, usize)> {
        self.entries.get(text)
    }
}

/// Translates replica positions into target positions via shared markers
pub struct PseudoGtidMatcher {
    driver: Arc<dyn ReplicationDriver>,
    config: PseudoGtidConfig,
}

impl PseudoGtidMatcher {
    pub fn new(driver: Arc<dyn ReplicationDriver>, config: PseudoGtidConfig) -> Self {
        Self { driver, config }
    }

    pub fn config(&self) -> &PseudoGtidConfig {
        &self.config
    }

    /// Most recent marker visible on an instance, if any.
    pub async fn last_pseudo_gtid(&self, instance: &Instance) -> Result<Option<BinlogEvent>> {
        let origin = self.scan_origin(instance)?;
        self.driver
            .find_pseudo_gtid(
                &instance.key,
                &self.config.pattern,
                &origin,
                self.config.max_backward_files,
            )
            .await
    }

    /// Scan the target's backward window once, indexing every marker.
    pub async fn build_marker_index(&self, target: &Instance) -> Result<MarkerIndex> {
        let tip = target.self_coordinates.clone().ok_or_else(|| {
            TopologyError::NoSharedHistory {
                src: String::new(),
                target: target.key.to_string(),
                reason: "target has no binary log".to_string(),
            }
        })?;
        let window =
            backward_window(self.driver.as_ref(), &target.key, &tip, self.config.max_backward_files)
                .await?;
        let mut index = MarkerIndex::default();
        for event in window {
            if self.config.pattern.is_match(&event.text) {
                let entry = index
                    .entries
                    .entry(event.text.clone())
                    .or_insert((event.coordinates.clone(), 0));
                entry.0 = event.coordinates;
                entry.1 += 1;
            }
        }
        debug!(target = %target.key, markers = index.len(), "Marker index built");
        Ok(index)
    }

    /// Translate the replica's execution point into target coordinates.
    #[instrument(skip(self, replica, target), fields(replica = %replica.key, target = %target.key))]
    pub async fn match_coordinates(
        &self,
        replica: &Instance,
        target: &Instance,
    ) -> Result<BinlogCoordinates> {
        let index = self.build_marker_index(target).await?;
        self.match_with_index(replica, target, &index).await
    }

    /// Translation against a pre-built target index (bulk path).
    pub async fn match_with_index(
        &self,
        replica: &Instance,
        target: &Instance,
        index: &MarkerIndex,
    ) -> Result<BinlogCoordinates> {
        if index.is_empty() {
            return Err(TopologyError::NoSharedHistory {
                src: replica.key.to_string(),
                target: target.key.to_string(),
                reason: "target has no pseudo-gtid markers in its scan window".to_string(),
            });
        }

        let origin = self.scan_origin(replica)?;
        let window = backward_window(
            self.driver.as_ref(),
            &replica.key,
            &origin,
            self.config.max_backward_files,
        )
        .await?;
        let marker_positions: Vec<usize> = window
            .iter()
            .enumerate()
            .filter(|(_, event)| self.config.pattern.is_match(&event.text))
            .map(|(position, _)| position)
            .collect();
        if marker_positions.is_empty() {
            return Err(TopologyError::NoSharedHistory {
                src: replica.key.to_string(),
                target: target.key.to_string(),
                reason: "replica log window holds no pseudo-gtid marker".to_string(),
            });
        }

        // Newest marker first; when the target does not know it (the target
        // is behind, or rotated it away) step back to an older one, which
        // lengthens the replayed suffix.
        for &position in marker_positions
            .iter()
            .rev()
            .take(self.config.marker_retries + 1)
        {
            let marker = &window[position];
            let suffix = &window[position + 1..];
            match index.locate(&marker.text) {
                None => {
                    debug!(marker = %marker.coordinates, "Marker absent on target, stepping back");
                    continue;
                }
                Some((_, occurrences)) if *occurrences > 1 => {
                    return Err(TopologyError::AmbiguousPseudoGtid {
                        key: target.key.to_string(),
                        occurrences: *occurrences,
                    });
                }
                Some((coordinates, _)) => {
                    return self.replay_suffix(replica, target, coordinates, suffix).await;
                }
            }
        }

        Err(TopologyError::NoSharedHistory {
            src: replica.key.to_string(),
            target: target.key.to_string(),
            reason: format!(
                "no shared marker within {} retries",
                self.config.marker_retries
            ),
        })
    }

    /// Where to scan on the replica: its own binlog when it logs replica
    /// updates, otherwise its relay log.
    fn scan_origin(&self, replica: &Instance) -> Result<BinlogCoordinates> {
        if replica.log_bin_enabled && replica.log_replica_updates {
            if let Some(coordinates) = &replica.self_coordinates {
                return Ok(coordinates.clone());
            }
        }
        if let Some(coordinates) = &replica.relaylog_coordinates {
            return Ok(coordinates.clone());
        }
        Err(TopologyError::NoSharedHistory {
            src: replica.key.to_string(),
            target: String::new(),
            reason: "replica has neither a scannable binlog nor a relay log".to_string(),
        })
    }

    /// Replay the replica's suffix on the target from the marker onward.
    async fn replay_suffix(
        &self,
        replica: &Instance,
        target: &Instance,
        marker_coordinates: &BinlogCoordinates,
        suffix: &[BinlogEvent],
    ) -> Result<BinlogCoordinates> {
        // The first fetched entry is the marker itself; each suffix entry
        // must match the next target entry under normalization.
        let events = self
            .target_events_from(target, marker_coordinates, suffix.len() + 1)
            .await?;
        let Some(marker_event) = events.first() else {
            return Err(TopologyError::NoSharedHistory {
                src: replica.key.to_string(),
                target: target.key.to_string(),
                reason: "marker vanished from target during replay".to_string(),
            });
        };

        let mut cursor = marker_event.next_coordinates();
        for (position, expected) in suffix.iter().enumerate() {
            let Some(actual) = events.get(position + 1) else {
                return Err(TopologyError::NoSharedHistory {
                    src: replica.key.to_string(),
                    target: target.key.to_string(),
                    reason: "target binary log ends before the replica's suffix is matched"
                        .to_string(),
                });
            };
            if normalize_statement(&actual.text) != normalize_statement(&expected.text) {
                return Err(TopologyError::DivergedHistories(format!(
                    "entry {} after marker differs between {} and {}: {:?} vs {:?}",
                    position + 1,
                    replica.key,
                    target.key,
                    expected.text,
                    actual.text,
                )));
            }
            cursor = actual.next_coordinates();
        }
        debug!(coordinates = %cursor, "Suffix replayed onto target");
        Ok(cursor)
    }

    /// Target entries starting at `start` (inclusive), following rotation,
    /// until `needed` entries are collected or the logs end.
    async fn target_events_from(
        &self,
        target: &Instance,
        start: &BinlogCoordinates,
        needed: usize,
    ) -> Result<Vec<BinlogEvent>> {
        let files = self.driver.log_files(&target.key, start.kind).await?;
        let Some(mut file_index) = files
            .iter()
            .position(|file| file == &start.log_file || file.as_str() == start.file_basename())
        else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        let mut from = start.clone();
        loop {
            let batch = self
                .driver
                .scan_binary_log(&target.key, &from, None, None)
                .await?;
            events.extend(batch);
            if events.len() >= needed {
                break;
            }
            file_index += 1;
            let Some(next_file) = files.get(file_index) else {
                break;
            };
            from = BinlogCoordinates {
                log_file: next_file.clone(),
                log_pos: 0,
                kind: start.kind,
            };
        }
        Ok(events)
    }
}

static NORMALIZERS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

fn normalizers() -> &'static [(Regex, &'static str)] {
    NORMALIZERS.get_or_init(|| {
        vec![
            (
                Regex::new(r"\b\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}\b")
                    .expect("static pattern compiles"),
                "<timestamp>",
            ),
            (
                Regex::new(r"(?i)\bset timestamp\s*=\s*\d+").expect("static pattern compiles"),
                "set timestamp=<n>",
            ),
            (
                Regex::new(r"(?i)\bauto_increment\s*=\s*\d+").expect("static pattern compiles"),
                "auto_increment=<n>",
            ),
            (
                Regex::new(r"(?i)\bserver[_-]id\s*[=:]\s*\d+").expect("static pattern compiles"),
                "server_id=<n>",
            ),
        ]
    })
}

/// Strip session-local noise so that the same logical statement compares
/// equal across servers.
pub fn normalize_statement(text: &str) -> String {
    let mut normalized = text.trim().to_string();
    for (pattern, replacement) in normalizers() {
        normalized = pattern.replace_all(&normalized, *replacement).into_owned();
    }
    normalized
}
