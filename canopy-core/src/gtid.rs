//! GTID set algebra
//!
//! A GTID set maps a source UUID to a list of contiguous transaction-id
//! intervals. Intervals per UUID are inclusive, non-overlapping and stored
//! in ascending order; every operation preserves that invariant.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TopologyError;

/// One inclusive interval of transaction ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidInterval {
    pub start: u64,
    pub end: u64,
}

impl GtidInterval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A set of executed transactions, keyed by source UUID
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, Vec<GtidInterval>>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Number of transactions across all sources.
    pub fn cardinality(&self) -> u64 {
        self.sets
            .values()
            .flat_map(|intervals| intervals.iter())
            .map(GtidInterval::len)
            .sum()
    }

    /// Source UUIDs present in this set.
    pub fn source_uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.sets.keys()
    }

    /// Whether any source UUID appears in both sets.
    pub fn shares_source_with(&self, other: &GtidSet) -> bool {
        self.sets.keys().any(|uuid| other.sets.contains_key(uuid))
    }

    /// Add one interval for a source, re-normalizing.
    pub fn add(&mut self, uuid: Uuid, interval: GtidInterval) {
        let intervals = self.sets.entry(uuid).or_default();
        intervals.push(interval);
        *intervals = normalize(std::mem::take(intervals));
    }

    /// Union of two sets.
    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for (uuid, intervals) in &other.sets {
            let merged = result.sets.entry(*uuid).or_default();
            merged.extend(intervals.iter().copied());
            *merged = normalize(std::mem::take(merged));
        }
        result
    }

    /// Transactions in `self` but not in `other`.
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (uuid, intervals) in &self.sets {
            let remaining = match other.sets.get(uuid) {
                None => intervals.clone(),
                Some(theirs) => subtract_intervals(intervals, theirs),
            };
            if !remaining.is_empty() {
                result.sets.insert(*uuid, remaining);
            }
        }
        result
    }

    /// Transactions present in both sets.
    pub fn intersect(&self, other: &GtidSet) -> GtidSet {
        let mut result = GtidSet::new();
        for (uuid, intervals) in &self.sets {
            if let Some(theirs) = other.sets.get(uuid) {
                let common = intersect_intervals(intervals, theirs);
                if !common.is_empty() {
                    result.sets.insert(*uuid, common);
                }
            }
        }
        result
    }

    /// Whether every transaction of `other` is contained in `self`.
    pub fn contains_set(&self, other: &GtidSet) -> bool {
        other.subtract(self).is_empty()
    }
}

fn normalize(mut intervals: Vec<GtidInterval>) -> Vec<GtidInterval> {
    intervals.sort_by_key(|i| (i.start, i.end));
    let mut merged: Vec<GtidInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            // Adjacent intervals coalesce: 1-3 and 4-5 become 1-5.
            Some(last) if interval.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

fn subtract_intervals(ours: &[GtidInterval], theirs: &[GtidInterval]) -> Vec<GtidInterval> {
    let mut result = Vec::new();
    for interval in ours {
        let mut pieces = vec![*interval];
        for other in theirs {
            let mut next = Vec::with_capacity(pieces.len() + 1);
            for piece in pieces {
                if other.end < piece.start || other.start > piece.end {
                    next.push(piece);
                    continue;
                }
                if other.start > piece.start {
                    next.push(GtidInterval::new(piece.start, other.start - 1));
                }
                if other.end < piece.end {
                    next.push(GtidInterval::new(other.end + 1, piece.end));
                }
            }
            pieces = next;
        }
        result.extend(pieces);
    }
    normalize(result)
}

fn intersect_intervals(ours: &[GtidInterval], theirs: &[GtidInterval]) -> Vec<GtidInterval> {
    let mut result = Vec::new();
    for a in ours {
        for b in theirs {
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start <= end {
                result.push(GtidInterval::new(start, end));
            }
        }
    }
    normalize(result)
}

impl FromStr for GtidSet {
    type Err = TopologyError;

    /// Parse the textual form `uuid:1-5:7,uuid:10-12`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = GtidSet::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.split(':');
            let uuid_text = parts.next().unwrap_or_default();
            let uuid = Uuid::parse_str(uuid_text).map_err(|_| {
                TopologyError::InvariantViolation(format!("malformed gtid source uuid: {entry:?}"))
            })?;
            let mut any = false;
            for range in parts {
                any = true;
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (parse_txn(entry, a)?, parse_txn(entry, b)?),
                    None => {
                        let single = parse_txn(entry, range)?;
                        (single, single)
                    }
                };
                if start > end {
                    return Err(TopologyError::InvariantViolation(format!(
                        "descending gtid interval: {entry:?}"
                    )));
                }
                set.add(uuid, GtidInterval::new(start, end));
            }
            if !any {
                return Err(TopologyError::InvariantViolation(format!(
                    "gtid entry has no intervals: {entry:?}"
                )));
            }
        }
        Ok(set)
    }
}

fn parse_txn(entry: &str, text: &str) -> Result<u64, TopologyError> {
    text.trim().parse().map_err(|_| {
        TopologyError::InvariantViolation(format!("malformed gtid interval in {entry:?}"))
    })
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, intervals) in &self.sets {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{uuid}")?;
            for interval in intervals {
                if interval.start == interval.end {
                    write!(f, ":{}", interval.start)?;
                } else {
                    write!(f, ":{}-{}", interval.start, interval.end)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const U1: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
    const U2: &str = "6fa7e034-91cb-11e1-ba07-c80aa9429562";

    fn set(s: &str) -> GtidSet {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display_round_trip() {
        let text = format!("{U1}:1-5:7:9-12,{U2}:1-3");
        let parsed = set(&text);
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn test_parse_merges_adjacent() {
        let parsed = set(&format!("{U1}:1-3:4-5:5-9"));
        assert_eq!(parsed.to_string(), format!("{U1}:1-9"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not-a-uuid:1-5".parse::<GtidSet>().is_err());
        assert!(format!("{U1}:5-1").parse::<GtidSet>().is_err());
        assert!(format!("{U1}").parse::<GtidSet>().is_err());
    }

    #[test]
    fn test_empty_parses_empty() {
        assert!(set("").is_empty());
        assert_eq!(set("").cardinality(), 0);
    }

    #[test]
    fn test_subtract_empty_iff_subset() {
        let a = set(&format!("{U1}:1-10"));
        let b = set(&format!("{U1}:1-20,{U2}:1-3"));
        assert!(a.subtract(&b).is_empty());
        assert!(b.contains_set(&a));
        assert!(!a.contains_set(&b));
        assert_eq!(b.subtract(&a).to_string(), format!("{U1}:11-20,{U2}:1-3"));
    }

    #[test]
    fn test_subtract_splits_intervals() {
        let a = set(&format!("{U1}:1-10"));
        let b = set(&format!("{U1}:4-6"));
        assert_eq!(a.subtract(&b).to_string(), format!("{U1}:1-3:7-10"));
    }

    #[test]
    fn test_inclusion_exclusion() {
        let a = set(&format!("{U1}:1-10,{U2}:5-8"));
        let b = set(&format!("{U1}:8-15,{U2}:1-6"));
        let union = a.union(&b);
        let intersection = a.intersect(&b);
        assert_eq!(
            union.cardinality() + intersection.cardinality(),
            a.cardinality() + b.cardinality()
        );
    }

    #[test]
    fn test_shares_source() {
        let a = set(&format!("{U1}:1-10"));
        let b = set(&format!("{U1}:1-2,{U2}:1"));
        let c = set(&format!("{U2}:1-4"));
        assert!(a.shares_source_with(&b));
        assert!(!a.shares_source_with(&c));
    }

    #[test]
    fn test_cardinality() {
        assert_eq!(set(&format!("{U1}:1-5:7")).cardinality(), 6);
    }
}
