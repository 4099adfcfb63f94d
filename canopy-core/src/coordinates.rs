//! Binary log coordinate algebra
//!
//! Coordinates order totally within one server's log stream: first by log
//! file, then by position. Comparison across coordinate kinds (binary vs.
//! relay) is a programming error and panics.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TopologyError};

/// Which log stream a coordinate addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinlogType {
    Binary,
    Relay,
}

/// A position within one server's binary or relay log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogCoordinates {
    pub log_file: String,
    pub log_pos: i64,
    pub kind: BinlogType,
}

impl BinlogCoordinates {
    pub fn binary(log_file: impl Into<String>, log_pos: i64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            kind: BinlogType::Binary,
        }
    }

    pub fn relay(log_file: impl Into<String>, log_pos: i64) -> Self {
        Self {
            log_file: log_file.into(),
            log_pos,
            kind: BinlogType::Relay,
        }
    }

    /// File name with any directory prefix stripped.
    pub fn file_basename(&self) -> &str {
        self.log_file
            .rsplit_once('/')
            .map(|(_, base)| base)
            .unwrap_or(&self.log_file)
    }

    /// Total order within one server.
    ///
    /// Panics if the two coordinates address different log streams; such a
    /// comparison has no meaning and indicates a caller bug.
    pub fn cmp(&self, other: &BinlogCoordinates) -> Ordering {
        assert_eq!(
            self.kind, other.kind,
            "comparing coordinates across log streams: {self} vs {other}"
        );
        self.file_basename()
            .cmp(other.file_basename())
            .then(self.log_pos.cmp(&other.log_pos))
    }

    pub fn equals(&self, other: &BinlogCoordinates) -> bool {
        self.cmp(other) == Ordering::Equal
    }

    pub fn smaller_than(&self, other: &BinlogCoordinates) -> bool {
        self.cmp(other) == Ordering::Less
    }

    pub fn smaller_than_or_equals(&self, other: &BinlogCoordinates) -> bool {
        self.cmp(other) != Ordering::Greater
    }

    /// Coordinates of the start of the next rotated log file.
    ///
    /// `mysql-bin.000123` advances to `mysql-bin.000124`, preserving the
    /// suffix width. Used when a coordinate points past end-of-file.
    pub fn next_file(&self) -> Result<BinlogCoordinates> {
        let (stem, suffix) = self.log_file.rsplit_once('.').ok_or_else(|| {
            TopologyError::InvariantViolation(format!(
                "log file has no numeric suffix: {:?}",
                self.log_file
            ))
        })?;
        let number: u64 = suffix.parse().map_err(|_| {
            TopologyError::InvariantViolation(format!(
                "log file suffix is not numeric: {:?}",
                self.log_file
            ))
        })?;
        let next = format!("{stem}.{:0width$}", number + 1, width = suffix.len());
        Ok(BinlogCoordinates {
            log_file: next,
            log_pos: 0,
            kind: self.kind,
        })
    }
}

impl fmt::Display for BinlogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_within_file() {
        let a = BinlogCoordinates::binary("mysql-bin.000007", 120);
        let b = BinlogCoordinates::binary("mysql-bin.000007", 4096);
        assert!(a.smaller_than(&b));
        assert!(a.smaller_than_or_equals(&b));
        assert!(!b.smaller_than(&a));
        assert!(a.equals(&a.clone()));
    }

    #[test]
    fn test_order_across_files() {
        let a = BinlogCoordinates::binary("mysql-bin.000007", 999_999);
        let b = BinlogCoordinates::binary("mysql-bin.000008", 4);
        assert!(a.smaller_than(&b));
    }

    #[test]
    fn test_order_ignores_directory() {
        let a = BinlogCoordinates::relay("/var/lib/mysql/relay-bin.000002", 100);
        let b = BinlogCoordinates::relay("relay-bin.000002", 100);
        assert!(a.equals(&b));
    }

    #[test]
    #[should_panic(expected = "comparing coordinates across log streams")]
    fn test_cross_kind_comparison_panics() {
        let a = BinlogCoordinates::binary("mysql-bin.000001", 4);
        let b = BinlogCoordinates::relay("relay-bin.000001", 4);
        let _ = a.cmp(&b);
    }

    #[test]
    fn test_next_file() {
        let c = BinlogCoordinates::binary("mysql-bin.000123", 5000);
        let next = c.next_file().unwrap();
        assert_eq!(next.log_file, "mysql-bin.000124");
        assert_eq!(next.log_pos, 0);
        assert!(c.smaller_than(&next));
    }

    #[test]
    fn test_next_file_widens_on_overflow() {
        let c = BinlogCoordinates::binary("mysql-bin.999", 1);
        assert_eq!(c.next_file().unwrap().log_file, "mysql-bin.1000");
    }

    #[test]
    fn test_next_file_rejects_non_numeric() {
        let c = BinlogCoordinates::binary("mysql-bin.current", 1);
        assert!(c.next_file().is_err());
    }
}
