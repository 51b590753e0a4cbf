// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Records read from the input stream.
//!
//! A [`Record`] is immutable once read: opaque payload bytes, the partition
//! key used to route it downstream, and its [`Position`] within the shard it
//! was read from. Positions are strictly increasing per shard, which is what
//! makes "checkpoint at the last record of a delivered batch" meaningful.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Position of a record within its shard.
///
/// Totally ordered; a later record always has a greater position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(pub u64);

impl Position {
    /// Raw numeric value.
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Position {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Position)
    }
}

impl From<u64> for Position {
    fn from(value: u64) -> Self {
        Position(value)
    }
}

/// A single record relayed from the input shard to the output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Opaque payload.
    pub data: Vec<u8>,
    /// Partition key, forwarded unchanged to the sink.
    pub partition_key: String,
    /// Position within the source shard.
    pub position: Position,
}

impl Record {
    pub fn new(data: impl Into<Vec<u8>>, partition_key: impl Into<String>, position: impl Into<Position>) -> Self {
        Self {
            data: data.into(),
            partition_key: partition_key.into(),
            position: position.into(),
        }
    }

    /// Payload size counted against the byte flush threshold.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        assert!(Position(1) < Position(2));
        assert_eq!(Position(7).max(Position(3)), Position(7));
    }

    #[test]
    fn test_position_parse_and_display() {
        let pos: Position = "18446744073709551615".parse().unwrap();
        assert_eq!(pos, Position(u64::MAX));
        assert_eq!(Position(12345).to_string(), "12345");
        assert_eq!(" 42 ".parse::<Position>().unwrap(), Position(42));
        assert!("not-a-number".parse::<Position>().is_err());
        assert!("-1".parse::<Position>().is_err());
    }

    #[test]
    fn test_record_size_counts_payload_only() {
        let record = Record::new(b"hello".to_vec(), "a-rather-long-partition-key", 1);
        assert_eq!(record.size_bytes(), 5);
        assert_eq!(record.position, Position(1));
    }

    #[test]
    fn test_position_serde_transparent() {
        let json = serde_json::to_string(&Position(99)).unwrap();
        assert_eq!(json, "99");
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Position(99));
    }
}
