// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-shard record buffer.
//!
//! Collects records in arrival order and reports when the batch has reached
//! either flush threshold. The buffer is owned by exactly one worker and is
//! emptied only by [`BatchBuffer::drain`], which hands the accumulated records
//! over as an immutable [`Batch`].
//!
//! # Design
//!
//! ```text
//! on_records ──▶ append ──▶ should_flush? ──yes──▶ drain ──▶ Batch ──▶ RetryingSink
//!                  │              │
//!                  │              no
//!                  ▼              ▼
//!           count += 1      keep accumulating
//!           bytes += len
//! ```

use crate::record::{Position, Record};

/// Default record ceiling: the downstream per-request record limit.
pub const DEFAULT_MAX_RECORDS: usize = 500;

/// Default byte ceiling: 4 MiB, below the 5 MiB per-request payload limit.
pub const DEFAULT_MAX_BYTES: usize = 4 * 1024 * 1024;

/// Flush thresholds, fixed for the lifetime of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushThresholds {
    /// Flush once this many records are buffered.
    pub max_records: usize,
    /// Flush once the buffered payloads reach this many bytes.
    pub max_bytes: usize,
}

impl Default for FlushThresholds {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl FlushThresholds {
    pub fn new(max_records: usize, max_bytes: usize) -> Self {
        Self {
            max_records,
            max_bytes,
        }
    }

    /// Small thresholds for testing.
    pub fn testing() -> Self {
        Self {
            max_records: 3,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Records drained from a buffer, ready to be written downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    shard_id: String,
    records: Vec<Record>,
    bytes: usize,
}

impl Batch {
    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total payload bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Position to checkpoint once the whole batch is delivered.
    pub fn last_position(&self) -> Option<Position> {
        self.records.last().map(|r| r.position)
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// Accumulates records for a single shard.
#[derive(Debug)]
pub struct BatchBuffer {
    shard_id: String,
    records: Vec<Record>,
    byte_count: usize,
    thresholds: FlushThresholds,
}

impl BatchBuffer {
    /// Create an empty buffer.
    pub fn new(shard_id: impl Into<String>, thresholds: FlushThresholds) -> Self {
        Self {
            shard_id: shard_id.into(),
            records: Vec::new(),
            byte_count: 0,
            thresholds,
        }
    }

    /// Add a record to the end of the batch.
    pub fn append(&mut self, record: Record) {
        self.byte_count += record.size_bytes();
        self.records.push(record);
    }

    /// Check if either threshold has been reached.
    pub fn should_flush(&self) -> bool {
        self.records.len() >= self.thresholds.max_records
            || self.byte_count >= self.thresholds.max_bytes
    }

    /// Take the accumulated records and reset the counters.
    pub fn drain(&mut self) -> Batch {
        let bytes = std::mem::take(&mut self.byte_count);
        Batch {
            shard_id: self.shard_id.clone(),
            records: std::mem::take(&mut self.records),
            bytes,
        }
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Buffered payload bytes.
    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn thresholds(&self) -> FlushThresholds {
        self.thresholds
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }
}
