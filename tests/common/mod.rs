// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A scripted sink that records every write call
//! - A recording checkpointer
//! - An in-memory record source
//! - Record helpers

pub mod mock_sink;
pub mod mock_source;

pub use mock_sink::*;
pub use mock_source::*;

use stream_replicator::Record;

/// Records at `positions`, each carrying an 8-byte payload.
#[allow(dead_code)]
pub fn records(positions: std::ops::RangeInclusive<u64>) -> Vec<Record> {
    positions
        .map(|p| Record::new(p.to_be_bytes().to_vec(), format!("pk-{}", p % 4), p))
        .collect()
}
