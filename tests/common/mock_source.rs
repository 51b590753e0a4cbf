// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory record source.
//!
//! Holds a growable record list per shard. Fetch failures can be injected to
//! exercise the shard loop's backoff.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use stream_replicator::source::SourceFuture;
use stream_replicator::{Position, Record, RecordSource, SourceError, StartPosition};

#[derive(Default)]
pub struct MemorySource {
    shards: Mutex<BTreeMap<String, Vec<Record>>>,
    fail_fetches: AtomicUsize,
    fetches: AtomicUsize,
    cursors: Mutex<Vec<StartPosition>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the shard if missing and append `records` to it.
    pub fn push(&self, shard_id: &str, records: Vec<Record>) {
        self.shards
            .lock()
            .unwrap()
            .entry(shard_id.to_string())
            .or_default()
            .extend(records);
    }

    /// Fail the next `n` fetches with a transport error.
    pub fn fail_next_fetches(&self, n: usize) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Cursors passed to `fetch`, oldest first.
    pub fn cursors(&self) -> Vec<StartPosition> {
        self.cursors.lock().unwrap().clone()
    }
}

impl RecordSource for MemorySource {
    fn list_shards(&self) -> SourceFuture<'_, Vec<String>> {
        Box::pin(async move { Ok(self.shards.lock().unwrap().keys().cloned().collect()) })
    }

    fn fetch<'a>(&'a self, shard_id: &'a str, start: StartPosition, limit: usize) -> SourceFuture<'a, Vec<Record>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.cursors.lock().unwrap().push(start);
            let failing = self
                .fail_fetches
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(SourceError::Transport("connection reset".into()));
            }

            let shards = self.shards.lock().unwrap();
            let records = shards
                .get(shard_id)
                .ok_or_else(|| SourceError::UnknownShard(shard_id.to_string()))?;
            Ok(records
                .iter()
                .filter(|r| match start {
                    StartPosition::After(p) => r.position > p,
                    StartPosition::TrimHorizon => true,
                    StartPosition::Latest => false,
                })
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn latest_position<'a>(&'a self, shard_id: &'a str) -> SourceFuture<'a, Option<Position>> {
        Box::pin(async move {
            let shards = self.shards.lock().unwrap();
            let records = shards
                .get(shard_id)
                .ok_or_else(|| SourceError::UnknownShard(shard_id.to_string()))?;
            Ok(records.last().map(|r| r.position))
        })
    }
}
