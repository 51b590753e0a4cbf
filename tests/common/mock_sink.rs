// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scripted sink and recording checkpointer.
//!
//! The sink answers each write call from a script and falls back to
//! accepting everything once the script runs out. Every call and every
//! accepted position is recorded for assertions.

#![allow(dead_code)]

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use stream_replicator::checkpoint::CheckpointFuture;
use stream_replicator::sink::BoxFuture;
use stream_replicator::{CheckpointError, Checkpointer, EntryOutcome, Position, Record, RecordSink, TransportError};

/// One scripted answer to a write call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Accept every entry.
    Accept,
    /// Reject the entries at these indices of the submitted slice.
    Reject(Vec<usize>),
    /// Fail the whole call.
    Transport(String),
    /// Answer with this many outcomes regardless of the request size.
    Short(usize),
    /// Never answer.
    Hang,
}

/// Sink that follows a script of replies.
///
/// # Example
/// ```rust,ignore
/// let sink = ScriptedSink::with_script(vec![Reply::Reject(vec![1, 3]), Reply::Accept]);
///
/// // Use in tests...
///
/// assert_eq!(sink.call_sizes(), vec![4, 2]);
/// ```
#[derive(Default)]
pub struct ScriptedSink {
    script: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Vec<Position>>>,
    accepted: Mutex<Vec<Position>>,
}

impl ScriptedSink {
    /// Sink that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<Reply>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// Append a reply to the script.
    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    /// Positions submitted by each write call, in call order.
    pub fn calls(&self) -> Vec<Vec<Position>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_sizes(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Every accepted position, in acceptance order.
    pub fn accepted(&self) -> Vec<Position> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn accepted_set(&self) -> BTreeSet<Position> {
        self.accepted.lock().unwrap().iter().copied().collect()
    }
}

impl RecordSink for ScriptedSink {
    fn write_batch<'a>(&'a self, records: &'a [Record]) -> BoxFuture<'a, Vec<EntryOutcome>> {
        let positions: Vec<Position> = records.iter().map(|r| r.position).collect();
        self.calls.lock().unwrap().push(positions.clone());
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Accept);

        Box::pin(async move {
            let outcomes = match reply {
                Reply::Accept => vec![EntryOutcome::Accepted; records.len()],
                Reply::Reject(indices) => (0..records.len())
                    .map(|i| {
                        if indices.contains(&i) {
                            EntryOutcome::rejected("ProvisionedThroughputExceededException", "slow down")
                        } else {
                            EntryOutcome::Accepted
                        }
                    })
                    .collect(),
                Reply::Transport(message) => return Err(TransportError(message)),
                Reply::Short(n) => return Ok(vec![EntryOutcome::Accepted; n]),
                Reply::Hang => std::future::pending().await,
            };

            let mut accepted = self.accepted.lock().unwrap();
            for (position, outcome) in positions.iter().zip(&outcomes) {
                if outcome.is_accepted() {
                    accepted.push(*position);
                }
            }
            Ok(outcomes)
        })
    }
}

/// Checkpointer that records every position it is asked to persist.
///
/// When built with [`RecordingCheckpointer::watching`], it also captures what
/// the sink had accepted at the moment of each checkpoint.
#[derive(Default)]
pub struct RecordingCheckpointer {
    written: Mutex<Vec<Position>>,
    refuse: Mutex<Option<CheckpointError>>,
    sink: Option<Arc<ScriptedSink>>,
    accepted_at_checkpoint: Mutex<Vec<(Position, BTreeSet<Position>)>>,
}

impl RecordingCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watching(sink: Arc<ScriptedSink>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    /// Refuse every checkpoint from now on.
    pub fn refuse_with(&self, error: CheckpointError) {
        *self.refuse.lock().unwrap() = Some(error);
    }

    pub fn written(&self) -> Vec<Position> {
        self.written.lock().unwrap().clone()
    }

    /// Each checkpoint with the positions accepted downstream before it.
    pub fn accepted_at_checkpoint(&self) -> Vec<(Position, BTreeSet<Position>)> {
        self.accepted_at_checkpoint.lock().unwrap().clone()
    }
}

impl Checkpointer for RecordingCheckpointer {
    fn checkpoint(&self, position: Position) -> CheckpointFuture<'_> {
        Box::pin(async move {
            if let Some(e) = self.refuse.lock().unwrap().clone() {
                return Err(e);
            }
            if let Some(sink) = &self.sink {
                self.accepted_at_checkpoint
                    .lock()
                    .unwrap()
                    .push((position, sink.accepted_set()));
            }
            self.written.lock().unwrap().push(position);
            Ok(())
        })
    }
}
