// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Input stream integration.
//!
//! [`RecordSource`] lists the shards of the input stream and reads records
//! from one of them starting at a [`StartPosition`]. The shard loop keeps the
//! read cursor; the source itself is stateless from the replicator's view.
//!
//! A `LATEST` start is pinned once, before the first fetch, to the shard's
//! tip as reported by [`RecordSource::latest_position`]. From then on the
//! cursor is always a concrete position (or `TRIM_HORIZON` for a shard that
//! was empty at the time).

use crate::record::{Position, Record};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Fetching from the input stream failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The shard does not exist (or no longer exists).
    #[error("unknown shard: {0}")]
    UnknownShard(String),

    /// Network or service error; the fetch can be retried.
    #[error("{0}")]
    Transport(String),
}

/// Boxed future returned by [`RecordSource`] methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = std::result::Result<T, SourceError>> + Send + 'a>>;

/// Where the first fetch of a shard starts when there is no checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitialPosition {
    /// Only records written after the worker starts.
    #[default]
    Latest,
    /// The oldest record still retained.
    TrimHorizon,
}

/// Read cursor handed to [`RecordSource::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Strictly after the given position.
    After(Position),
    TrimHorizon,
    /// The shard tip. Pinned by [`StartPosition::pin_latest`] before any fetch.
    Latest,
}

impl StartPosition {
    /// Replace `Latest` with a concrete cursor given the shard tip.
    ///
    /// An empty shard (`tip == None`) starts from the trim horizon, which then
    /// holds only records written after this point.
    pub fn pin_latest(self, tip: Option<Position>) -> Self {
        match self {
            StartPosition::Latest => tip.map_or(StartPosition::TrimHorizon, StartPosition::After),
            other => other,
        }
    }
}

impl From<InitialPosition> for StartPosition {
    fn from(initial: InitialPosition) -> Self {
        match initial {
            InitialPosition::Latest => StartPosition::Latest,
            InitialPosition::TrimHorizon => StartPosition::TrimHorizon,
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartPosition::After(pos) => write!(f, "after {}", pos),
            StartPosition::TrimHorizon => write!(f, "TRIM_HORIZON"),
            StartPosition::Latest => write!(f, "LATEST"),
        }
    }
}

/// What we need from the input stream.
pub trait RecordSource: Send + Sync + 'static {
    /// Shard ids of the input stream.
    fn list_shards(&self) -> SourceFuture<'_, Vec<String>>;

    /// Read up to `limit` records of `shard_id` from `start`, in position order.
    ///
    /// An empty result means the shard has no new records yet.
    fn fetch<'a>(&'a self, shard_id: &'a str, start: StartPosition, limit: usize) -> SourceFuture<'a, Vec<Record>>;

    /// Position of the newest record currently in the shard, `None` if it is empty.
    fn latest_position<'a>(&'a self, shard_id: &'a str) -> SourceFuture<'a, Option<Position>>;
}
