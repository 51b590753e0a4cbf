// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Stream Replicator
//!
//! Copies records from every shard of an input stream to an output stream,
//! one worker per leased shard, with at-least-once delivery.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          stream-replicator                                │
//! │                                                                           │
//! │  ┌──────────────┐    ┌──────────────┐    ┌─────────────────────────────┐  │
//! │  │ RecordSource │───►│ ShardWorker  │───►│ RetryingSink ──► RecordSink │  │
//! │  │ (per shard)  │    │ (BatchBuffer)│    │ (partial + transport retry) │  │
//! │  └──────────────┘    └──────────────┘    └─────────────────────────────┘  │
//! │         ▲                   │                                             │
//! │         │                   ▼                                             │
//! │  ┌──────────────┐    ┌──────────────────────┐                             │
//! │  │ LeaseManager │◄───│ CheckpointStore      │                             │
//! │  │ (ownership)  │    │ (SQLite, per shard)  │                             │
//! │  └──────────────┘    └──────────────────────┘                             │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! 1. **Batching**: records accumulate until a record or byte threshold is hit
//! 2. **Partial retry**: only rejected entries are resubmitted, with backoff
//! 3. **Checkpoint after delivery**: a position is persisted only once every
//!    record up to it has been accepted
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stream_replicator::{
//!     CheckpointStore, ReplicationEngine, ReplicatorConfig, StaticLeaseManager, WorkerFactory,
//! };
//! use std::sync::Arc;
//!
//! let config = ReplicatorConfig::for_testing("orders-replicator");
//! let store = CheckpointStore::open(&config.checkpoint.sqlite_path, &config.app_name).await?;
//! let factory = WorkerFactory::new(Arc::new(my_sink), config.flush_thresholds(), config.retry_config());
//!
//! let mut engine = ReplicationEngine::new(
//!     config,
//!     factory,
//!     Arc::new(my_source),
//!     Arc::new(StaticLeaseManager::new()),
//!     Arc::new(store),
//! );
//! engine.start().await?;
//!
//! // Engine runs until shutdown signal
//! engine.shutdown().await;
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod factory;
pub mod lease;
pub mod metrics;
pub mod record;
pub mod resilience;
pub mod sink;
pub mod source;
pub mod worker;

// Re-exports for convenience
pub use batch::{Batch, BatchBuffer, FlushThresholds};
pub use checkpoint::{CheckpointCoordinator, CheckpointError, CheckpointStore, Checkpointer, StoreCheckpointer};
pub use config::{CheckpointConfig, InputConfig, OutputConfig, ReplicatorConfig, RetrySettings};
pub use coordinator::{EngineState, HealthCheck, ReplicationEngine, ShardHealth};
pub use error::{ReplicatorError, Result};
pub use factory::WorkerFactory;
pub use lease::{LeaseManager, StaticLeaseManager};
pub use record::{Position, Record};
pub use resilience::{RetryConfig, Sleeper, TokioSleeper};
pub use sink::{EntryOutcome, RecordSink, RetryingSink, SendOutcome, TransportError};
pub use source::{InitialPosition, RecordSource, SourceError, StartPosition};
pub use worker::{ProcessReport, ShardWorker, ShutdownHandle, ShutdownReason, WorkerState};
