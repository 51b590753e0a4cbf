// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable checkpoint storage.
//!
//! Stores the last delivered position for each shard in SQLite, namespaced by
//! application name so several replicators can share one database file.
//!
//! # Write-Through
//!
//! A checkpoint must be on disk before the worker moves on: `put()` returns
//! only after the row is written. The in-memory cache serves reads and
//! enforces monotonic positions.
//!
//! Writes are serialized per shard. The cache lock is never held across a
//! SQLite round trip, so one slow shard leaves the others alone.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with bounded exponential backoff before the
//! error is surfaced.
//!
//! Positions are stored as decimal TEXT so the full `u64` range survives.

use super::{CheckpointError, CheckpointFuture, Checkpointer};
use crate::error::{ReplicatorError, Result};
use crate::lease::LeaseManager;
use crate::record::Position;
use crate::resilience::is_signalled;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_busy_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Stored checkpoint for one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    pub shard_id: String,
    /// Last delivered position.
    pub position: Position,
    /// Worker that wrote it.
    pub owner: String,
    /// Unix millis of the write.
    pub updated_at: i64,
}

/// Persistent checkpoint storage backed by SQLite.
pub struct CheckpointStore {
    pool: SqlitePool,
    app_name: String,
    cache: RwLock<HashMap<String, CheckpointEntry>>,
    shard_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    path: String,
}

impl CheckpointStore {
    /// Open (or create) the store at `path` for `app_name`.
    ///
    /// `":memory:"` opens a private in-memory database.
    pub async fn open(path: impl AsRef<Path>, app_name: impl Into<String>) -> Result<Self> {
        let app_name = app_name.into();
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, app_name = %app_name, "Opening checkpoint store");

        let pool = if path_str == IN_MEMORY {
            let options = SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| ReplicatorError::Config(format!("Invalid SQLite path: {}", e)))?;
            // Every connection to :memory: is its own database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
                .map_err(|e| ReplicatorError::Config(format!("Invalid SQLite path: {}", e)))?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Full)
                .create_if_missing(true);
            SqlitePoolOptions::new().max_connections(2).connect_with(options).await?
        };

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                app_name TEXT NOT NULL,
                shard_id TEXT NOT NULL,
                position TEXT NOT NULL,
                owner TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (app_name, shard_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, String, i64)> = sqlx::query_as(
            "SELECT shard_id, position, owner, updated_at FROM checkpoints WHERE app_name = ?",
        )
        .bind(&app_name)
        .fetch_all(&pool)
        .await?;

        let mut cache = HashMap::new();
        for (shard_id, position, owner, updated_at) in rows {
            match position.parse::<Position>() {
                Ok(position) => {
                    debug!(shard_id = %shard_id, position = %position, "Loaded checkpoint from disk");
                    cache.insert(
                        shard_id.clone(),
                        CheckpointEntry {
                            shard_id,
                            position,
                            owner,
                            updated_at,
                        },
                    );
                }
                Err(e) => {
                    warn!(shard_id = %shard_id, raw = %position, error = %e, "Ignoring unparseable checkpoint row");
                }
            }
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored checkpoints from previous run");
        }

        Ok(Self {
            pool,
            app_name,
            cache: RwLock::new(cache),
            shard_locks: Mutex::new(HashMap::new()),
            path: path_str,
        })
    }

    async fn shard_lock(&self, shard_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.shard_locks.lock().await;
        Arc::clone(locks.entry(shard_id.to_string()).or_default())
    }

    /// Last checkpointed position for a shard.
    pub async fn get(&self, shard_id: &str) -> Option<Position> {
        self.cache.read().await.get(shard_id).map(|e| e.position)
    }

    /// Full stored entry for a shard.
    pub async fn entry(&self, shard_id: &str) -> Option<CheckpointEntry> {
        self.cache.read().await.get(shard_id).cloned()
    }

    /// Persist a checkpoint (write-through).
    ///
    /// Returns `Ok(false)` without writing when `position` is not past the
    /// stored one.
    pub async fn put(&self, shard_id: &str, position: Position, owner: &str) -> Result<bool> {
        let lock = self.shard_lock(shard_id).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.cache.read().await.get(shard_id) {
            if position <= existing.position {
                debug!(
                    shard_id,
                    position = %position,
                    stored = %existing.position,
                    "Refusing to move checkpoint backward"
                );
                return Ok(false);
            }
        }

        let now = chrono::Utc::now().timestamp_millis();
        let pool = &self.pool;
        let app_name = self.app_name.as_str();
        let position_text = position.to_string();

        execute_with_retry("put", || async {
            sqlx::query(
                r#"
                INSERT INTO checkpoints (app_name, shard_id, position, owner, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(app_name, shard_id) DO UPDATE SET
                    position = excluded.position,
                    owner = excluded.owner,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(app_name)
            .bind(shard_id)
            .bind(&position_text)
            .bind(owner)
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        self.cache.write().await.insert(
            shard_id.to_string(),
            CheckpointEntry {
                shard_id: shard_id.to_string(),
                position,
                owner: owner.to_string(),
                updated_at: now,
            },
        );
        debug!(shard_id, position = %position, owner, "Checkpoint persisted");
        Ok(true)
    }

    /// Remove a shard's checkpoint (e.g. the shard was closed upstream).
    pub async fn delete(&self, shard_id: &str) -> Result<()> {
        let lock = self.shard_lock(shard_id).await;
        let _guard = lock.lock().await;
        let pool = &self.pool;
        let app_name = self.app_name.as_str();

        execute_with_retry("delete", || async {
            sqlx::query("DELETE FROM checkpoints WHERE app_name = ? AND shard_id = ?")
                .bind(app_name)
                .bind(shard_id)
                .execute(pool)
                .await
        })
        .await?;

        self.cache.write().await.remove(shard_id);
        info!(shard_id, "Deleted checkpoint");
        Ok(())
    }

    /// All checkpoints for this application.
    pub async fn get_all(&self) -> HashMap<String, Position> {
        self.cache
            .read()
            .await
            .iter()
            .map(|(shard, entry)| (shard.clone(), entry.position))
            .collect()
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn flush_wal(&self) -> Result<()> {
        if self.path == IN_MEMORY {
            return Ok(());
        }
        let pool = &self.pool;

        execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Close the connection pool gracefully.
    pub async fn close(&self) {
        if let Err(e) = self.flush_wal().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Checkpoint store closed");
    }
}

// =============================================================================
// Store-backed Checkpointer
// =============================================================================

/// Checkpoint handle for one shard, bound to the lease of its owner.
///
/// Refuses with [`CheckpointError::ShuttingDown`] once shutdown is signalled
/// and with [`CheckpointError::InvalidState`] when the lease has moved.
pub struct StoreCheckpointer<L: LeaseManager + ?Sized> {
    store: Arc<CheckpointStore>,
    leases: Arc<L>,
    shard_id: String,
    owner: String,
    shutdown: watch::Receiver<bool>,
}

impl<L: LeaseManager + ?Sized> StoreCheckpointer<L> {
    pub fn new(
        store: Arc<CheckpointStore>,
        leases: Arc<L>,
        shard_id: impl Into<String>,
        owner: impl Into<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            leases,
            shard_id: shard_id.into(),
            owner: owner.into(),
            shutdown,
        }
    }
}

impl<L: LeaseManager + ?Sized> Checkpointer for StoreCheckpointer<L> {
    fn checkpoint(&self, position: Position) -> CheckpointFuture<'_> {
        Box::pin(async move {
            if is_signalled(&self.shutdown) {
                return Err(CheckpointError::ShuttingDown);
            }
            if !self.leases.is_owner(&self.shard_id, &self.owner).await {
                return Err(CheckpointError::InvalidState(format!(
                    "{} is not held by {}",
                    self.shard_id, self.owner
                )));
            }
            self.store
                .put(&self.shard_id, position, &self.owner)
                .await
                .map(|_| ())
                .map_err(|e| CheckpointError::Store(e.to_string()))
        })
    }
}
