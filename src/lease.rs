// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shard ownership.
//!
//! At most one worker may process a shard at a time. The replicator only
//! consumes that guarantee through [`LeaseManager`]; it does not implement
//! distributed lease coordination itself.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Boxed future returned by [`LeaseManager`] methods.
pub type LeaseFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Assigns shards to owners.
pub trait LeaseManager: Send + Sync + 'static {
    /// Take the lease for `shard_id` if it is free or already held by `owner`.
    fn assign<'a>(&'a self, shard_id: &'a str, owner: &'a str) -> LeaseFuture<'a, bool>;

    /// Give up the lease. Returns `false` if `owner` did not hold it.
    fn revoke<'a>(&'a self, shard_id: &'a str, owner: &'a str) -> LeaseFuture<'a, bool>;

    /// Check whether `owner` currently holds the lease.
    fn is_owner<'a>(&'a self, shard_id: &'a str, owner: &'a str) -> LeaseFuture<'a, bool>;
}

/// In-process lease table that never rebalances.
///
/// Suitable for a single replicator process and for tests. Leases move only
/// through [`LeaseManager::revoke`] or [`StaticLeaseManager::force_assign`].
#[derive(Debug, Default)]
pub struct StaticLeaseManager {
    owners: RwLock<HashMap<String, String>>,
}

impl StaticLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand the lease to `owner` regardless of the current holder.
    ///
    /// Simulates another worker stealing the shard.
    pub async fn force_assign(&self, shard_id: &str, owner: &str) {
        let previous = self
            .owners
            .write()
            .await
            .insert(shard_id.to_string(), owner.to_string());
        info!(shard_id, owner, previous = ?previous, "Lease force-assigned");
    }

    /// Current holder of a shard.
    pub async fn owner_of(&self, shard_id: &str) -> Option<String> {
        self.owners.read().await.get(shard_id).cloned()
    }

    /// Shards held by `owner`, sorted.
    pub async fn owned_by(&self, owner: &str) -> Vec<String> {
        let mut shards: Vec<String> = self
            .owners
            .read()
            .await
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(s, _)| s.clone())
            .collect();
        shards.sort();
        shards
    }
}

impl LeaseManager for StaticLeaseManager {
    fn assign<'a>(&'a self, shard_id: &'a str, owner: &'a str) -> LeaseFuture<'a, bool> {
        Box::pin(async move {
            let mut owners = self.owners.write().await;
            match owners.get(shard_id) {
                Some(current) if current != owner => {
                    debug!(shard_id, owner, current = %current, "Lease held by another owner");
                    false
                }
                _ => {
                    owners.insert(shard_id.to_string(), owner.to_string());
                    true
                }
            }
        })
    }

    fn revoke<'a>(&'a self, shard_id: &'a str, owner: &'a str) -> LeaseFuture<'a, bool> {
        Box::pin(async move {
            let mut owners = self.owners.write().await;
            if owners.get(shard_id).map(String::as_str) == Some(owner) {
                owners.remove(shard_id);
                true
            } else {
                false
            }
        })
    }

    fn is_owner<'a>(&'a self, shard_id: &'a str, owner: &'a str) -> LeaseFuture<'a, bool> {
        Box::pin(async move { self.owners.read().await.get(shard_id).map(String::as_str) == Some(owner) })
    }
}
