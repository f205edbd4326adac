//! Per-cluster advisory locks
//!
//! Serializes concurrent reconciliation events touching the same cluster.
//! Keys are `(family, viaf_pid)` when a cross-walk is involved, otherwise
//! `(family, source kind, source pid)`. Multi-key acquisition sorts keys
//! first so concurrent merges cannot deadlock.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Advisory lock table
#[derive(Default)]
pub struct ClusterLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire a single cluster lock
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        self.entry(key).lock_owned().await
    }

    /// Acquire several cluster locks in canonical (sorted) order
    pub async fn acquire_many(&self, keys: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.entry(key).lock_owned().await);
        }
        guards
    }
}
