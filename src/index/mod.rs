//! Secondary index adapter
//!
//! Mirrors the primary store into an external search index keyed by
//! `(kind, pid)`. The index is eventually consistent; correctness-bearing
//! reads always go to the primary store.

pub mod document;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::types::{EntityKind, Result};

pub use document::{mef_document, source_document, viaf_document};
pub use memory::MemoryIndex;

/// One bulk operation
#[derive(Debug, Clone)]
pub enum IndexOp {
    Upsert {
        kind: EntityKind,
        pid: String,
        document: Value,
    },
    Delete {
        kind: EntityKind,
        pid: String,
    },
}

/// Seam to the search index
#[async_trait]
pub trait SecondaryIndex: Send + Sync {
    async fn upsert(&self, kind: EntityKind, pid: &str, document: Value) -> Result<()>;

    async fn delete(&self, kind: EntityKind, pid: &str) -> Result<()>;

    async fn bulk(&self, ops: Vec<IndexOp>) -> Result<()>;

    /// Make pending writes visible to searches
    async fn refresh(&self, kind: EntityKind) -> Result<()>;

    /// Number of documents of a kind (monitoring)
    async fn count(&self, kind: EntityKind) -> Result<usize>;

    /// Document ids of a kind (monitoring)
    async fn ids(&self, kind: EntityKind) -> Result<Vec<String>>;

    /// Fetch a single document (monitoring, dashboards)
    async fn get(&self, kind: EntityKind, pid: &str) -> Result<Option<Value>>;
}
