//! In-memory index implementation
//!
//! DashMap-backed mirror used by tests, dry runs and single-node
//! deployments without an external search engine.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use super::{IndexOp, SecondaryIndex};
use crate::types::{EntityKind, Result};

/// DashMap-backed secondary index
#[derive(Default)]
pub struct MemoryIndex {
    documents: DashMap<(EntityKind, String), Value>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecondaryIndex for MemoryIndex {
    async fn upsert(&self, kind: EntityKind, pid: &str, document: Value) -> Result<()> {
        self.documents.insert((kind, pid.to_string()), document);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, pid: &str) -> Result<()> {
        self.documents.remove(&(kind, pid.to_string()));
        Ok(())
    }

    async fn bulk(&self, ops: Vec<IndexOp>) -> Result<()> {
        for op in ops {
            match op {
                IndexOp::Upsert {
                    kind,
                    pid,
                    document,
                } => {
                    self.documents.insert((kind, pid), document);
                }
                IndexOp::Delete { kind, pid } => {
                    self.documents.remove(&(kind, pid));
                }
            }
        }
        Ok(())
    }

    async fn refresh(&self, _kind: EntityKind) -> Result<()> {
        // Writes are immediately visible
        Ok(())
    }

    async fn count(&self, kind: EntityKind) -> Result<usize> {
        Ok(self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .count())
    }

    async fn ids(&self, kind: EntityKind) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == kind)
            .map(|entry| entry.key().1.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn get(&self, kind: EntityKind, pid: &str) -> Result<Option<Value>> {
        Ok(self
            .documents
            .get(&(kind, pid.to_string()))
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_delete_count() {
        let index = MemoryIndex::new();
        index
            .upsert(EntityKind::AgentMef, "1", json!({"pid": "1"}))
            .await
            .unwrap();
        index
            .upsert(EntityKind::AgentMef, "2", json!({"pid": "2"}))
            .await
            .unwrap();
        index
            .upsert(EntityKind::AgentGnd, "g1", json!({"pid": "g1"}))
            .await
            .unwrap();

        assert_eq!(index.count(EntityKind::AgentMef).await.unwrap(), 2);
        assert_eq!(index.ids(EntityKind::AgentMef).await.unwrap(), vec!["1", "2"]);

        index.delete(EntityKind::AgentMef, "1").await.unwrap();
        assert_eq!(index.count(EntityKind::AgentMef).await.unwrap(), 1);
        assert!(index.get(EntityKind::AgentMef, "1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk() {
        let index = MemoryIndex::new();
        index
            .bulk(vec![
                IndexOp::Upsert {
                    kind: EntityKind::PlaceMef,
                    pid: "1".into(),
                    document: json!({"pid": "1"}),
                },
                IndexOp::Upsert {
                    kind: EntityKind::PlaceMef,
                    pid: "2".into(),
                    document: json!({"pid": "2"}),
                },
                IndexOp::Delete {
                    kind: EntityKind::PlaceMef,
                    pid: "1".into(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(index.ids(EntityKind::PlaceMef).await.unwrap(), vec!["2"]);
    }
}
