//! MEF cluster store
//!
//! The unified record per real-world entity. Clusters are owned by the
//! reconciliation engine; their lifecycle is entirely derived from source
//! and VIAF mutations.

use std::collections::HashSet;

use rusqlite::{params, Connection, Row};
use tracing::debug;

use super::{source, RecordMeta, RelationType};
use crate::db::optional;
use crate::pid;
use crate::types::{
    now_rfc3339, EntityKind, Family, MefError, Result, SourceName, MAX_REDIRECT_DEPTH,
};

/// A MEF cluster row
#[derive(Debug, Clone)]
pub struct MefCluster {
    pub family: Family,
    pub pid: String,
    pub viaf_pid: Option<String>,
    pub gnd_pid: Option<String>,
    pub idref_pid: Option<String>,
    pub rero_pid: Option<String>,
    pub record_type: Option<String>,
    pub deleted: Option<String>,
    pub meta: RecordMeta,
}

impl MefCluster {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let family_str: String = row.get("family")?;
        let family = match family_str.as_str() {
            "agent" => Family::Agent,
            "concept" => Family::Concept,
            "place" => Family::Place,
            _ => {
                return Err(rusqlite::Error::InvalidColumnType(
                    0,
                    "family".into(),
                    rusqlite::types::Type::Text,
                ))
            }
        };
        Ok(Self {
            family,
            pid: row.get("pid")?,
            viaf_pid: row.get("viaf_pid")?,
            gnd_pid: row.get("gnd_pid")?,
            idref_pid: row.get("idref_pid")?,
            rero_pid: row.get("rero_pid")?,
            record_type: row.get("record_type")?,
            deleted: row.get("deleted")?,
            meta: RecordMeta::from_row(row)?,
        })
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    pub fn source_ref(&self, source: SourceName) -> Option<&str> {
        match source {
            SourceName::Gnd => self.gnd_pid.as_deref(),
            SourceName::Idref => self.idref_pid.as_deref(),
            SourceName::Rero => self.rero_pid.as_deref(),
        }
    }

    pub fn set_source_ref(&mut self, source: SourceName, value: Option<String>) {
        match source {
            SourceName::Gnd => self.gnd_pid = value,
            SourceName::Idref => self.idref_pid = value,
            SourceName::Rero => self.rero_pid = value,
        }
    }

    /// Source references present on the cluster, in family priority order
    pub fn source_refs(&self) -> Vec<(SourceName, String)> {
        self.family
            .sources()
            .iter()
            .filter_map(|s| self.source_ref(*s).map(|p| (*s, p.to_string())))
            .collect()
    }

    pub fn has_source_refs(&self) -> bool {
        !self.source_refs().is_empty()
    }

    /// Numeric pid for stable ordering; minted values are always numeric
    pub fn pid_number(&self) -> u64 {
        self.pid.parse().unwrap_or(u64::MAX)
    }
}

const SELECT: &str = "SELECT family, pid, uuid, viaf_pid, gnd_pid, idref_pid, rero_pid, \
                      record_type, deleted, created, updated, version FROM mef_clusters";

/// Mint a pid and insert an empty cluster
pub fn create(conn: &Connection, family: Family) -> Result<MefCluster> {
    let minted = pid::mint(conn, family)?;
    let meta = RecordMeta::new();
    conn.execute(
        "INSERT INTO mef_clusters
         (family, pid, uuid, viaf_pid, gnd_pid, idref_pid, rero_pid, record_type,
          deleted, created, updated, version)
         VALUES (?, ?, ?, NULL, NULL, NULL, NULL, NULL, NULL, ?, ?, 1)",
        params![family.as_str(), minted, meta.uuid, meta.created, meta.updated],
    )?;
    debug!(family = %family, pid = %minted, "Created MEF cluster");
    Ok(MefCluster {
        family,
        pid: minted,
        viaf_pid: None,
        gnd_pid: None,
        idref_pid: None,
        rero_pid: None,
        record_type: None,
        deleted: None,
        meta,
    })
}

/// Persist cluster mutations, bumping version and updated
pub fn save(conn: &Connection, cluster: &mut MefCluster) -> Result<()> {
    cluster.meta.updated = now_rfc3339();
    cluster.meta.version += 1;
    let changed = conn.execute(
        "UPDATE mef_clusters
         SET viaf_pid = ?, gnd_pid = ?, idref_pid = ?, rero_pid = ?, record_type = ?,
             deleted = ?, updated = ?, version = ?
         WHERE family = ? AND pid = ?",
        params![
            cluster.viaf_pid,
            cluster.gnd_pid,
            cluster.idref_pid,
            cluster.rero_pid,
            cluster.record_type,
            cluster.deleted,
            cluster.meta.updated,
            cluster.meta.version,
            cluster.family.as_str(),
            cluster.pid
        ],
    )?;
    if changed == 0 {
        return Err(MefError::NotFound(format!(
            "MEF cluster {} {} does not exist",
            cluster.family, cluster.pid
        )));
    }
    Ok(())
}

/// Set the deletion timestamp on a cluster
pub fn mark_deleted(conn: &Connection, family: Family, cluster_pid: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE mef_clusters SET deleted = ?, updated = ?, version = version + 1
         WHERE family = ? AND pid = ? AND deleted IS NULL",
        params![
            now_rfc3339(),
            now_rfc3339(),
            family.as_str(),
            cluster_pid
        ],
    )?;
    Ok(changed > 0)
}

/// Get a cluster by pid, deleted or not
pub fn get(conn: &Connection, family: Family, cluster_pid: &str) -> Result<Option<MefCluster>> {
    let mut stmt = conn.prepare(&format!("{} WHERE family = ? AND pid = ?", SELECT))?;
    optional(stmt.query_row(params![family.as_str(), cluster_pid], MefCluster::from_row))
}

/// Live clusters referencing `(source, source_pid)`, most recently updated
/// first. More than one is an invariant violation the engine repairs.
pub fn get_by_source(
    conn: &Connection,
    family: Family,
    source: SourceName,
    source_pid: &str,
) -> Result<Vec<MefCluster>> {
    let column = match source {
        SourceName::Gnd => "gnd_pid",
        SourceName::Idref => "idref_pid",
        SourceName::Rero => "rero_pid",
    };
    let mut stmt = conn.prepare(&format!(
        "{} WHERE family = ? AND {} = ? AND deleted IS NULL ORDER BY updated DESC, pid",
        SELECT, column
    ))?;
    let rows = stmt
        .query_map(params![family.as_str(), source_pid], MefCluster::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Live clusters carrying `viaf_pid`, lowest pid first.
/// More than one means a pending merge.
pub fn get_by_viaf(conn: &Connection, viaf_pid: &str) -> Result<Vec<MefCluster>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE family = 'agent' AND viaf_pid = ? AND deleted IS NULL
         ORDER BY CAST(pid AS INTEGER)",
        SELECT
    ))?;
    let rows = stmt
        .query_map(params![viaf_pid], MefCluster::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// All clusters of a family ordered by pid
pub fn iterate(conn: &Connection, family: Family, live_only: bool) -> Result<Vec<MefCluster>> {
    let sql = if live_only {
        format!(
            "{} WHERE family = ? AND deleted IS NULL ORDER BY CAST(pid AS INTEGER)",
            SELECT
        )
    } else {
        format!("{} WHERE family = ? ORDER BY CAST(pid AS INTEGER)", SELECT)
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![family.as_str()], MefCluster::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Count clusters of a family
pub fn count(conn: &Connection, family: Family, live_only: bool) -> Result<i64> {
    let sql = if live_only {
        "SELECT COUNT(*) FROM mef_clusters WHERE family = ? AND deleted IS NULL"
    } else {
        "SELECT COUNT(*) FROM mef_clusters WHERE family = ?"
    };
    Ok(conn.query_row(sql, params![family.as_str()], |row| row.get(0))?)
}

/// Count live clusters carrying a reference to `source`
pub fn count_with_source(conn: &Connection, family: Family, source: SourceName) -> Result<i64> {
    let column = match source {
        SourceName::Gnd => "gnd_pid",
        SourceName::Idref => "idref_pid",
        SourceName::Rero => "rero_pid",
    };
    let sql = format!(
        "SELECT COUNT(*) FROM mef_clusters
         WHERE family = ? AND {} IS NOT NULL AND deleted IS NULL",
        column
    );
    Ok(conn.query_row(&sql, params![family.as_str()], |row| row.get(0))?)
}

/// The most recent live cluster for a source pid, chasing the source's own
/// redirect declarations.
///
/// Follows `redirect_to` forward; for IDREF additionally follows successor
/// records declaring `redirect_from` this pid. Terminates on fixed point,
/// unknown pid or cycle.
pub fn latest(conn: &Connection, kind: EntityKind, source_pid: &str) -> Result<Option<MefCluster>> {
    let source = kind.source().ok_or_else(|| {
        MefError::Internal(format!("latest() takes a source kind, got {}", kind))
    })?;

    let mut visited: HashSet<String> = HashSet::new();
    let mut current = source_pid.to_string();

    for _ in 0..=MAX_REDIRECT_DEPTH {
        if !visited.insert(current.clone()) {
            break;
        }
        let mut next: Option<String> = None;
        if let Some(record) = source::get(conn, kind, &current)? {
            if let Some(rel) = &record.relation_pid {
                if rel.relation == RelationType::RedirectTo {
                    next = Some(rel.value.clone());
                }
            }
        }
        if next.is_none() {
            next = source::find_redirect_from(conn, kind, &current)?;
        }
        match next {
            Some(n) if !visited.contains(&n) => current = n,
            _ => break,
        }
    }

    let clusters = get_by_source(conn, kind.family(), source, &current)?;
    Ok(clusters.into_iter().next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::records::RelationPid;
    use serde_json::json;

    async fn test_db() -> Db {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_create_and_save() {
        let db = test_db().await;
        db.read(|conn| {
            let mut cluster = create(conn, Family::Agent)?;
            assert_eq!(cluster.pid, "1");

            cluster.gnd_pid = Some("g1".into());
            cluster.record_type = Some("bf:Person".into());
            save(conn, &mut cluster)?;

            let stored = get(conn, Family::Agent, "1")?.unwrap();
            assert_eq!(stored.gnd_pid, Some("g1".to_string()));
            assert_eq!(stored.meta.version, 2);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_get_by_source_and_viaf() {
        let db = test_db().await;
        db.read(|conn| {
            let mut cluster = create(conn, Family::Agent)?;
            cluster.viaf_pid = Some("v1".into());
            cluster.idref_pid = Some("i1".into());
            save(conn, &mut cluster)?;

            let by_source = get_by_source(conn, Family::Agent, SourceName::Idref, "i1")?;
            assert_eq!(by_source.len(), 1);
            let by_viaf = get_by_viaf(conn, "v1")?;
            assert_eq!(by_viaf.len(), 1);
            assert_eq!(by_viaf[0].pid, cluster.pid);

            // Deleted clusters do not count as owners
            cluster.deleted = Some(now_rfc3339());
            save(conn, &mut cluster)?;
            assert!(get_by_source(conn, Family::Agent, SourceName::Idref, "i1")?.is_empty());
            assert!(get_by_viaf(conn, "v1")?.is_empty());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_latest_follows_source_redirect() {
        let db = test_db().await;
        db.read(|conn| {
            // Old record redirects to the new one
            let rel = RelationPid {
                relation: RelationType::RedirectTo,
                value: "new".into(),
            };
            source::put(
                conn,
                EntityKind::AgentIdref,
                "old",
                &json!({"pid": "old"}),
                None,
                Some(&rel),
            )?;
            source::put(
                conn,
                EntityKind::AgentIdref,
                "new",
                &json!({"pid": "new"}),
                None,
                None,
            )?;

            let mut cluster = create(conn, Family::Agent)?;
            cluster.idref_pid = Some("new".into());
            save(conn, &mut cluster)?;

            let found = latest(conn, EntityKind::AgentIdref, "old")?.unwrap();
            assert_eq!(found.pid, cluster.pid);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_latest_follows_idref_redirect_from() {
        let db = test_db().await;
        db.read(|conn| {
            // Successor declares where it came from
            source::put(
                conn,
                EntityKind::AgentIdref,
                "old",
                &json!({"pid": "old"}),
                None,
                None,
            )?;
            let rel = RelationPid {
                relation: RelationType::RedirectFrom,
                value: "old".into(),
            };
            source::put(
                conn,
                EntityKind::AgentIdref,
                "succ",
                &json!({"pid": "succ"}),
                None,
                Some(&rel),
            )?;

            let mut cluster = create(conn, Family::Agent)?;
            cluster.idref_pid = Some("succ".into());
            save(conn, &mut cluster)?;

            let found = latest(conn, EntityKind::AgentIdref, "old")?.unwrap();
            assert_eq!(found.pid, cluster.pid);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_latest_terminates_on_cycle() {
        let db = test_db().await;
        db.read(|conn| {
            // Two records redirecting at each other via redirect_from
            // declarations; resolution must not loop.
            let rel_a = RelationPid {
                relation: RelationType::RedirectFrom,
                value: "b".into(),
            };
            let rel_b = RelationPid {
                relation: RelationType::RedirectFrom,
                value: "a".into(),
            };
            source::put(conn, EntityKind::AgentIdref, "a", &json!({"pid": "a"}), None, Some(&rel_a))?;
            source::put(conn, EntityKind::AgentIdref, "b", &json!({"pid": "b"}), None, Some(&rel_b))?;

            assert!(latest(conn, EntityKind::AgentIdref, "a")?.is_none());
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_put_then_counts() {
        let db = test_db().await;
        db.read(|conn| {
            let mut c1 = create(conn, Family::Place)?;
            c1.idref_pid = Some("i1".into());
            save(conn, &mut c1)?;
            let mut c2 = create(conn, Family::Place)?;
            c2.gnd_pid = Some("g1".into());
            c2.deleted = Some(now_rfc3339());
            save(conn, &mut c2)?;

            assert_eq!(count(conn, Family::Place, true)?, 1);
            assert_eq!(count(conn, Family::Place, false)?, 2);
            assert_eq!(count_with_source(conn, Family::Place, SourceName::Idref)?, 1);
            assert_eq!(count_with_source(conn, Family::Place, SourceName::Gnd)?, 0);
            Ok(())
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_source_refs_priority_order() {
        let cluster = MefCluster {
            family: Family::Agent,
            pid: "1".into(),
            viaf_pid: None,
            gnd_pid: Some("g".into()),
            idref_pid: Some("i".into()),
            rero_pid: Some("r".into()),
            record_type: None,
            deleted: None,
            meta: RecordMeta::new(),
        };
        let refs: Vec<SourceName> = cluster.source_refs().into_iter().map(|(s, _)| s).collect();
        assert_eq!(refs, vec![SourceName::Gnd, SourceName::Idref, SourceName::Rero]);
    }
}
