//! Monitoring
//!
//! Read-only divergence counts between the primary store and the secondary
//! index, and between MEF clusters and the source stores. Safe to run
//! concurrently with ingest.

use rusqlite::{params, Connection};
use serde::Serialize;

use crate::db::{event_log, event_log::LogEntry, Db};
use crate::index::SecondaryIndex;
use crate::records::{mef, source, viaf};
use crate::types::{EntityKind, Family, Result, Role};

/// Store vs index comparison for one kind
#[derive(Debug, Serialize)]
pub struct KindReport {
    pub kind: String,
    pub store: i64,
    pub index: usize,
    /// Pids present in the store but absent from the index
    pub missing_in_index: Vec<String>,
    /// Pids present in the index but absent from the store
    pub missing_in_store: Vec<String>,
}

/// MEF refs vs source store for one `(family, source)`
#[derive(Debug, Serialize)]
pub struct SourceCount {
    pub source: String,
    pub mef_refs: i64,
    pub store_live: i64,
}

/// Per-family cluster health
#[derive(Debug, Serialize)]
pub struct FamilyReport {
    pub family: String,
    pub clusters_live: i64,
    pub clusters_total: i64,
    pub sources: Vec<SourceCount>,
    /// Source pids referenced by more than one live cluster
    pub duplicate_refs: Vec<String>,
}

/// Full monitoring snapshot
#[derive(Debug, Serialize)]
pub struct MonitorReport {
    pub kinds: Vec<KindReport>,
    pub families: Vec<FamilyReport>,
    pub event_log: Vec<LogEntry>,
}

impl MonitorReport {
    /// Whether any divergence or duplicate was found
    pub fn has_findings(&self) -> bool {
        self.kinds
            .iter()
            .any(|k| !k.missing_in_index.is_empty() || !k.missing_in_store.is_empty())
            || self.families.iter().any(|f| !f.duplicate_refs.is_empty())
    }
}

/// All pids of a kind in the primary store
fn store_pids(conn: &Connection, kind: EntityKind) -> Result<Vec<String>> {
    let (sql, key) = match kind.role() {
        Role::Source => (
            "SELECT pid FROM source_records WHERE kind = ? ORDER BY pid",
            Some(kind.as_str().to_string()),
        ),
        Role::Crosswalk => ("SELECT pid FROM viaf_records ORDER BY pid", None),
        Role::Mef => (
            "SELECT pid FROM mef_clusters WHERE family = ? ORDER BY pid",
            Some(kind.family().as_str().to_string()),
        ),
    };
    let mut stmt = conn.prepare(sql)?;
    let pids = match key {
        Some(k) => stmt
            .query_map(params![k], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
        None => stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?,
    };
    Ok(pids)
}

fn store_count(conn: &Connection, kind: EntityKind) -> Result<i64> {
    match kind.role() {
        Role::Source => source::count(conn, kind, false),
        Role::Crosswalk => viaf::count(conn),
        Role::Mef => mef::count(conn, kind.family(), false),
    }
}

/// Source pids referenced by more than one live cluster of a family
fn duplicate_refs(conn: &Connection, family: Family) -> Result<Vec<String>> {
    let mut duplicates = Vec::new();
    for sourcename in family.sources() {
        let column = match sourcename {
            crate::types::SourceName::Gnd => "gnd_pid",
            crate::types::SourceName::Idref => "idref_pid",
            crate::types::SourceName::Rero => "rero_pid",
        };
        let sql = format!(
            "SELECT {col} FROM mef_clusters
             WHERE family = ? AND {col} IS NOT NULL AND deleted IS NULL
             GROUP BY {col} HAVING COUNT(*) > 1",
            col = column
        );
        let mut stmt = conn.prepare(&sql)?;
        let pids = stmt
            .query_map(params![family.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for pid in pids {
            duplicates.push(format!("{}:{}", sourcename, pid));
        }
    }
    Ok(duplicates)
}

/// Build the full monitoring snapshot
pub async fn report(
    db: &Db,
    index: &dyn SecondaryIndex,
    log_tail: u32,
) -> Result<MonitorReport> {
    let mut kinds = Vec::new();
    for kind in EntityKind::ALL {
        let (store, pids) = db
            .read(|conn| Ok((store_count(conn, kind)?, store_pids(conn, kind)?)))
            .await?;
        let index_ids = index.ids(kind).await?;
        let index_count = index_ids.len();

        let missing_in_index: Vec<String> = pids
            .iter()
            .filter(|p| !index_ids.contains(p))
            .cloned()
            .collect();
        let missing_in_store: Vec<String> = index_ids
            .into_iter()
            .filter(|p| !pids.contains(p))
            .collect();

        kinds.push(KindReport {
            kind: kind.as_str().to_string(),
            store,
            index: index_count,
            missing_in_index,
            missing_in_store,
        });
    }

    let mut families = Vec::new();
    for family in Family::ALL {
        let report = db
            .read(|conn| {
                let mut sources = Vec::new();
                for sourcename in family.sources() {
                    let Some(kind) = family.source_kind(*sourcename) else {
                        continue;
                    };
                    sources.push(SourceCount {
                        source: sourcename.to_string(),
                        mef_refs: mef::count_with_source(conn, family, *sourcename)?,
                        store_live: source::count(conn, kind, true)?,
                    });
                }
                Ok(FamilyReport {
                    family: family.to_string(),
                    clusters_live: mef::count(conn, family, true)?,
                    clusters_total: mef::count(conn, family, false)?,
                    sources,
                    duplicate_refs: duplicate_refs(conn, family)?,
                })
            })
            .await?;
        families.push(report);
    }

    let event_log = db.read(|conn| event_log::tail(conn, log_tail)).await?;

    Ok(MonitorReport {
        kinds,
        families,
        event_log,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::index::MemoryIndex;
    use crate::records::mef;
    use serde_json::json;

    #[tokio::test]
    async fn test_report_counts_divergence() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let index = MemoryIndex::new();

        db.read(|conn| {
            source::put(
                conn,
                EntityKind::AgentGnd,
                "g1",
                &json!({"pid": "g1", "type": "bf:Person"}),
                None,
                None,
            )?;
            let mut cluster = mef::create(conn, Family::Agent)?;
            cluster.gnd_pid = Some("g1".into());
            mef::save(conn, &mut cluster)?;
            Ok(())
        })
        .await
        .unwrap();

        // Index only knows the cluster, not the source record
        index
            .upsert(EntityKind::AgentMef, "1", json!({"pid": "1"}))
            .await
            .unwrap();

        let report = report(&db, &index, 10).await.unwrap();
        assert!(report.has_findings());

        let gnd = report
            .kinds
            .iter()
            .find(|k| k.kind == "agent-gnd")
            .unwrap();
        assert_eq!(gnd.store, 1);
        assert_eq!(gnd.index, 0);
        assert_eq!(gnd.missing_in_index, vec!["g1"]);

        let agent = report
            .families
            .iter()
            .find(|f| f.family == "agent")
            .unwrap();
        assert_eq!(agent.clusters_live, 1);
        assert_eq!(agent.sources[0].mef_refs, 1);
        assert_eq!(agent.sources[0].store_live, 1);
        assert!(agent.duplicate_refs.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_refs_surface() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();
        let index = MemoryIndex::new();

        db.read(|conn| {
            // Two live clusters claiming the same idref pid
            let mut c1 = mef::create(conn, Family::Concept)?;
            c1.idref_pid = Some("i1".into());
            mef::save(conn, &mut c1)?;
            let mut c2 = mef::create(conn, Family::Concept)?;
            c2.idref_pid = Some("i1".into());
            mef::save(conn, &mut c2)?;
            Ok(())
        })
        .await
        .unwrap();

        let report = report(&db, &index, 10).await.unwrap();
        let concept = report
            .families
            .iter()
            .find(|f| f.family == "concept")
            .unwrap();
        assert_eq!(concept.duplicate_refs, vec!["idref:i1"]);
    }
}
