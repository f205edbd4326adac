//! Bulk load and export
//!
//! CSV files in the persisted-state layout: `pidstore.csv` (pid rows),
//! `metadata.csv` (cluster rows as JSON), `ids.csv` (counter state).
//! Export and load round-trip one MEF family.

use std::fs::File;
use std::path::Path;

use rusqlite::params;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::db::Db;
use crate::records::RecordMeta;
use crate::records::mef::{self, MefCluster};
use crate::types::{Family, MefError, Result};

/// Counters for a bulk run
#[derive(Debug, Default, Clone, Serialize)]
pub struct BulkStats {
    pub pid_rows: u64,
    pub metadata_rows: u64,
    pub counter_rows: u64,
}

/// Flat JSON for one cluster row, used in `metadata.csv`
fn cluster_json(cluster: &MefCluster) -> Value {
    json!({
        "pid": cluster.pid,
        "viaf_pid": cluster.viaf_pid,
        "gnd_pid": cluster.gnd_pid,
        "idref_pid": cluster.idref_pid,
        "rero_pid": cluster.rero_pid,
        "type": cluster.record_type,
        "deleted": cluster.deleted,
    })
}

fn cluster_from_json(family: Family, json: &Value, meta: RecordMeta) -> Result<MefCluster> {
    let field = |name: &str| {
        json.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let pid = field("pid")
        .ok_or_else(|| MefError::Validation("metadata row has no pid".into()))?;
    Ok(MefCluster {
        family,
        pid,
        viaf_pid: field("viaf_pid"),
        gnd_pid: field("gnd_pid"),
        idref_pid: field("idref_pid"),
        rero_pid: field("rero_pid"),
        record_type: field("type"),
        deleted: field("deleted"),
        meta,
    })
}

/// Write `pidstore.csv`, `metadata.csv` and `ids.csv` for one family
pub async fn export_family(db: &Db, family: Family, dir: &Path) -> Result<BulkStats> {
    std::fs::create_dir_all(dir)?;
    let mut stats = BulkStats::default();

    let mef_kind = family.mef_kind();
    let (pid_rows, clusters, counter) = db
        .read(|conn| {
            let pid_rows = crate::pid::list(conn, mef_kind, None)?;
            let clusters = mef::iterate(conn, family, false)?;
            let counter: i64 = conn
                .query_row(
                    "SELECT next FROM id_counters WHERE family = ?",
                    params![family.as_str()],
                    |row| row.get(0),
                )
                .unwrap_or(1);
            Ok((pid_rows, clusters, counter))
        })
        .await?;

    let mut pid_writer = csv::Writer::from_writer(File::create(dir.join("pidstore.csv"))?);
    pid_writer
        .write_record(["kind", "value", "status", "target", "object_uuid", "created", "updated"])
        .map_err(|e| MefError::Internal(format!("CSV write failed: {}", e)))?;
    for row in &pid_rows {
        pid_writer
            .write_record([
                row.kind.as_str(),
                row.value.as_str(),
                row.status.as_str(),
                row.target.as_deref().unwrap_or(""),
                row.object_uuid.as_str(),
                row.created.as_str(),
                row.updated.as_str(),
            ])
            .map_err(|e| MefError::Internal(format!("CSV write failed: {}", e)))?;
        stats.pid_rows += 1;
    }
    pid_writer.flush()?;

    let mut meta_writer = csv::Writer::from_writer(File::create(dir.join("metadata.csv"))?);
    meta_writer
        .write_record(["pid", "uuid", "json", "created", "updated", "version"])
        .map_err(|e| MefError::Internal(format!("CSV write failed: {}", e)))?;
    for cluster in &clusters {
        let json = serde_json::to_string(&cluster_json(cluster))?;
        let version = cluster.meta.version.to_string();
        meta_writer
            .write_record([
                cluster.pid.as_str(),
                cluster.meta.uuid.as_str(),
                json.as_str(),
                cluster.meta.created.as_str(),
                cluster.meta.updated.as_str(),
                version.as_str(),
            ])
            .map_err(|e| MefError::Internal(format!("CSV write failed: {}", e)))?;
        stats.metadata_rows += 1;
    }
    meta_writer.flush()?;

    let mut ids_writer = csv::Writer::from_writer(File::create(dir.join("ids.csv"))?);
    ids_writer
        .write_record(["family", "next"])
        .map_err(|e| MefError::Internal(format!("CSV write failed: {}", e)))?;
    let next = counter.to_string();
    ids_writer
        .write_record([family.as_str(), next.as_str()])
        .map_err(|e| MefError::Internal(format!("CSV write failed: {}", e)))?;
    ids_writer.flush()?;
    stats.counter_rows = 1;

    info!(
        family = %family,
        dir = %dir.display(),
        pids = stats.pid_rows,
        clusters = stats.metadata_rows,
        "Bulk export complete"
    );
    Ok(stats)
}

/// Load the three CSV files for one family into the primary store
pub async fn load_family(db: &Db, family: Family, dir: &Path) -> Result<BulkStats> {
    let mut stats = BulkStats::default();

    let pid_path = dir.join("pidstore.csv");
    let meta_path = dir.join("metadata.csv");
    let ids_path = dir.join("ids.csv");
    for path in [&pid_path, &meta_path, &ids_path] {
        if !path.exists() {
            return Err(MefError::Config(format!(
                "Bulk file missing: {}",
                path.display()
            )));
        }
    }

    let pid_rows: Vec<csv::StringRecord> = csv::Reader::from_path(&pid_path)
        .map_err(|e| MefError::Config(format!("pidstore.csv: {}", e)))?
        .records()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| MefError::Config(format!("pidstore.csv: {}", e)))?;
    let meta_rows: Vec<csv::StringRecord> = csv::Reader::from_path(&meta_path)
        .map_err(|e| MefError::Config(format!("metadata.csv: {}", e)))?
        .records()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| MefError::Config(format!("metadata.csv: {}", e)))?;
    let ids_rows: Vec<csv::StringRecord> = csv::Reader::from_path(&ids_path)
        .map_err(|e| MefError::Config(format!("ids.csv: {}", e)))?
        .records()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| MefError::Config(format!("ids.csv: {}", e)))?;

    let loaded = db.transaction(|conn| {
        let mut loaded = BulkStats::default();

        for row in &pid_rows {
            let get = |i: usize| row.get(i).unwrap_or("").to_string();
            let target = get(3);
            conn.execute(
                "INSERT OR REPLACE INTO pids
                 (kind, value, status, target, object_uuid, created, updated)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    get(0),
                    get(1),
                    get(2),
                    if target.is_empty() { None } else { Some(target) },
                    get(4),
                    get(5),
                    get(6)
                ],
            )?;
            loaded.pid_rows += 1;
        }

        for row in &meta_rows {
            let get = |i: usize| row.get(i).unwrap_or("").to_string();
            let json: Value = serde_json::from_str(&get(2))?;
            let meta = RecordMeta {
                uuid: get(1),
                created: get(3),
                updated: get(4),
                version: get(5).parse().unwrap_or(1),
            };
            let cluster = cluster_from_json(family, &json, meta)?;
            conn.execute(
                "INSERT OR REPLACE INTO mef_clusters
                 (family, pid, uuid, viaf_pid, gnd_pid, idref_pid, rero_pid, record_type,
                  deleted, created, updated, version)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    family.as_str(),
                    cluster.pid,
                    cluster.meta.uuid,
                    cluster.viaf_pid,
                    cluster.gnd_pid,
                    cluster.idref_pid,
                    cluster.rero_pid,
                    cluster.record_type,
                    cluster.deleted,
                    cluster.meta.created,
                    cluster.meta.updated,
                    cluster.meta.version
                ],
            )?;
            loaded.metadata_rows += 1;
        }

        for row in &ids_rows {
            let next: i64 = row.get(1).unwrap_or("1").parse().unwrap_or(1);
            conn.execute(
                "INSERT INTO id_counters (family, next) VALUES (?1, ?2)
                 ON CONFLICT(family) DO UPDATE SET next = MAX(next, ?2)",
                params![row.get(0).unwrap_or(family.as_str()), next],
            )?;
            loaded.counter_rows += 1;
        }

        Ok(loaded)
    })
    .await?;

    stats = loaded;
    info!(
        family = %family,
        dir = %dir.display(),
        pids = stats.pid_rows,
        clusters = stats.metadata_rows,
        "Bulk load complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_export_load_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.init().await.unwrap();

        db.read(|conn| {
            let mut c1 = mef::create(conn, Family::Agent)?;
            c1.viaf_pid = Some("v1".into());
            c1.gnd_pid = Some("g1".into());
            c1.record_type = Some("bf:Person".into());
            mef::save(conn, &mut c1)?;
            let mut c2 = mef::create(conn, Family::Agent)?;
            c2.idref_pid = Some("i1".into());
            mef::save(conn, &mut c2)?;
            Ok(())
        })
        .await
        .unwrap();

        let dir = tempdir().unwrap();
        let exported = export_family(&db, Family::Agent, dir.path()).await.unwrap();
        assert_eq!(exported.metadata_rows, 2);
        assert_eq!(exported.pid_rows, 2);

        // Load into a fresh database
        let fresh = Db::open_in_memory().unwrap();
        fresh.init().await.unwrap();
        let loaded = load_family(&fresh, Family::Agent, dir.path()).await.unwrap();
        assert_eq!(loaded.metadata_rows, 2);

        fresh
            .read(|conn| {
                let c1 = mef::get(conn, Family::Agent, "1")?.unwrap();
                assert_eq!(c1.viaf_pid.as_deref(), Some("v1"));
                assert_eq!(c1.gnd_pid.as_deref(), Some("g1"));
                assert_eq!(c1.record_type.as_deref(), Some("bf:Person"));
                // The counter continues after the loaded pids
                let minted = crate::pid::mint(conn, Family::Agent)?;
                assert_eq!(minted, "3");
                Ok(())
            })
            .await
            .unwrap();
    }
}
