//! The reconciliation engine
//!
//! Invoked for three event types: source record upsert, VIAF cross-walk
//! upsert, and VIAF physical delete. Each event is idempotent and converges
//! regardless of replay order. All primary-store writes of one event share
//! a single transaction; the secondary index is refreshed after commit and
//! is allowed to lag.

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{event_log, event_log::Severity, Db};
use crate::index::{mef_document, source_document, viaf_document, IndexOp, SecondaryIndex};
use crate::records::mef::{self, MefCluster};
use crate::records::source;
use crate::records::viaf::{self, ViafRecord};
use crate::records::{PutAction, RelationPid};
use crate::types::{now_rfc3339, EntityKind, Family, MefError, Result, SourceName};

use super::locks::ClusterLocks;

/// What happened to the MEF side of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MefAction {
    Created,
    Updated,
    UpToDate,
    Deleted,
}

/// Outcome reported to callers
#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    /// Store action for the record carried by the event, if any
    pub source: Option<PutAction>,
    pub mef: MefAction,
    /// Pid of the cluster that owns the event's record after commit
    pub cluster_pid: Option<String>,
}

/// Effects of one committed event
struct Effects {
    report: EngineReport,
    ops: Vec<IndexOp>,
}

/// The engine. Single writer per entity kind; distinct kinds proceed in
/// parallel. Holds per-cluster advisory locks across each event.
pub struct ReconcileEngine {
    db: Db,
    index: Arc<dyn SecondaryIndex>,
    locks: ClusterLocks,
    base_url: String,
}

impl ReconcileEngine {
    pub fn new(db: Db, index: Arc<dyn SecondaryIndex>, base_url: String) -> Self {
        Self {
            db,
            index,
            locks: ClusterLocks::new(),
            base_url,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Event: source record upsert (spec of the ingest pipeline's output)
    pub async fn ingest_source(
        &self,
        kind: EntityKind,
        source_pid: &str,
        payload: Value,
        deleted: bool,
        relation: Option<RelationPid>,
    ) -> Result<EngineReport> {
        let sourcename = kind.source().ok_or_else(|| {
            MefError::Internal(format!("ingest_source takes a source kind, got {}", kind))
        })?;
        let event_id = Uuid::new_v4().to_string();

        // Lock on the owning cluster: the VIAF pid when the cross-walk
        // already links this record, otherwise the record itself.
        let lock_key = {
            let family = kind.family();
            let viaf_pid = if family.has_viaf() {
                self.db
                    .read(|conn| viaf::lookup_by_source(conn, sourcename, source_pid))
                    .await?
            } else {
                None
            };
            match viaf_pid {
                Some(v) => format!("{}:viaf:{}", family, v),
                None => format!("{}:{}:{}", family, kind, source_pid),
            }
        };
        let _guard = self.locks.acquire(&lock_key).await;

        let effects = self
            .db
            .transaction(|conn| {
                apply_source_event(
                    conn,
                    kind,
                    source_pid,
                    &payload,
                    deleted,
                    relation.as_ref(),
                    &event_id,
                    &self.base_url,
                )
            })
            .await;

        let effects = match effects {
            Ok(e) => e,
            Err(err) => {
                if matches!(err, MefError::Conflict(_)) {
                    // Consistency error mid-event: flag for manual review
                    let msg = err.to_string();
                    let _ = self
                        .db
                        .transaction(|conn| {
                            event_log::append(
                                conn,
                                &event_id,
                                kind,
                                source_pid,
                                Severity::Review,
                                &msg,
                            )
                        })
                        .await;
                }
                return Err(err);
            }
        };

        self.refresh_index(&effects.ops).await;
        Ok(effects.report)
    }

    /// Event: VIAF record upsert (agents only)
    pub async fn ingest_viaf(&self, record: ViafRecord) -> Result<EngineReport> {
        let event_id = Uuid::new_v4().to_string();
        let lock_key = format!("{}:viaf:{}", Family::Agent, record.pid);
        let _guard = self.locks.acquire(&lock_key).await;

        let effects = self
            .db
            .transaction(|conn| apply_viaf_event(conn, &record, &event_id, &self.base_url))
            .await?;

        self.refresh_index(&effects.ops).await;
        Ok(effects.report)
    }

    /// Event: VIAF record physical delete
    pub async fn delete_viaf(&self, viaf_pid: &str) -> Result<EngineReport> {
        let event_id = Uuid::new_v4().to_string();
        let lock_key = format!("{}:viaf:{}", Family::Agent, viaf_pid);
        let _guard = self.locks.acquire(&lock_key).await;

        let effects = self
            .db
            .transaction(|conn| apply_viaf_delete(conn, viaf_pid, &event_id, &self.base_url))
            .await?;

        self.refresh_index(&effects.ops).await;
        Ok(effects.report)
    }

    /// Push post-commit documents to the secondary index. Divergence is
    /// tolerated and surfaced by the monitor, so failures only warn.
    async fn refresh_index(&self, ops: &[IndexOp]) {
        if ops.is_empty() {
            return;
        }
        if let Err(e) = self.index.bulk(ops.to_vec()).await {
            warn!(error = %e, "Secondary index refresh failed; monitor will surface the gap");
        }
    }
}

/// Refresh derived cluster state: `type` from the family's source priority
/// order, and the deletion flag from the liveness of its references.
fn finalize_cluster(conn: &Connection, cluster: &mut MefCluster) -> Result<()> {
    let mut record_type: Option<String> = None;
    let mut any_ref = false;
    let mut all_deleted = true;

    for s in cluster.family.sources() {
        let Some(p) = cluster.source_ref(*s).map(str::to_string) else {
            continue;
        };
        any_ref = true;
        let Some(kind) = cluster.family.source_kind(*s) else {
            continue;
        };
        if let Some(record) = source::get(conn, kind, &p)? {
            if !record.is_deleted() {
                all_deleted = false;
            }
            if record_type.is_none() {
                if let Some(t) = record.payload.get("type").and_then(Value::as_str) {
                    record_type = Some(t.to_string());
                }
            }
        }
    }

    if record_type.is_some() {
        cluster.record_type = record_type;
    }

    if !any_ref {
        if cluster.viaf_pid.is_none() {
            if cluster.deleted.is_none() {
                cluster.deleted = Some(now_rfc3339());
            }
        } else {
            // Stub: downstream consumers holding the VIAF pid still resolve
            cluster.deleted = None;
        }
    } else if all_deleted {
        if cluster.deleted.is_none() {
            cluster.deleted = Some(now_rfc3339());
        }
    } else {
        cluster.deleted = None;
    }
    Ok(())
}

/// Drop one source reference from a cluster and persist
fn detach_source(
    conn: &Connection,
    cluster: &mut MefCluster,
    sourcename: SourceName,
) -> Result<()> {
    cluster.set_source_ref(sourcename, None);
    finalize_cluster(conn, cluster)?;
    mef::save(conn, cluster)
}

/// Create a standalone cluster for a live, unowned source record.
/// Returns None when the record is absent/deleted or already owned.
fn create_singleton(
    conn: &Connection,
    family: Family,
    sourcename: SourceName,
    source_pid: &str,
) -> Result<Option<MefCluster>> {
    let Some(kind) = family.source_kind(sourcename) else {
        return Ok(None);
    };
    let live = source::get(conn, kind, source_pid)?
        .map(|r| !r.is_deleted())
        .unwrap_or(false);
    if !live {
        return Ok(None);
    }
    if !mef::get_by_source(conn, family, sourcename, source_pid)?.is_empty() {
        return Ok(None);
    }
    let mut cluster = mef::create(conn, family)?;
    cluster.set_source_ref(sourcename, Some(source_pid.to_string()));
    finalize_cluster(conn, &mut cluster)?;
    mef::save(conn, &mut cluster)?;
    Ok(Some(cluster))
}

fn mef_op(cluster: &MefCluster, base_url: &str) -> IndexOp {
    IndexOp::Upsert {
        kind: cluster.family.mef_kind(),
        pid: cluster.pid.clone(),
        document: mef_document(cluster, base_url),
    }
}

#[allow(clippy::too_many_arguments)]
fn apply_source_event(
    conn: &Connection,
    kind: EntityKind,
    source_pid: &str,
    payload: &Value,
    deleted: bool,
    relation: Option<&RelationPid>,
    event_id: &str,
    base_url: &str,
) -> Result<Effects> {
    let family = kind.family();
    let sourcename = kind.source().ok_or_else(|| {
        MefError::Internal(format!("Source event for non-source kind {}", kind))
    })?;
    let deleted_ts = if deleted { Some(now_rfc3339()) } else { None };

    // 1. Store the record. Validation failures abort here, before any
    //    cluster mutation.
    let action = source::put(conn, kind, source_pid, payload, deleted_ts.as_deref(), relation)?;

    let mut ops: Vec<IndexOp> = Vec::new();
    if let Some(stored) = source::get(conn, kind, source_pid)? {
        ops.push(IndexOp::Upsert {
            kind,
            pid: source_pid.to_string(),
            document: source_document(&stored),
        });
    }

    // Short-circuit: nothing changed and the cluster state already agrees
    if action == PutAction::Unchanged {
        let owners = mef::get_by_source(conn, family, sourcename, source_pid)?;
        let consistent = if deleted {
            owners.is_empty()
        } else if owners.len() == 1 {
            if family.has_viaf() {
                owners[0].viaf_pid == viaf::lookup_by_source(conn, sourcename, source_pid)?
            } else {
                true
            }
        } else {
            false
        };
        if consistent {
            return Ok(Effects {
                report: EngineReport {
                    source: Some(action),
                    mef: MefAction::UpToDate,
                    cluster_pid: owners.first().map(|c| c.pid.clone()),
                },
                ops: Vec::new(),
            });
        }
    }

    // 2. Resolve the owning cluster
    let mut created_cluster = false;

    let viaf_pid = if family.has_viaf() {
        viaf::lookup_by_source(conn, sourcename, source_pid)?
    } else {
        None
    };

    let mut cluster: Option<MefCluster> = if let Some(ref v) = viaf_pid {
        let mut candidates = mef::get_by_viaf(conn, v)?;
        let survivor = if candidates.is_empty() {
            // Mirror VIAF membership for sources that already exist
            let mut c = mef::create(conn, family)?;
            created_cluster = true;
            c.viaf_pid = Some(v.clone());
            if let Some(viaf_record) = viaf::get(conn, v)? {
                for (s, p) in viaf_record.membership() {
                    let Some(k) = family.source_kind(s) else { continue };
                    let live = source::get(conn, k, &p)?
                        .map(|r| !r.is_deleted())
                        .unwrap_or(false);
                    if live {
                        for mut prior in mef::get_by_source(conn, family, s, &p)? {
                            detach_source(conn, &mut prior, s)?;
                            ops.push(mef_op(&prior, base_url));
                        }
                        c.set_source_ref(s, Some(p));
                    }
                }
            }
            c
        } else {
            // Several clusters claiming one VIAF pid: merge into the
            // lowest-pid survivor (stable tie-break)
            let mut survivor = candidates.remove(0);
            for mut loser in candidates {
                event_log::append(
                    conn,
                    event_id,
                    family.mef_kind(),
                    &loser.pid,
                    Severity::Warning,
                    &format!("Merged into cluster {} (VIAF {})", survivor.pid, v),
                )?;
                for (s, p) in loser.source_refs() {
                    if survivor.source_ref(s).is_none() {
                        survivor.set_source_ref(s, Some(p));
                    }
                    loser.set_source_ref(s, None);
                }
                loser.viaf_pid = None;
                loser.deleted = Some(now_rfc3339());
                mef::save(conn, &mut loser)?;
                ops.push(mef_op(&loser, base_url));
            }
            survivor
        };
        Some(survivor)
    } else {
        let mut owners = mef::get_by_source(conn, family, sourcename, source_pid)?;
        if owners.len() > 1 {
            // Invariant 3.1 violated: keep the most recently updated owner
            let keep = owners.remove(0);
            for mut extra in owners {
                event_log::append(
                    conn,
                    event_id,
                    family.mef_kind(),
                    &extra.pid,
                    Severity::Warning,
                    &format!(
                        "Dropped duplicate {} reference {} (kept cluster {})",
                        sourcename, source_pid, keep.pid
                    ),
                )?;
                detach_source(conn, &mut extra, sourcename)?;
                ops.push(mef_op(&extra, base_url));
            }
            Some(keep)
        } else if let Some(owner) = owners.pop() {
            Some(owner)
        } else if deleted {
            // Nothing to vacate for an unknown deleted record
            None
        } else {
            created_cluster = true;
            Some(mef::create(conn, family)?)
        }
    };

    // The record may still be referenced by a different cluster (stale VIAF
    // claim or earlier repair); detach it there.
    if let Some(ref c) = cluster {
        let owners = mef::get_by_source(conn, family, sourcename, source_pid)?;
        for mut other in owners {
            if other.pid != c.pid {
                detach_source(conn, &mut other, sourcename)?;
                ops.push(mef_op(&other, base_url));
            }
        }
    }

    let Some(mut c) = cluster else {
        return Ok(Effects {
            report: EngineReport {
                source: Some(action),
                mef: MefAction::UpToDate,
                cluster_pid: None,
            },
            ops,
        });
    };

    // 3./4. Place or remove the reference
    if deleted {
        c.set_source_ref(sourcename, None);
    } else {
        c.set_source_ref(sourcename, Some(source_pid.to_string()));
    }

    // 5. Non-VIAF cross-walk: IDREF-declared GND equivalence
    if !family.has_viaf() && !deleted {
        apply_gnd_equivalence(conn, family, sourcename, source_pid, payload, &mut c, &mut ops, base_url)?;
    }

    // 6./7. Derived state, persist, refresh
    finalize_cluster(conn, &mut c)?;
    mef::save(conn, &mut c)?;
    ops.push(mef_op(&c, base_url));

    let mef_action = if created_cluster {
        MefAction::Created
    } else if c.is_deleted() {
        MefAction::Deleted
    } else {
        MefAction::Updated
    };

    debug!(
        kind = %kind,
        pid = %source_pid,
        cluster = %c.pid,
        action = ?action,
        mef = ?mef_action,
        "Source event applied"
    );

    Ok(Effects {
        report: EngineReport {
            source: Some(action),
            mef: mef_action,
            cluster_pid: Some(c.pid.clone()),
        },
        ops,
    })
}

/// Attach GND references across the IDREF equivalence declaration, in both
/// arrival orders: IDREF first (the GND record may not exist yet) or GND
/// first (an IDREF record may already assert this pid).
#[allow(clippy::too_many_arguments)]
fn apply_gnd_equivalence(
    conn: &Connection,
    family: Family,
    sourcename: SourceName,
    source_pid: &str,
    payload: &Value,
    cluster: &mut MefCluster,
    ops: &mut Vec<IndexOp>,
    base_url: &str,
) -> Result<()> {
    let Some(gnd_kind) = family.source_kind(SourceName::Gnd) else {
        return Ok(());
    };

    match sourcename {
        SourceName::Idref => {
            let Some(gnd_pid) = source::gnd_equivalence(payload) else {
                return Ok(());
            };
            let live = source::get(conn, gnd_kind, &gnd_pid)?
                .map(|r| !r.is_deleted())
                .unwrap_or(false);
            if !live {
                // The equivalence is pending until the GND record arrives
                return Ok(());
            }
            for mut other in mef::get_by_source(conn, family, SourceName::Gnd, &gnd_pid)? {
                if other.pid != cluster.pid {
                    detach_source(conn, &mut other, SourceName::Gnd)?;
                    ops.push(mef_op(&other, base_url));
                }
            }
            cluster.set_source_ref(SourceName::Gnd, Some(gnd_pid));
        }
        SourceName::Gnd => {
            let Some(idref_kind) = family.source_kind(SourceName::Idref) else {
                return Ok(());
            };
            let Some(idref_pid) = source::find_gnd_equivalent(conn, idref_kind, source_pid)?
            else {
                return Ok(());
            };
            // The IDREF cluster asserting the equivalence owns the GND ref
            if cluster.source_ref(SourceName::Idref) == Some(idref_pid.as_str()) {
                return Ok(());
            }
            if let Some(mut idref_cluster) = mef::get_by_source(conn, family, SourceName::Idref, &idref_pid)?
                .into_iter()
                .next()
            {
                cluster.set_source_ref(SourceName::Gnd, None);
                idref_cluster.set_source_ref(SourceName::Gnd, Some(source_pid.to_string()));
                finalize_cluster(conn, &mut idref_cluster)?;
                mef::save(conn, &mut idref_cluster)?;
                ops.push(mef_op(&idref_cluster, base_url));
            }
        }
        SourceName::Rero => {}
    }
    Ok(())
}

fn apply_viaf_event(
    conn: &Connection,
    record: &ViafRecord,
    event_id: &str,
    base_url: &str,
) -> Result<Effects> {
    let family = Family::Agent;
    let mut ops: Vec<IndexOp> = Vec::new();

    // 1. Store the cross-walk, keeping the prior membership for the diff
    let (_action, old) = viaf::put(conn, record)?;
    ops.push(IndexOp::Upsert {
        kind: EntityKind::AgentViaf,
        pid: record.pid.clone(),
        document: viaf_document(record),
    });

    // Last writer wins on contested source pids: strip them from earlier
    // claimants and their clusters
    for (s, p) in record.membership() {
        for other_viaf in viaf::all_claiming(conn, s, &p)? {
            if other_viaf == record.pid {
                continue;
            }
            if let Some(mut other) = viaf::get(conn, &other_viaf)? {
                event_log::append(
                    conn,
                    event_id,
                    EntityKind::AgentViaf,
                    &other_viaf,
                    Severity::Review,
                    &format!("{} {} contested by VIAF {}; last writer wins", s, p, record.pid),
                )?;
                other.set_source_pid(s, None);
                viaf::put(conn, &other)?;
                ops.push(IndexOp::Upsert {
                    kind: EntityKind::AgentViaf,
                    pid: other_viaf.clone(),
                    document: viaf_document(&other),
                });
                for mut foreign in mef::get_by_viaf(conn, &other_viaf)? {
                    if foreign.source_ref(s) == Some(p.as_str()) {
                        detach_source(conn, &mut foreign, s)?;
                        ops.push(mef_op(&foreign, base_url));
                    }
                }
            }
        }
    }

    let old_membership: BTreeSet<(SourceName, String)> = old
        .as_ref()
        .map(|o| o.membership().into_iter().collect())
        .unwrap_or_default();
    let new_membership: BTreeSet<(SourceName, String)> =
        record.membership().into_iter().collect();

    // 3. Claim candidate clusters for the new membership
    let mut candidates: Vec<MefCluster> = mef::get_by_viaf(conn, &record.pid)?;
    for (s, p) in &new_membership {
        for mut owner in mef::get_by_source(conn, family, *s, p)? {
            if candidates.iter().any(|c| c.pid == owner.pid) {
                continue;
            }
            match owner.viaf_pid.clone() {
                None => {
                    owner.viaf_pid = Some(record.pid.clone());
                    candidates.push(owner);
                }
                Some(ref v) if v == &record.pid => candidates.push(owner),
                Some(_) => {
                    // Claimed elsewhere: detach here, reattach below
                    detach_source(conn, &mut owner, *s)?;
                    ops.push(mef_op(&owner, base_url));
                }
            }
        }
    }

    let mut created_cluster = false;
    if candidates.is_empty() {
        // The cross-walk may precede every source record; the cluster is
        // created anyway so the VIAF pid resolves
        let mut c = mef::create(conn, family)?;
        c.viaf_pid = Some(record.pid.clone());
        candidates.push(c);
        created_cluster = true;
    }

    // 5. Merge: lowest pid survives
    candidates.sort_by_key(|c| c.pid_number());
    let mut survivor = candidates.remove(0);
    let mut vacated: BTreeSet<(SourceName, String)> = BTreeSet::new();
    for mut loser in candidates {
        info!(
            survivor = %survivor.pid,
            loser = %loser.pid,
            viaf = %record.pid,
            "Merging clusters"
        );
        for (s, p) in loser.source_refs() {
            if survivor.source_ref(s).is_none() {
                survivor.set_source_ref(s, Some(p));
            } else if survivor.source_ref(s) != Some(p.as_str()) {
                vacated.insert((s, p));
            }
            loser.set_source_ref(s, None);
        }
        loser.viaf_pid = None;
        loser.deleted = Some(now_rfc3339());
        mef::save(conn, &mut loser)?;
        ops.push(mef_op(&loser, base_url));
    }

    // 4. + invariant 2: survivor references exactly the non-dangling
    // membership; anything else moves to a standalone cluster
    for s in family.sources() {
        let declared = record.source_pid(*s);
        let current = survivor.source_ref(*s).map(str::to_string);
        match declared {
            Some(p) => {
                let Some(kind) = family.source_kind(*s) else {
                    continue;
                };
                let live = source::get(conn, kind, p)?
                    .map(|r| !r.is_deleted())
                    .unwrap_or(false);
                if let Some(cur) = current {
                    if cur != p {
                        vacated.insert((*s, cur));
                    }
                }
                survivor.set_source_ref(*s, live.then(|| p.to_string()));
            }
            None => {
                if let Some(cur) = current {
                    vacated.insert((*s, cur.clone()));
                    survivor.set_source_ref(*s, None);
                }
            }
        }
    }
    for (s, p) in old_membership.difference(&new_membership) {
        vacated.insert((*s, p.clone()));
    }

    survivor.viaf_pid = Some(record.pid.clone());
    finalize_cluster(conn, &mut survivor)?;
    mef::save(conn, &mut survivor)?;
    ops.push(mef_op(&survivor, base_url));

    // Sources no longer covered by any cross-walk own standalone clusters
    for (s, p) in vacated {
        if new_membership.contains(&(s, p.clone())) {
            continue;
        }
        if let Some(standalone) = create_singleton(conn, family, s, &p)? {
            ops.push(mef_op(&standalone, base_url));
        }
    }

    Ok(Effects {
        report: EngineReport {
            source: None,
            mef: if created_cluster {
                MefAction::Created
            } else {
                MefAction::Updated
            },
            cluster_pid: Some(survivor.pid.clone()),
        },
        ops,
    })
}

fn apply_viaf_delete(
    conn: &Connection,
    viaf_pid: &str,
    event_id: &str,
    base_url: &str,
) -> Result<Effects> {
    let family = Family::Agent;
    let mut ops: Vec<IndexOp> = Vec::new();

    let removed = viaf::delete(conn, viaf_pid)?;
    if removed.is_some() {
        ops.push(IndexOp::Delete {
            kind: EntityKind::AgentViaf,
            pid: viaf_pid.to_string(),
        });
    }

    let clusters = mef::get_by_viaf(conn, viaf_pid)?;
    if removed.is_none() && clusters.is_empty() {
        return Ok(Effects {
            report: EngineReport {
                source: None,
                mef: MefAction::UpToDate,
                cluster_pid: None,
            },
            ops,
        });
    }

    let mut last_pid = None;
    for mut cluster in clusters {
        let refs = cluster.source_refs();
        event_log::append(
            conn,
            event_id,
            family.mef_kind(),
            &cluster.pid,
            Severity::Info,
            &format!("Split after VIAF {} deletion", viaf_pid),
        )?;

        // Vacate the cluster, then give every source its own singleton
        cluster.viaf_pid = None;
        for (s, _) in &refs {
            cluster.set_source_ref(*s, None);
        }
        cluster.deleted = Some(now_rfc3339());
        mef::save(conn, &mut cluster)?;
        ops.push(mef_op(&cluster, base_url));
        last_pid = Some(cluster.pid.clone());

        for (s, p) in refs {
            if let Some(standalone) = create_singleton(conn, family, s, &p)? {
                ops.push(mef_op(&standalone, base_url));
            }
        }
    }

    Ok(Effects {
        report: EngineReport {
            source: None,
            mef: MefAction::Deleted,
            cluster_pid: last_pid,
        },
        ops,
    })
}
