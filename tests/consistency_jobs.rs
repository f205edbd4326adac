//! Consistency job tests: gap detection and bulk rebuild determinism.

use std::sync::Arc;

use serde_json::json;

use mef_hub::db::Db;
use mef_hub::index::MemoryIndex;
use mef_hub::jobs;
use mef_hub::records::viaf::{self, ViafRecord};
use mef_hub::records::{mef, source};
use mef_hub::reconcile::ReconcileEngine;
use mef_hub::types::{EntityKind, Family, SourceName};

async fn engine() -> ReconcileEngine {
    let db = Db::open_in_memory().unwrap();
    db.init().await.unwrap();
    let index = Arc::new(MemoryIndex::new());
    ReconcileEngine::new(db, index, "https://mef.test/api".to_string())
}

fn person(pid: &str) -> serde_json::Value {
    json!({
        "pid": pid,
        "type": "bf:Person",
        "authorized_access_point": format!("Person {}", pid),
    })
}

/// Write source and VIAF records directly into the stores, bypassing the
/// engine, as a bulk snapshot load would.
async fn seed_stores(engine: &ReconcileEngine) {
    engine
        .db()
        .transaction(|conn| {
            for pid in ["g1", "g2"] {
                source::put(conn, EntityKind::AgentGnd, pid, &person(pid), None, None)?;
            }
            source::put(conn, EntityKind::AgentIdref, "i1", &person("i1"), None, None)?;
            source::put(conn, EntityKind::AgentRero, "r1", &person("r1"), None, None)?;
            viaf::put(
                conn,
                &ViafRecord::new("v1", Some("g1".into()), Some("i1".into()), None),
            )?;
            Ok(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn missing_clusters_lists_unattached_sources() {
    let engine = engine().await;
    seed_stores(&engine).await;

    let mut missing = jobs::missing_clusters(&engine, Family::Agent).await.unwrap();
    missing.sort();
    assert_eq!(
        missing,
        vec![
            (EntityKind::AgentGnd, "g1".to_string()),
            (EntityKind::AgentGnd, "g2".to_string()),
            (EntityKind::AgentIdref, "i1".to_string()),
            (EntityKind::AgentRero, "r1".to_string()),
        ]
    );

    let missing_viaf = jobs::missing_viaf_clusters(&engine).await.unwrap();
    assert_eq!(missing_viaf, vec!["v1"]);
}

#[tokio::test]
async fn rebuild_synthesizes_clusters_from_snapshots() {
    let engine = engine().await;
    seed_stores(&engine).await;

    let stats = jobs::rebuild_family(&engine, Family::Agent).await.unwrap();
    assert_eq!(stats.viaf_records, 1);
    assert_eq!(stats.source_records, 4);

    let clusters = engine
        .db()
        .read(|conn| mef::iterate(conn, Family::Agent, true))
        .await
        .unwrap();
    // One VIAF cluster (g1 + i1) and two singletons (g2, r1)
    assert_eq!(clusters.len(), 3);

    let linked = clusters
        .iter()
        .find(|c| c.viaf_pid.as_deref() == Some("v1"))
        .unwrap();
    assert_eq!(linked.gnd_pid.as_deref(), Some("g1"));
    assert_eq!(linked.idref_pid.as_deref(), Some("i1"));
    assert!(linked.rero_pid.is_none());

    assert!(clusters
        .iter()
        .any(|c| c.gnd_pid.as_deref() == Some("g2") && c.viaf_pid.is_none()));
    assert!(clusters
        .iter()
        .any(|c| c.rero_pid.as_deref() == Some("r1") && c.viaf_pid.is_none()));

    // Nothing is left unattached
    assert!(jobs::missing_clusters(&engine, Family::Agent)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn rebuild_is_idempotent_over_existing_clusters() {
    let engine = engine().await;
    seed_stores(&engine).await;

    jobs::rebuild_family(&engine, Family::Agent).await.unwrap();
    let first = engine
        .db()
        .read(|conn| mef::iterate(conn, Family::Agent, true))
        .await
        .unwrap();

    jobs::rebuild_family(&engine, Family::Agent).await.unwrap();
    let second = engine
        .db()
        .read(|conn| mef::iterate(conn, Family::Agent, true))
        .await
        .unwrap();

    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.pid, b.pid);
        assert_eq!(a.viaf_pid, b.viaf_pid);
        assert_eq!(a.source_refs(), b.source_refs());
    }
}

#[tokio::test]
async fn rebuild_applies_place_equivalences() {
    let engine = engine().await;
    engine
        .db()
        .transaction(|conn| {
            source::put(
                conn,
                EntityKind::PlaceGnd,
                "pg1",
                &json!({"pid": "pg1", "type": "bf:Place", "authorized_access_point": "Bern"}),
                None,
                None,
            )?;
            source::put(
                conn,
                EntityKind::PlaceIdref,
                "pi1",
                &json!({
                    "pid": "pi1",
                    "type": "bf:Place",
                    "authorized_access_point": "Bern",
                    "identifiedBy": [{"source": "GND", "value": "(DE-101)pg1"}],
                }),
                None,
                None,
            )?;
            Ok(())
        })
        .await
        .unwrap();

    jobs::rebuild_family(&engine, Family::Place).await.unwrap();

    let clusters = engine
        .db()
        .read(|conn| mef::iterate(conn, Family::Place, true))
        .await
        .unwrap();
    assert_eq!(clusters.len(), 1);
    assert_eq!(clusters[0].idref_pid.as_deref(), Some("pi1"));
    assert_eq!(clusters[0].gnd_pid.as_deref(), Some("pg1"));
}

#[tokio::test]
async fn replay_source_requires_stored_record() {
    let engine = engine().await;
    let err = jobs::replay_source(&engine, EntityKind::AgentGnd, "nope")
        .await
        .unwrap_err();
    assert!(matches!(err, mef_hub::types::MefError::NotFound(_)));
}

#[tokio::test]
async fn get_by_source_repair_on_duplicates() {
    let engine = engine().await;

    // Force an invariant 3.1 violation directly in the store
    engine
        .db()
        .transaction(|conn| {
            source::put(conn, EntityKind::AgentGnd, "g1", &person("g1"), None, None)?;
            let mut c1 = mef::create(conn, Family::Agent)?;
            c1.gnd_pid = Some("g1".into());
            mef::save(conn, &mut c1)?;
            let mut c2 = mef::create(conn, Family::Agent)?;
            c2.gnd_pid = Some("g1".into());
            mef::save(conn, &mut c2)?;
            Ok(())
        })
        .await
        .unwrap();

    // The next write event repairs the duplicate
    jobs::replay_source(&engine, EntityKind::AgentGnd, "g1")
        .await
        .unwrap();

    let owners = engine
        .db()
        .read(|conn| mef::get_by_source(conn, Family::Agent, SourceName::Gnd, "g1"))
        .await
        .unwrap();
    assert_eq!(owners.len(), 1);
}
