//! mef-hub - Multilingual Entity File reconciliation service

use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mef_hub::config::{default_cursors, Args, Command};
use mef_hub::db::Db;
use mef_hub::harvest::{self, direct, transform, DirectConfig, Harvester};
use mef_hub::index::{mef_document, source_document, viaf_document, IndexOp, MemoryIndex, SecondaryIndex};
use mef_hub::jobs;
use mef_hub::monitor;
use mef_hub::records::{mef, source, viaf};
use mef_hub::reconcile::ReconcileEngine;
use mef_hub::types::{EntityKind, Family, MefError, Result, Role};

fn main() -> ExitCode {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("mef_hub={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("======================================");
    info!("  mef-hub - Multilingual Entity File");
    info!("======================================");
    info!("Database: {}", args.db_path.display());
    info!("Base URL: {}", args.base_url);

    let db = Db::open(&args.db_path)?;
    db.init().await?;

    let index: Arc<dyn SecondaryIndex> = Arc::new(MemoryIndex::new());
    let engine = Arc::new(ReconcileEngine::new(
        db.clone(),
        Arc::clone(&index),
        args.base_url.clone(),
    ));

    match args.command.clone() {
        Command::InitDb { with_defaults } => {
            if with_defaults {
                let cursors = default_cursors();
                db.transaction(|conn| {
                    for cursor in &cursors {
                        harvest::cursor::save(conn, cursor)?;
                    }
                    Ok(())
                })
                .await?;
                info!("Seeded {} default harvest cursors", cursors.len());
            }
            info!("Database initialized");
            Ok(())
        }

        Command::Harvest { source, all } => {
            let harvester = Harvester::new(db.clone(), Arc::clone(&engine));
            let stats = match (source, all) {
                (Some(name), _) => harvester.harvest(&name).await?,
                (None, true) => harvester.harvest_all().await?,
                (None, false) => {
                    return Err(MefError::Config(
                        "harvest needs --source <name> or --all".into(),
                    ))
                }
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }

        Command::CreateMefFromSource {
            kind,
            pids,
            missing,
            online,
        } => {
            let kind = EntityKind::from_str(&kind)?;
            if kind.role() != Role::Source {
                return Err(MefError::Config(format!(
                    "{} is not a source kind",
                    kind
                )));
            }
            let targets: Vec<String> = if missing {
                jobs::missing_clusters(&engine, kind.family())
                    .await?
                    .into_iter()
                    .filter(|(k, _)| *k == kind)
                    .map(|(_, p)| p)
                    .collect()
            } else if pids.is_empty() {
                return Err(MefError::Config(
                    "create-mef-from-source needs pids or --missing".into(),
                ));
            } else {
                pids
            };

            let mut processed = 0u64;
            for pid in &targets {
                if online {
                    fetch_and_ingest(&engine, kind, pid).await?;
                } else {
                    jobs::replay_source(&engine, kind, pid).await?;
                }
                processed += 1;
            }
            info!(kind = %kind, processed, "create-mef-from-source complete");
            Ok(())
        }

        Command::CreateMefFromViaf { pids, missing } => {
            let targets: Vec<String> = if missing {
                jobs::missing_viaf_clusters(&engine).await?
            } else if pids.is_empty() {
                return Err(MefError::Config(
                    "create-mef-from-viaf needs pids or --missing".into(),
                ));
            } else {
                pids
            };

            let mut processed = 0u64;
            for viaf_pid in &targets {
                let record = db
                    .read(|conn| viaf::get(conn, viaf_pid))
                    .await?
                    .ok_or_else(|| {
                        MefError::NotFound(format!("VIAF record {}", viaf_pid))
                    })?;
                engine.ingest_viaf(record).await?;
                processed += 1;
            }
            info!(processed, "create-mef-from-viaf complete");
            Ok(())
        }

        Command::ReindexMissing { kinds } => {
            let kinds: Vec<EntityKind> = if kinds.is_empty() {
                EntityKind::ALL.to_vec()
            } else {
                kinds
                    .iter()
                    .map(|k| EntityKind::from_str(k))
                    .collect::<Result<Vec<_>>>()?
            };
            let pushed = reindex_missing(&db, index.as_ref(), &args.base_url, &kinds).await?;
            info!(pushed, "reindex-missing complete");
            Ok(())
        }

        Command::Monitor { log_tail } => {
            let report = monitor::report(&db, index.as_ref(), log_tail).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.has_findings() {
                Err(MefError::Conflict("divergences found".into()))
            } else {
                Ok(())
            }
        }

        Command::BulkLoad {
            family,
            dir,
            export,
        } => {
            let family = parse_family(&family)?;
            let stats = if export {
                jobs::export_family(&db, family, &dir).await?
            } else {
                jobs::load_family(&db, family, &dir).await?
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

fn parse_family(s: &str) -> Result<Family> {
    match s {
        "agent" => Ok(Family::Agent),
        "concept" => Ok(Family::Concept),
        "place" => Ok(Family::Place),
        other => Err(MefError::Config(format!("Unknown family: {}", other))),
    }
}

/// Fetch one record from its direct endpoint and run it through the engine
async fn fetch_and_ingest(
    engine: &ReconcileEngine,
    kind: EntityKind,
    pid: &str,
) -> Result<()> {
    let sourcename = kind
        .source()
        .ok_or_else(|| MefError::Config(format!("{} has no direct endpoint", kind)))?;
    let client = harvest::OaiClient::new();
    let config = DirectConfig::default();

    let marc = direct::fetch_source(&client, &config, sourcename, pid)
        .await?
        .ok_or_else(|| MefError::NotFound(format!("{} {} at source endpoint", kind, pid)))?;
    let out = transform(kind, &marc, Some(pid))?;
    engine
        .ingest_source(kind, &out.pid, out.payload, out.deleted, out.relation)
        .await?;
    Ok(())
}

/// Push primary-store documents missing from the index
async fn reindex_missing(
    db: &Db,
    index: &dyn SecondaryIndex,
    base_url: &str,
    kinds: &[EntityKind],
) -> Result<u64> {
    let mut ops: Vec<IndexOp> = Vec::new();

    for kind in kinds {
        let kind = *kind;
        let indexed = index.ids(kind).await?;
        let missing_ops = db
            .read(|conn| {
                let mut out: Vec<IndexOp> = Vec::new();
                match kind.role() {
                    Role::Source => {
                        for record in source::iterate(conn, kind, None)? {
                            if !indexed.contains(&record.pid) {
                                out.push(IndexOp::Upsert {
                                    kind,
                                    pid: record.pid.clone(),
                                    document: source_document(&record),
                                });
                            }
                        }
                    }
                    Role::Crosswalk => {
                        for record in viaf::iterate(conn)? {
                            if !indexed.contains(&record.pid) {
                                out.push(IndexOp::Upsert {
                                    kind,
                                    pid: record.pid.clone(),
                                    document: viaf_document(&record),
                                });
                            }
                        }
                    }
                    Role::Mef => {
                        for cluster in mef::iterate(conn, kind.family(), false)? {
                            if !indexed.contains(&cluster.pid) {
                                out.push(IndexOp::Upsert {
                                    kind,
                                    pid: cluster.pid.clone(),
                                    document: mef_document(&cluster, base_url),
                                });
                            }
                        }
                    }
                }
                Ok(out)
            })
            .await?;
        ops.extend(missing_ops);
    }

    let pushed = ops.len() as u64;
    if !ops.is_empty() {
        index.bulk(ops).await?;
    }
    Ok(pushed)
}
