//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::types::Result;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!(
            "Migrating schema from v{} to v{}",
            current_version, SCHEMA_VERSION
        );
        migrate_schema(conn, current_version)?;
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?)",
        [version],
    )?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(PID_SCHEMA)?;
    conn.execute_batch(RECORD_SCHEMA)?;
    conn.execute_batch(HARVEST_SCHEMA)?;
    conn.execute_batch(INDEXES_SCHEMA)?;
    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, _from_version: i32) -> Result<()> {
    // Migration steps go here as the schema evolves
    set_schema_version(conn, SCHEMA_VERSION)
}

/// Persistent identifiers and counters
const PID_SCHEMA: &str = r#"
-- One row per (kind, value). Source and VIAF pids are never physically
-- removed; status moves between registered, redirected and deleted.
CREATE TABLE IF NOT EXISTS pids (
    kind TEXT NOT NULL,
    value TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'registered',
    target TEXT,
    object_uuid TEXT NOT NULL,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    PRIMARY KEY (kind, value)
);

-- Monotonic counters for minted MEF pids, one per family
CREATE TABLE IF NOT EXISTS id_counters (
    family TEXT PRIMARY KEY NOT NULL,
    next INTEGER NOT NULL DEFAULT 1
);
"#;

/// Source records, VIAF cross-walks and MEF clusters
const RECORD_SCHEMA: &str = r#"
-- Normalized authority records as issued by a provider.
-- Deletion is logical: the payload is retained for historical resolution.
CREATE TABLE IF NOT EXISTS source_records (
    kind TEXT NOT NULL,
    pid TEXT NOT NULL,
    uuid TEXT NOT NULL,
    payload TEXT NOT NULL,
    md5 TEXT NOT NULL,
    deleted TEXT,
    relation_type TEXT,
    relation_value TEXT,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (kind, pid)
);

-- VIAF cross-walk, agents only. Physical deletion allowed.
CREATE TABLE IF NOT EXISTS viaf_records (
    pid TEXT PRIMARY KEY NOT NULL,
    gnd_pid TEXT,
    idref_pid TEXT,
    rero_pid TEXT,
    uuid TEXT NOT NULL,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1
);

-- Unified cluster per real-world entity, one table across families
CREATE TABLE IF NOT EXISTS mef_clusters (
    family TEXT NOT NULL,
    pid TEXT NOT NULL,
    uuid TEXT NOT NULL,
    viaf_pid TEXT,
    gnd_pid TEXT,
    idref_pid TEXT,
    rero_pid TEXT,
    record_type TEXT,
    deleted TEXT,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (family, pid)
);

-- Structured per-record event log: validation failures, conflicts,
-- records flagged for manual review
CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    pid TEXT NOT NULL,
    severity TEXT NOT NULL,
    message TEXT NOT NULL,
    created TEXT NOT NULL
);
"#;

/// Harvest cursors, one per configured OAI source
const HARVEST_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS harvest_cursors (
    name TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    base_url TEXT NOT NULL,
    metadata_prefix TEXT NOT NULL,
    set_spec TEXT,
    access_token TEXT,
    last_run TEXT
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_pids_status ON pids(kind, status);
CREATE INDEX IF NOT EXISTS idx_source_updated ON source_records(kind, updated);
CREATE INDEX IF NOT EXISTS idx_viaf_gnd ON viaf_records(gnd_pid);
CREATE INDEX IF NOT EXISTS idx_viaf_idref ON viaf_records(idref_pid);
CREATE INDEX IF NOT EXISTS idx_viaf_rero ON viaf_records(rero_pid);
CREATE INDEX IF NOT EXISTS idx_mef_viaf ON mef_clusters(family, viaf_pid);
CREATE INDEX IF NOT EXISTS idx_mef_gnd ON mef_clusters(family, gnd_pid);
CREATE INDEX IF NOT EXISTS idx_mef_idref ON mef_clusters(family, idref_pid);
CREATE INDEX IF NOT EXISTS idx_mef_rero ON mef_clusters(family, rero_pid);
CREATE INDEX IF NOT EXISTS idx_event_log_record ON event_log(kind, pid);
"#;
