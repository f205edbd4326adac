//! Configuration
//!
//! CLI arguments and environment variable handling using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::harvest::HarvestCursor;
use crate::types::EntityKind;

/// mef-hub - Multilingual Entity File reconciliation service
#[derive(Parser, Debug, Clone)]
#[command(name = "mef-hub")]
#[command(about = "Reconciles authority records from GND, IDREF, RERO and VIAF into MEF clusters")]
pub struct Args {
    /// Path to the SQLite primary store
    #[arg(long, env = "MEF_DB", default_value = "mef-hub.db")]
    pub db_path: PathBuf,

    /// Base URL used when rendering $ref links in index documents
    #[arg(long, env = "MEF_BASE_URL", default_value = "https://mef.rero.ch/api")]
    pub base_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create or migrate the database schema
    InitDb {
        /// Also seed the default harvest cursor configuration
        #[arg(long)]
        with_defaults: bool,
    },

    /// Harvest one or all configured OAI sources
    Harvest {
        /// Cursor name to harvest
        #[arg(long, conflicts_with = "all")]
        source: Option<String>,

        /// Harvest every configured source
        #[arg(long)]
        all: bool,
    },

    /// Build or refresh MEF clusters from stored source records
    CreateMefFromSource {
        /// Source kind, e.g. agent-gnd
        kind: String,

        /// Source pids to replay (omit with --missing)
        pids: Vec<String>,

        /// Replay every live source record without a cluster
        #[arg(long)]
        missing: bool,

        /// Fetch the record from its direct endpoint before replaying
        #[arg(long)]
        online: bool,
    },

    /// Build or refresh MEF clusters from stored VIAF records
    CreateMefFromViaf {
        /// VIAF pids to replay (omit with --missing)
        pids: Vec<String>,

        /// Replay every VIAF record without a cluster
        #[arg(long)]
        missing: bool,
    },

    /// Push store documents missing from the secondary index
    ReindexMissing {
        /// Kinds to check, comma separated; defaults to all
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<String>,
    },

    /// Print the divergence report as JSON
    Monitor {
        /// Number of event-log entries to include
        #[arg(long, default_value = "20")]
        log_tail: u32,
    },

    /// Load or export bulk CSV files for one MEF family
    BulkLoad {
        /// Family: agent, concept or place
        #[arg(long)]
        family: String,

        /// Directory holding pidstore.csv, metadata.csv, ids.csv
        #[arg(long)]
        dir: PathBuf,

        /// Export instead of load
        #[arg(long)]
        export: bool,
    },
}

/// Default harvest cursor configuration, one per source kind
pub fn default_cursors() -> Vec<HarvestCursor> {
    let cursor = |name: &str, kind: EntityKind, base_url: &str, prefix: &str, set: Option<&str>| {
        HarvestCursor {
            name: name.to_string(),
            kind,
            base_url: base_url.to_string(),
            metadata_prefix: prefix.to_string(),
            set_spec: set.map(str::to_string),
            access_token: None,
            last_run: None,
        }
    };
    vec![
        cursor(
            "agent-gnd",
            EntityKind::AgentGnd,
            "https://services.dnb.de/oai/repository",
            "MARC21-xml",
            Some("authorities:person"),
        ),
        cursor(
            "agent-idref",
            EntityKind::AgentIdref,
            "https://www.idref.fr/OAI/oai.jsp",
            "marc21",
            Some("a"),
        ),
        cursor(
            "agent-rero",
            EntityKind::AgentRero,
            "https://bib.rero.ch/oai",
            "marc21",
            None,
        ),
        cursor(
            "concept-idref",
            EntityKind::ConceptIdref,
            "https://www.idref.fr/OAI/oai.jsp",
            "marc21",
            Some("f"),
        ),
        cursor(
            "concept-rero",
            EntityKind::ConceptRero,
            "https://bib.rero.ch/oai",
            "marc21",
            None,
        ),
        cursor(
            "place-idref",
            EntityKind::PlaceIdref,
            "https://www.idref.fr/OAI/oai.jsp",
            "marc21",
            Some("g"),
        ),
        cursor(
            "place-gnd",
            EntityKind::PlaceGnd,
            "https://services.dnb.de/oai/repository",
            "MARC21-xml",
            Some("authorities:geografikum"),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_default_cursors_cover_all_source_kinds() {
        let cursors = default_cursors();
        for kind in EntityKind::ALL {
            if kind.role() == Role::Source {
                assert!(
                    cursors.iter().any(|c| c.kind == kind),
                    "no default cursor for {}",
                    kind
                );
            }
        }
    }

    #[test]
    fn test_args_parse_harvest() {
        let args =
            Args::try_parse_from(["mef-hub", "harvest", "--source", "agent-gnd"]).unwrap();
        match args.command {
            Command::Harvest { source, all } => {
                assert_eq!(source.as_deref(), Some("agent-gnd"));
                assert!(!all);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
