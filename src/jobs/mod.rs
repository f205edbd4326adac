//! Consistency jobs
//!
//! Bulk rebuild, gap detection and CSV bulk load/export over the primary
//! store.

pub mod bulk;
pub mod rebuild;

pub use bulk::{export_family, load_family, BulkStats};
pub use rebuild::{
    missing_clusters, missing_viaf_clusters, rebuild_family, replay_source, RebuildStats,
};
