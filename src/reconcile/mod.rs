//! Reconciliation engine
//!
//! Decides, as source records and VIAF cross-walks arrive, how MEF clusters
//! are created, split, merged, redirected and marked deleted.

pub mod engine;
pub mod locks;

pub use engine::{EngineReport, MefAction, ReconcileEngine};
pub use locks::ClusterLocks;
