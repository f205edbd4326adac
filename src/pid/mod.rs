//! Persistent identifier registry
//!
//! Mints, resolves, redirects and deletes pids per entity kind. Source and
//! VIAF values are source-assigned; MEF values come from a per-family
//! monotonic counter.

pub mod registry;

pub use registry::{
    list, mark_deleted, mint, reactivate, redirect, register, resolve, PidRow, PidStatus,
};
