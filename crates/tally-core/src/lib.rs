//! tally-core - Core library for Tally
//!
//! This crate contains the shared models, local database layer, and the
//! offline-first synchronization engine used by all Tally interfaces.
//!
//! Writes always commit to the local store first; the remote store is
//! reconciled on demand by [`sync::SyncEngine`] and best-effort mirrored by
//! [`router::DataRouter`].

pub mod db;
pub mod error;
pub mod merge;
pub mod models;
pub mod remote;
pub mod router;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
pub use models::{
    OwnerContext, OwnerId, OwnerMode, SyncReport, SyncStatus, Transaction, TransactionId,
    TransactionKind,
};
