//! Data models for Tally

mod analytics;
mod conflict;
mod owner;
mod report;
mod transaction;

pub use analytics::{AnalyticsSummary, CategoryTotal};
pub use conflict::SyncConflict;
pub use owner::{Owner, OwnerContext, OwnerId, OwnerMode};
pub use report::SyncReport;
pub use transaction::{
    DeleteAction, NewTransaction, SyncStatus, Transaction, TransactionId, TransactionKind,
    TransactionPatch,
};
