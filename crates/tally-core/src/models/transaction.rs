//! Transaction model and sync status state machine

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;
use crate::models::OwnerId;

/// A unique local identifier for a transaction, using UUID v7 (time-sortable)
///
/// Assigned once at creation and never reused; it identifies the record for
/// its entire local lifetime regardless of any server-side identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new unique transaction ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Whether a transaction is money in or money out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Income,
    Expense,
}

impl TransactionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
        }
    }
}

impl FromStr for TransactionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            other => Err(Error::InvalidInput(format!(
                "unknown transaction kind: {other}"
            ))),
        }
    }
}

/// Where a record stands relative to the remote store.
///
/// Transitions form a DAG: `Local -> Synced` (first upload),
/// `Synced -> PendingUpload` (local edit), `PendingUpload -> Synced`
/// (re-upload), `Synced | PendingUpload -> PendingDelete` (deferred delete).
/// `Local` records are hard-deleted directly, and nothing ever leaves
/// `PendingDelete` except physical removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Created locally, never acknowledged by the remote store
    Local,
    /// Remote copy matches the last pushed state
    Synced,
    /// Edited locally after a successful sync; re-upload needed
    PendingUpload,
    /// Deleted locally; remote deletion deferred to the next sync pass
    PendingDelete,
}

/// What `delete` must do for a record in a given status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteAction {
    /// Never reached the server: remove the row immediately
    HardDelete,
    /// Known to the server: keep the row and queue the remote delete
    Queue,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Synced => "synced",
            Self::PendingUpload => "pending_upload",
            Self::PendingDelete => "pending_delete",
        }
    }

    /// Status after a local edit, or `None` when the edit must be rejected.
    ///
    /// A `Synced` record gains an un-pushed edit and demotes to
    /// `PendingUpload`; already un-synced records keep their status. Edits on
    /// `PendingDelete` are rejected so a queued deletion is never resurrected.
    #[must_use]
    pub const fn after_local_edit(self) -> Option<Self> {
        match self {
            Self::Local => Some(Self::Local),
            Self::Synced | Self::PendingUpload => Some(Self::PendingUpload),
            Self::PendingDelete => None,
        }
    }

    /// The single transition function behind `delete`
    #[must_use]
    pub const fn on_delete(self) -> DeleteAction {
        match self {
            Self::Local => DeleteAction::HardDelete,
            Self::Synced | Self::PendingUpload | Self::PendingDelete => DeleteAction::Queue,
        }
    }

    /// True when the record carries a change the remote store has not seen
    #[must_use]
    pub const fn is_pending(self) -> bool {
        !matches!(self, Self::Synced)
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "synced" => Ok(Self::Synced),
            "pending_upload" => Ok(Self::PendingUpload),
            "pending_delete" => Ok(Self::PendingDelete),
            other => Err(Error::InvalidInput(format!("unknown sync status: {other}"))),
        }
    }
}

/// A financial transaction as stored locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Local identifier, immutable for the record's lifetime
    pub id: TransactionId,
    /// Server-assigned identifier, set at most once on first upload
    pub server_id: Option<String>,
    /// Owning guest or authenticated identity
    pub owner_id: OwnerId,
    /// Transaction date
    pub date: NaiveDate,
    /// Spending/income category
    pub category: String,
    /// Free-form description
    pub description: String,
    /// Amount in minor currency units (always positive; sign comes from `kind`)
    pub amount_minor: i64,
    pub kind: TransactionKind,
    pub merchant: Option<String>,
    pub sync_status: SyncStatus,
    /// Local clock, unix ms; authoritative for intra-client ordering
    pub local_created_at: i64,
    /// Local clock, unix ms; monotonically non-decreasing per record
    pub local_updated_at: i64,
    /// Last known server timestamp, used only for conflict comparison
    pub remote_updated_at: Option<i64>,
    pub is_archived: bool,
}

/// Fields required to create a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub date: NaiveDate,
    pub category: String,
    pub description: String,
    pub amount_minor: i64,
    pub kind: TransactionKind,
    pub merchant: Option<String>,
}

/// Partial update; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionPatch {
    pub date: Option<NaiveDate>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub amount_minor: Option<i64>,
    pub kind: Option<TransactionKind>,
    pub merchant: Option<Option<String>>,
    pub is_archived: Option<bool>,
}

impl TransactionPatch {
    /// True when the patch changes nothing
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.category.is_none()
            && self.description.is_none()
            && self.amount_minor.is_none()
            && self.kind.is_none()
            && self.merchant.is_none()
            && self.is_archived.is_none()
    }

    /// Merge the patch into a record's core fields
    pub fn apply_to(&self, tx: &mut Transaction) {
        if let Some(date) = self.date {
            tx.date = date;
        }
        if let Some(category) = &self.category {
            tx.category.clone_from(category);
        }
        if let Some(description) = &self.description {
            tx.description.clone_from(description);
        }
        if let Some(amount) = self.amount_minor {
            tx.amount_minor = amount;
        }
        if let Some(kind) = self.kind {
            tx.kind = kind;
        }
        if let Some(merchant) = &self.merchant {
            tx.merchant.clone_from(merchant);
        }
        if let Some(archived) = self.is_archived {
            tx.is_archived = archived;
        }
    }
}

impl Transaction {
    /// Create a new local-only transaction owned by `owner_id`
    #[must_use]
    pub fn new(owner_id: OwnerId, dto: NewTransaction) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: TransactionId::new(),
            server_id: None,
            owner_id,
            date: dto.date,
            category: dto.category,
            description: dto.description,
            amount_minor: dto.amount_minor,
            kind: dto.kind,
            merchant: dto.merchant,
            sync_status: SyncStatus::Local,
            local_created_at: now,
            local_updated_at: now,
            remote_updated_at: None,
            is_archived: false,
        }
    }

    /// Signed amount in minor units (expenses negative)
    #[must_use]
    pub const fn signed_amount_minor(&self) -> i64 {
        match self.kind {
            TransactionKind::Income => self.amount_minor,
            TransactionKind::Expense => -self.amount_minor,
        }
    }
}
