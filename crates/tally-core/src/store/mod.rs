//! Local transaction store
//!
//! Durable, indexed persistence for transaction records. This layer never
//! touches the network: storage faults surface synchronously as [`Error`],
//! and there is no remote-error category here. The sync status rules of the
//! record state machine live in `SyncStatus`; this store only executes them.

use chrono::NaiveDate;
use libsql::{params, Connection, Value};

use crate::error::{Error, Result};
use crate::models::{
    DeleteAction, NewTransaction, Owner, OwnerId, OwnerMode, SyncConflict, SyncStatus, Transaction,
    TransactionId, TransactionPatch,
};
use crate::remote::RemoteTransaction;

const TRANSACTION_COLUMNS: &str = "id, server_id, owner_id, date, category, description, \
     amount_minor, kind, merchant, sync_status, local_created_at, local_updated_at, \
     remote_updated_at, is_archived";

/// How recording a push result landed relative to the local record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The record still matched the pushed snapshot and is now `Synced`
    Synced,
    /// The record changed while the push was in flight; the server linkage
    /// was recorded but the newer change keeps its pending status
    Superseded,
    /// The record was removed while the push was in flight; the server row
    /// is now orphaned and should be deleted by the caller
    Missing,
}

/// libSQL-backed store for transaction records and sync bookkeeping
#[derive(Clone)]
pub struct TransactionStore {
    conn: Connection,
}

impl TransactionStore {
    /// Create a store over an open database connection
    #[must_use]
    pub const fn new(conn: Connection) -> Self {
        Self { conn }
    }

    // -- CRUD ---------------------------------------------------------------

    /// Create a new local-only record; cannot fail due to network
    pub async fn create(&self, owner: &OwnerId, dto: NewTransaction) -> Result<Transaction> {
        let tx = Transaction::new(owner.clone(), dto);
        self.insert(&tx).await?;
        Ok(tx)
    }

    /// Materialise a downloaded remote row as a fresh `Synced` local record
    pub async fn insert_remote(
        &self,
        owner: &OwnerId,
        row: &RemoteTransaction,
    ) -> Result<Transaction> {
        let now = now_ms();
        let tx = Transaction {
            id: TransactionId::new(),
            server_id: Some(row.id.clone()),
            owner_id: owner.clone(),
            date: row.date,
            category: row.category.clone(),
            description: row.description.clone(),
            amount_minor: row.amount_minor,
            kind: row.kind,
            merchant: row.merchant.clone(),
            sync_status: SyncStatus::Synced,
            local_created_at: now,
            local_updated_at: now,
            remote_updated_at: Some(row.updated_at),
            is_archived: row.is_archived,
        };
        self.insert(&tx).await?;
        Ok(tx)
    }

    /// Look a record up by its local id
    pub async fn get(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1"),
                params![id.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_transaction(&row)?)),
            None => Ok(None),
        }
    }

    /// Look a record up by the server-assigned identifier
    pub async fn get_by_server_id(
        &self,
        owner: &OwnerId,
        server_id: &str,
    ) -> Result<Option<Transaction>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions
                     WHERE owner_id = ?1 AND server_id = ?2"
                ),
                params![owner.as_str(), server_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(parse_transaction(&row)?)),
            None => Ok(None),
        }
    }

    /// Merge a partial edit into a record.
    ///
    /// Bumps `local_updated_at` and demotes `Synced` to `PendingUpload`.
    /// Edits on `PendingDelete` records are rejected: the queued deletion
    /// must not be resurrected.
    pub async fn update(&self, id: &TransactionId, patch: &TransactionPatch) -> Result<Transaction> {
        let mut tx = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let Some(next_status) = tx.sync_status.after_local_edit() else {
            return Err(Error::PendingDelete(id.to_string()));
        };

        patch.apply_to(&mut tx);
        tx.sync_status = next_status;
        tx.local_updated_at = next_clock(tx.local_updated_at);

        self.conn
            .execute(
                "UPDATE transactions SET
                    date = ?2, category = ?3, description = ?4, amount_minor = ?5,
                    kind = ?6, merchant = ?7, sync_status = ?8, local_updated_at = ?9,
                    is_archived = ?10
                 WHERE id = ?1",
                params![
                    tx.id.as_str(),
                    tx.date.to_string(),
                    tx.category.as_str(),
                    tx.description.as_str(),
                    tx.amount_minor,
                    tx.kind.as_str(),
                    opt_text(tx.merchant.as_deref()),
                    tx.sync_status.as_str(),
                    tx.local_updated_at,
                    i64::from(tx.is_archived),
                ],
            )
            .await?;

        Ok(tx)
    }

    /// Delete a record through the status state machine.
    ///
    /// A record the server never saw is removed immediately; anything else is
    /// kept as `PendingDelete` until a sync pass confirms the remote delete.
    pub async fn delete(&self, id: &TransactionId) -> Result<DeleteAction> {
        let tx = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let action = tx.sync_status.on_delete();
        match action {
            DeleteAction::HardDelete => {
                self.hard_delete(id).await?;
            }
            DeleteAction::Queue => {
                self.conn
                    .execute(
                        "UPDATE transactions
                         SET sync_status = ?2, local_updated_at = ?3
                         WHERE id = ?1",
                        params![
                            id.as_str(),
                            SyncStatus::PendingDelete.as_str(),
                            next_clock(tx.local_updated_at),
                        ],
                    )
                    .await?;
            }
        }
        Ok(action)
    }

    /// Unconditional physical removal; a missing id is a no-op, not an error
    pub async fn hard_delete(&self, id: &TransactionId) -> Result<bool> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM transactions WHERE id = ?1",
                params![id.as_str()],
            )
            .await?;
        Ok(affected > 0)
    }

    // -- Queries ------------------------------------------------------------

    /// All records for an owner, newest first; archived rows only when asked
    pub async fn list_for_owner(
        &self,
        owner: &OwnerId,
        include_archived: bool,
    ) -> Result<Vec<Transaction>> {
        let sql = if include_archived {
            format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE owner_id = ?1
                 ORDER BY date DESC, local_created_at DESC"
            )
        } else {
            format!(
                "SELECT {TRANSACTION_COLUMNS} FROM transactions
                 WHERE owner_id = ?1 AND is_archived = 0
                 ORDER BY date DESC, local_created_at DESC"
            )
        };
        let rows = self.conn.query(&sql, params![owner.as_str()]).await?;
        collect_transactions(rows).await
    }

    /// Records for an owner in any of the given statuses
    pub async fn list_by_status(
        &self,
        owner: &OwnerId,
        statuses: &[SyncStatus],
    ) -> Result<Vec<Transaction>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        // Statuses are static identifiers, safe to inline
        let set = statuses
            .iter()
            .map(|status| format!("'{}'", status.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions
                     WHERE owner_id = ?1 AND sync_status IN ({set})
                     ORDER BY local_created_at ASC"
                ),
                params![owner.as_str()],
            )
            .await?;
        collect_transactions(rows).await
    }

    /// Non-archived records for an owner with `from <= date <= to`
    pub async fn list_in_range(
        &self,
        owner: &OwnerId,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Transaction>> {
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM transactions
                     WHERE owner_id = ?1 AND is_archived = 0
                       AND date >= ?2 AND date <= ?3
                     ORDER BY date ASC, local_created_at ASC"
                ),
                params![owner.as_str(), from.to_string(), to.to_string()],
            )
            .await?;
        collect_transactions(rows).await
    }

    // -- Sync metadata ------------------------------------------------------

    /// Record a successful push: assign the server id, refresh
    /// `remote_updated_at`, and mark the record `Synced`.
    ///
    /// Guarded by the pushed snapshot's `local_updated_at`. If the record was
    /// edited after the snapshot was taken, the server linkage is still
    /// recorded (the server row exists either way, and losing the id would
    /// make the next pass create a duplicate) but the record keeps a pending
    /// status so the newer change is pushed as an update. A record removed
    /// during the push reports [`PushOutcome::Missing`] so the caller can
    /// take the orphaned server row back down.
    pub async fn mark_synced(
        &self,
        id: &TransactionId,
        server_id: &str,
        remote_updated_at: i64,
        pushed_local_updated_at: i64,
    ) -> Result<PushOutcome> {
        let affected = self
            .conn
            .execute(
                "UPDATE transactions
                 SET server_id = ?2, sync_status = ?3, remote_updated_at = ?4
                 WHERE id = ?1 AND local_updated_at = ?5",
                params![
                    id.as_str(),
                    server_id,
                    SyncStatus::Synced.as_str(),
                    remote_updated_at,
                    pushed_local_updated_at,
                ],
            )
            .await?;
        if affected > 0 {
            return Ok(PushOutcome::Synced);
        }

        // The snapshot is stale. Keep the newer edit (or queued deletion)
        // pending, but record the linkage so the next pass issues an update
        // or a delete against the existing server row
        let affected = self
            .conn
            .execute(
                "UPDATE transactions
                 SET server_id = ?2, remote_updated_at = ?3,
                     sync_status = CASE sync_status
                         WHEN 'pending_delete' THEN 'pending_delete'
                         ELSE 'pending_upload'
                     END
                 WHERE id = ?1",
                params![id.as_str(), server_id, remote_updated_at],
            )
            .await?;
        Ok(if affected > 0 {
            PushOutcome::Superseded
        } else {
            PushOutcome::Missing
        })
    }

    /// Overwrite a record's core fields with the remote copy (remote wins).
    ///
    /// Only valid for `Synced` records; the caller decides that via the
    /// conflict rules.
    pub async fn apply_remote(&self, id: &TransactionId, row: &RemoteTransaction) -> Result<()> {
        let tx = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.conn
            .execute(
                "UPDATE transactions SET
                    date = ?2, category = ?3, description = ?4, amount_minor = ?5,
                    kind = ?6, merchant = ?7, sync_status = ?8, local_updated_at = ?9,
                    remote_updated_at = ?10, is_archived = ?11
                 WHERE id = ?1",
                params![
                    id.as_str(),
                    row.date.to_string(),
                    row.category.as_str(),
                    row.description.as_str(),
                    row.amount_minor,
                    row.kind.as_str(),
                    opt_text(row.merchant.as_deref()),
                    SyncStatus::Synced.as_str(),
                    next_clock(tx.local_updated_at),
                    row.updated_at,
                    i64::from(row.is_archived),
                ],
            )
            .await?;
        Ok(())
    }

    /// Move every record of `from` to `to` and force it back to `Local`.
    ///
    /// This is the merge step: guest records were never linked to a server
    /// account under the new identity, so any `server_id` linkage is
    /// discarded and the records queue for (re-)upload. Returns the number
    /// of rows moved.
    pub async fn reassign_owner(&self, from: &OwnerId, to: &OwnerId) -> Result<u64> {
        let affected = self
            .conn
            .execute(
                "UPDATE transactions
                 SET owner_id = ?2, sync_status = ?3, server_id = NULL,
                     remote_updated_at = NULL, local_updated_at = ?4
                 WHERE owner_id = ?1",
                params![
                    from.as_str(),
                    to.as_str(),
                    SyncStatus::Local.as_str(),
                    now_ms(),
                ],
            )
            .await?;
        Ok(affected)
    }

    /// Number of records the remote store has not acknowledged yet
    pub async fn pending_count(&self, owner: &OwnerId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM transactions
                 WHERE owner_id = ?1 AND sync_status != 'synced'",
                params![owner.as_str()],
            )
            .await?;
        let count: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Recompute and persist the pending-changes count (UI signal)
    pub async fn refresh_pending(&self, owner: &OwnerId) -> Result<u64> {
        let count = self.pending_count(owner).await?;
        self.conn
            .execute(
                "INSERT INTO sync_state (owner_id, last_synced_at, pending_changes)
                 VALUES (?1, 0, ?2)
                 ON CONFLICT(owner_id) DO UPDATE SET pending_changes = excluded.pending_changes",
                params![owner.as_str(), i64::try_from(count).unwrap_or(i64::MAX)],
            )
            .await?;
        Ok(count)
    }

    /// Timestamp of the last completed sync pass, if any
    pub async fn last_synced_at(&self, owner: &OwnerId) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_synced_at FROM sync_state WHERE owner_id = ?1",
                params![owner.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let at: i64 = row.get(0)?;
                Ok((at > 0).then_some(at))
            }
            None => Ok(None),
        }
    }

    pub async fn set_last_synced_at(&self, owner: &OwnerId, at: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_state (owner_id, last_synced_at, pending_changes)
                 VALUES (?1, ?2, 0)
                 ON CONFLICT(owner_id) DO UPDATE SET last_synced_at = excluded.last_synced_at",
                params![owner.as_str(), at],
            )
            .await?;
        Ok(())
    }

    // -- Conflict log -------------------------------------------------------

    /// Record a declined remote overwrite for later inspection
    pub async fn record_conflict(
        &self,
        local: &Transaction,
        incoming: &RemoteTransaction,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_conflicts
                    (transaction_id, server_id, local_updated_at, incoming_updated_at, detected_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    local.id.as_str(),
                    incoming.id.as_str(),
                    local.local_updated_at,
                    incoming.updated_at,
                    now_ms(),
                ],
            )
            .await?;
        Ok(())
    }

    /// Most recent conflicts, newest first
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, transaction_id, server_id, local_updated_at,
                        incoming_updated_at, detected_at
                 FROM sync_conflicts
                 ORDER BY detected_at DESC, id DESC
                 LIMIT ?1",
                params![i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(SyncConflict {
                id: row.get(0)?,
                transaction_id: row.get(1)?,
                server_id: row.get(2)?,
                local_updated_at: row.get(3)?,
                incoming_updated_at: row.get(4)?,
                detected_at: row.get(5)?,
            });
        }
        Ok(conflicts)
    }

    // -- Owners -------------------------------------------------------------

    /// Insert or replace an owner identity
    pub async fn put_owner(&self, owner: &Owner) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO owners (id, mode, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET mode = excluded.mode",
                params![owner.id.as_str(), owner.mode.as_str(), owner.created_at],
            )
            .await?;
        Ok(())
    }

    pub async fn get_owner(&self, id: &OwnerId) -> Result<Option<Owner>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, mode, created_at FROM owners WHERE id = ?1",
                params![id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => {
                let id: String = row.get(0)?;
                let mode: String = row.get(1)?;
                Ok(Some(Owner {
                    id: OwnerId::from(id.as_str()),
                    mode: mode.parse::<OwnerMode>()?,
                    created_at: row.get(2)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Remove an owner identity; a missing id is a no-op
    pub async fn delete_owner(&self, id: &OwnerId) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM owners WHERE id = ?1", params![id.as_str()])
            .await?;
        Ok(affected > 0)
    }

    // -- Internal -----------------------------------------------------------

    async fn insert(&self, tx: &Transaction) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO transactions (
                    id, server_id, owner_id, date, category, description, amount_minor,
                    kind, merchant, sync_status, local_created_at, local_updated_at,
                    remote_updated_at, is_archived
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    tx.id.as_str(),
                    opt_text(tx.server_id.as_deref()),
                    tx.owner_id.as_str(),
                    tx.date.to_string(),
                    tx.category.as_str(),
                    tx.description.as_str(),
                    tx.amount_minor,
                    tx.kind.as_str(),
                    opt_text(tx.merchant.as_deref()),
                    tx.sync_status.as_str(),
                    tx.local_created_at,
                    tx.local_updated_at,
                    opt_int(tx.remote_updated_at),
                    i64::from(tx.is_archived),
                ],
            )
            .await?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Next value for a per-record local clock: wall time, but always strictly
/// greater than the previous value
fn next_clock(prev: i64) -> i64 {
    now_ms().max(prev + 1)
}

fn opt_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

const fn opt_int(value: Option<i64>) -> Value {
    match value {
        Some(int) => Value::Integer(int),
        None => Value::Null,
    }
}

async fn collect_transactions(mut rows: libsql::Rows) -> Result<Vec<Transaction>> {
    let mut transactions = Vec::new();
    while let Some(row) = rows.next().await? {
        transactions.push(parse_transaction(&row)?);
    }
    Ok(transactions)
}

fn parse_transaction(row: &libsql::Row) -> Result<Transaction> {
    let id: String = row.get(0)?;
    let owner_id: String = row.get(2)?;
    let date: String = row.get(3)?;
    let kind: String = row.get(7)?;
    let sync_status: String = row.get(9)?;

    Ok(Transaction {
        id: id
            .parse()
            .map_err(|_| Error::InvalidInput(format!("invalid transaction id: {id}")))?,
        server_id: nullable_text(row, 1)?,
        owner_id: OwnerId::from(owner_id.as_str()),
        date: date
            .parse::<NaiveDate>()
            .map_err(|_| Error::InvalidInput(format!("invalid date: {date}")))?,
        category: row.get(4)?,
        description: row.get(5)?,
        amount_minor: row.get(6)?,
        kind: kind.parse()?,
        merchant: nullable_text(row, 8)?,
        sync_status: sync_status.parse()?,
        local_created_at: row.get(10)?,
        local_updated_at: row.get(11)?,
        remote_updated_at: nullable_int(row, 12)?,
        is_archived: row.get::<i64>(13)? != 0,
    })
}

fn nullable_text(row: &libsql::Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(Error::InvalidInput(format!(
            "expected text at column {idx}, got {other:?}"
        ))),
    }
}

fn nullable_int(row: &libsql::Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(int) => Ok(Some(int)),
        other => Err(Error::InvalidInput(format!(
            "expected integer at column {idx}, got {other:?}"
        ))),
    }
}
