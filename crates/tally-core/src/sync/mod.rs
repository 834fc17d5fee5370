//! On-demand reconciliation between the local store and the remote store
//!
//! A sync pass runs four phases — upload, deletion, download, bookkeeping —
//! and always runs all of them: a failing record is reported in the
//! [`SyncReport`] and retried on the next pass, never allowed to abort the
//! phase. Conflicting double edits are surfaced (counted and logged), not
//! auto-resolved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{OwnerContext, OwnerId, SyncReport, SyncStatus, Transaction};
use crate::remote::{RemoteClient, RemoteError, RemoteTransaction};
use crate::store::{PushOutcome, TransactionStore};

/// What happened to one incoming remote row
#[derive(Debug)]
pub(crate) enum RemoteRowOutcome {
    /// No local record referenced the server id; inserted as `Synced`
    Inserted,
    /// Remote copy was strictly newer than a `Synced` local record
    Updated,
    /// Local record already reflects this remote state
    Unchanged,
    /// The local record carries an un-pushed change; both sides left alone
    Conflict(Box<Transaction>),
}

/// Fold one remote row into the local store.
///
/// Matching is by `server_id`, so a record that reappears in a later list is
/// updated in place, never inserted again. Last-writer-wins applies only to
/// `Synced` records — by definition they have no un-pushed local edit to
/// lose.
pub(crate) async fn apply_remote_row(
    store: &TransactionStore,
    owner: &OwnerId,
    row: &RemoteTransaction,
) -> Result<RemoteRowOutcome> {
    match store.get_by_server_id(owner, &row.id).await? {
        None => {
            store.insert_remote(owner, row).await?;
            Ok(RemoteRowOutcome::Inserted)
        }
        Some(local) if local.sync_status == SyncStatus::Synced => {
            let known = local.remote_updated_at.unwrap_or(i64::MIN);
            if row.updated_at > known {
                store.apply_remote(&local.id, row).await?;
                Ok(RemoteRowOutcome::Updated)
            } else {
                Ok(RemoteRowOutcome::Unchanged)
            }
        }
        Some(local) => Ok(RemoteRowOutcome::Conflict(Box::new(local))),
    }
}

/// Four-phase batch reconciliation for one owner at a time
pub struct SyncEngine<R> {
    store: TransactionStore,
    remote: Arc<R>,
    // One async mutex per owner so overlapping sync() calls for the same
    // owner serialise instead of double-uploading or miscounting conflicts
    locks: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl<R> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            remote: Arc::clone(&self.remote),
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<R: RemoteClient> SyncEngine<R> {
    #[must_use]
    pub fn new(store: TransactionStore, remote: Arc<R>) -> Self {
        Self {
            store,
            remote,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn owner_lock(&self, owner: &OwnerId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            locks
                .entry(owner.as_str().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Run one full reconciliation pass for the owner.
    ///
    /// All four phases run even when earlier ones report failures;
    /// `report.success()` is true iff no phase produced any error.
    pub async fn sync(&self, ctx: &OwnerContext) -> Result<SyncReport> {
        if !ctx.is_hybrid() {
            return Err(Error::InvalidInput(
                "sync requires an authenticated owner; guests have no remote store".into(),
            ));
        }

        let lock = self.owner_lock(&ctx.owner_id);
        let _guard = lock.lock().await;

        let owner = &ctx.owner_id;
        let mut report = SyncReport::default();

        self.upload_phase(owner, &mut report).await;
        self.deletion_phase(owner, &mut report).await;
        self.download_phase(owner, &mut report).await;
        self.bookkeeping_phase(owner, &mut report).await;

        tracing::info!(
            owner = %owner,
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            deleted = report.deleted,
            conflicts = report.conflicts,
            errors = report.errors.len(),
            "sync pass finished"
        );
        Ok(report)
    }

    /// Phase 1: push every `Local` / `PendingUpload` record
    async fn upload_phase(&self, owner: &OwnerId, report: &mut SyncReport) {
        let pending = match self
            .store
            .list_by_status(owner, &[SyncStatus::Local, SyncStatus::PendingUpload])
            .await
        {
            Ok(pending) => pending,
            Err(error) => {
                report
                    .errors
                    .push(format!("upload phase: listing pending records failed: {error}"));
                return;
            }
        };

        for tx in pending {
            match self.push_record(owner, &tx).await {
                Ok(()) => report.uploaded += 1,
                Err(error) => {
                    tracing::warn!(transaction = %tx.id, %error, "upload failed");
                    report
                        .errors
                        .push(format!("upload failed for {}: {error}", tx.id));
                }
            }
        }
    }

    async fn push_record(&self, owner: &OwnerId, tx: &Transaction) -> Result<()> {
        let pushed_at = tx.local_updated_at;
        let remote_row = match &tx.server_id {
            None => self.remote.create(owner, tx).await?,
            Some(server_id) => match self.remote.update(owner, server_id, tx).await {
                Ok(row) => row,
                // The server row vanished (deleted by another device); the
                // local copy is still the source of truth, so re-create it
                // instead of erroring on every pass
                Err(RemoteError::NotFound(_)) => {
                    tracing::debug!(
                        transaction = %tx.id,
                        server_id = %server_id,
                        "server record gone, re-creating"
                    );
                    self.remote.create(owner, tx).await?
                }
                Err(error) => return Err(error.into()),
            },
        };
        match self
            .store
            .mark_synced(&tx.id, &remote_row.id, remote_row.updated_at, pushed_at)
            .await?
        {
            // Superseded: the newer edit kept its pending status and will go
            // out as an update on the next pass
            PushOutcome::Synced | PushOutcome::Superseded => {}
            PushOutcome::Missing => {
                // Hard-deleted while the push was in flight; take the
                // orphaned server row back down
                match self.remote.delete(owner, &remote_row.id).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => {}
                    Err(error) => {
                        tracing::warn!(
                            server_id = %remote_row.id,
                            %error,
                            "cleanup of orphaned server record failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Phase 2: confirm queued deletions against the server
    async fn deletion_phase(&self, owner: &OwnerId, report: &mut SyncReport) {
        let queued = match self
            .store
            .list_by_status(owner, &[SyncStatus::PendingDelete])
            .await
        {
            Ok(queued) => queued,
            Err(error) => {
                report
                    .errors
                    .push(format!("deletion phase: listing queued records failed: {error}"));
                return;
            }
        };

        for tx in queued {
            let remote_ok = match &tx.server_id {
                Some(server_id) => match self.remote.delete(owner, server_id).await {
                    Ok(()) => true,
                    // The server already forgot the record; the intent is met
                    Err(RemoteError::NotFound(_)) => true,
                    Err(error) => {
                        tracing::warn!(transaction = %tx.id, %error, "remote delete failed");
                        report
                            .errors
                            .push(format!("delete failed for {}: {error}", tx.id));
                        false
                    }
                },
                None => true,
            };

            if remote_ok {
                match self.store.hard_delete(&tx.id).await {
                    Ok(_) => report.deleted += 1,
                    Err(error) => report
                        .errors
                        .push(format!("local delete failed for {}: {error}", tx.id)),
                }
            }
        }
    }

    /// Phase 3: fold the owner's remote record set into the local store
    async fn download_phase(&self, owner: &OwnerId, report: &mut SyncReport) {
        let remote_rows = match self.remote.list(owner).await {
            Ok(rows) => rows,
            Err(error) => {
                tracing::warn!(%error, "remote list failed");
                report
                    .errors
                    .push(format!("download phase: remote list failed: {error}"));
                return;
            }
        };

        for row in remote_rows {
            match apply_remote_row(&self.store, owner, &row).await {
                Ok(RemoteRowOutcome::Inserted | RemoteRowOutcome::Updated) => {
                    report.downloaded += 1;
                }
                Ok(RemoteRowOutcome::Unchanged) => {}
                Ok(RemoteRowOutcome::Conflict(local)) => {
                    report.conflicts += 1;
                    tracing::debug!(
                        transaction = %local.id,
                        server_id = %row.id,
                        "remote change collides with un-pushed local edit"
                    );
                    if let Err(error) = self.store.record_conflict(&local, &row).await {
                        report
                            .errors
                            .push(format!("conflict log failed for {}: {error}", local.id));
                    }
                }
                Err(error) => {
                    report
                        .errors
                        .push(format!("download failed for server record {}: {error}", row.id));
                }
            }
        }
    }

    /// Phase 4: persist the last-sync timestamp and the pending count
    async fn bookkeeping_phase(&self, owner: &OwnerId, report: &mut SyncReport) {
        let now = chrono::Utc::now().timestamp_millis();
        if let Err(error) = self.store.set_last_synced_at(owner, now).await {
            report
                .errors
                .push(format!("bookkeeping: storing last-sync timestamp failed: {error}"));
        }
        if let Err(error) = self.store.refresh_pending(owner).await {
            report
                .errors
                .push(format!("bookkeeping: refreshing pending count failed: {error}"));
        }
    }
}
