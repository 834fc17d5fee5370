//! Offline-first dispatch between the local and remote stores
//!
//! Every mutation commits locally first and returns the local result; for
//! authenticated owners a best-effort mirror push runs in the background.
//! Reads prefer fresh remote data when available and fall back to the local
//! store on any remote failure, so callers never see a network error from a
//! read or write path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::NaiveDate;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::models::{
    AnalyticsSummary, CategoryTotal, DeleteAction, NewTransaction, OwnerContext, OwnerId,
    Transaction, TransactionId, TransactionPatch,
};
use crate::remote::{RemoteClient, RemoteError, RemoteTransaction};
use crate::store::{PushOutcome, TransactionStore};
use crate::sync::{apply_remote_row, RemoteRowOutcome};

/// Tracked background push tasks.
///
/// Pushes are fire-and-forget from the caller's point of view, but the
/// handles are kept so shutdown (and tests) can wait for the queue to empty
/// instead of racing detached tasks.
#[derive(Debug, Default)]
pub struct PushQueue {
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl PushQueue {
    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut handles = self
            .handles
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        handles.retain(|handle| !handle.is_finished());
        handles.push(tokio::spawn(task));
    }

    /// Wait for every queued push to finish
    pub async fn drain(&self) {
        let handles = {
            let mut handles = self
                .handles
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut *handles)
        };
        for handle in handles {
            if let Err(error) = handle.await {
                tracing::warn!(%error, "push task panicked");
            }
        }
    }
}

/// Local-first facade over the store and the remote client
pub struct DataRouter<R> {
    store: TransactionStore,
    remote: Arc<R>,
    pushes: Arc<PushQueue>,
}

impl<R: RemoteClient + 'static> DataRouter<R> {
    #[must_use]
    pub fn new(store: TransactionStore, remote: Arc<R>) -> Self {
        Self {
            store,
            remote,
            pushes: Arc::new(PushQueue::default()),
        }
    }

    /// Commit a new transaction locally; mirror it in the background for
    /// authenticated owners
    pub async fn create(&self, ctx: &OwnerContext, dto: NewTransaction) -> Result<Transaction> {
        let tx = self.store.create(&ctx.owner_id, dto).await?;
        self.store.refresh_pending(&ctx.owner_id).await?;

        if ctx.is_hybrid() {
            let store = self.store.clone();
            let remote = Arc::clone(&self.remote);
            let owner = ctx.owner_id.clone();
            let snapshot = tx.clone();
            self.pushes.spawn(async move {
                match remote.create(&owner, &snapshot).await {
                    Ok(row) => {
                        finish_push(&store, remote.as_ref(), &owner, &snapshot, &row).await;
                        refresh_quietly(&store, &owner).await;
                    }
                    Err(error) => {
                        tracing::warn!(transaction = %snapshot.id, %error, "background create push failed");
                    }
                }
            });
        }

        Ok(tx)
    }

    /// Apply a partial edit locally; re-push in the background when the
    /// record is already known to the server
    pub async fn update(
        &self,
        ctx: &OwnerContext,
        id: &TransactionId,
        patch: &TransactionPatch,
    ) -> Result<Transaction> {
        let tx = self.store.update(id, patch).await?;
        self.store.refresh_pending(&ctx.owner_id).await?;

        if ctx.is_hybrid() {
            if let Some(server_id) = tx.server_id.clone() {
                let store = self.store.clone();
                let remote = Arc::clone(&self.remote);
                let owner = ctx.owner_id.clone();
                let snapshot = tx.clone();
                self.pushes.spawn(async move {
                    match remote.update(&owner, &server_id, &snapshot).await {
                        Ok(row) => {
                            finish_push(&store, remote.as_ref(), &owner, &snapshot, &row).await;
                            refresh_quietly(&store, &owner).await;
                        }
                        Err(error) => {
                            tracing::warn!(transaction = %snapshot.id, %error, "background update push failed");
                        }
                    }
                });
            }
            // No server id yet: the pending create push or the next sync
            // pass carries this edit
        }

        Ok(tx)
    }

    /// Delete locally (hard or queued per the record's status); confirm a
    /// queued deletion against the server in the background
    pub async fn delete(&self, ctx: &OwnerContext, id: &TransactionId) -> Result<DeleteAction> {
        let server_id = self.store.get(id).await?.and_then(|tx| tx.server_id);
        let action = self.store.delete(id).await?;
        self.store.refresh_pending(&ctx.owner_id).await?;

        if ctx.is_hybrid() && action == DeleteAction::Queue {
            if let Some(server_id) = server_id {
                let store = self.store.clone();
                let remote = Arc::clone(&self.remote);
                let owner = ctx.owner_id.clone();
                let id = *id;
                self.pushes.spawn(async move {
                    match remote.delete(&owner, &server_id).await {
                        Ok(()) | Err(RemoteError::NotFound(_)) => {
                            if let Err(error) = store.hard_delete(&id).await {
                                tracing::warn!(transaction = %id, %error, "finishing queued delete failed");
                            }
                            refresh_quietly(&store, &owner).await;
                        }
                        Err(error) => {
                            tracing::warn!(transaction = %id, %error, "background delete push failed");
                        }
                    }
                });
            }
        }

        Ok(action)
    }

    pub async fn get(&self, id: &TransactionId) -> Result<Option<Transaction>> {
        self.store.get(id).await
    }

    /// List the owner's transactions.
    ///
    /// Authenticated owners get a remote refresh first: unknown remote rows
    /// are materialised locally, newer remote copies overwrite `Synced`
    /// records, and the merged local list is returned. Any remote failure
    /// degrades silently to the local list.
    pub async fn get_all(
        &self,
        ctx: &OwnerContext,
        include_archived: bool,
    ) -> Result<Vec<Transaction>> {
        if ctx.is_hybrid() {
            match self.remote.list(&ctx.owner_id).await {
                Ok(rows) => {
                    for row in rows {
                        match apply_remote_row(&self.store, &ctx.owner_id, &row).await {
                            Ok(RemoteRowOutcome::Conflict(local)) => {
                                tracing::debug!(
                                    transaction = %local.id,
                                    "skipping remote row over un-pushed local edit"
                                );
                            }
                            Ok(_) => {}
                            Err(error) => {
                                tracing::warn!(server_id = %row.id, %error, "merging remote row failed");
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "remote list failed, serving local data");
                }
            }
        }
        self.store.list_for_owner(&ctx.owner_id, include_archived).await
    }

    /// Aggregate the owner's non-archived transactions over an inclusive
    /// date range; always computed from the local store
    pub async fn get_analytics(
        &self,
        ctx: &OwnerContext,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<AnalyticsSummary> {
        let transactions = self.store.list_in_range(&ctx.owner_id, from, to).await?;

        let mut income_minor = 0;
        let mut expense_minor = 0;
        let mut per_category: HashMap<String, (i64, usize)> = HashMap::new();

        for tx in &transactions {
            let signed = tx.signed_amount_minor();
            if signed >= 0 {
                income_minor += signed;
            } else {
                expense_minor += -signed;
            }
            let entry = per_category.entry(tx.category.clone()).or_default();
            entry.0 += signed;
            entry.1 += 1;
        }

        let mut by_category: Vec<CategoryTotal> = per_category
            .into_iter()
            .map(|(category, (net_minor, count))| CategoryTotal {
                category,
                net_minor,
                count,
            })
            .collect();
        by_category.sort_by(|a, b| {
            b.net_minor
                .abs()
                .cmp(&a.net_minor.abs())
                .then_with(|| a.category.cmp(&b.category))
        });

        Ok(AnalyticsSummary {
            income_minor,
            expense_minor,
            transaction_count: transactions.len(),
            by_category,
        })
    }

    pub async fn pending_count(&self, ctx: &OwnerContext) -> Result<u64> {
        self.store.pending_count(&ctx.owner_id).await
    }

    /// Wait for all in-flight background pushes
    pub async fn drain_pushes(&self) {
        self.pushes.drain().await;
    }
}

/// Record a successful push.
///
/// A record edited while the push was in flight keeps its pending status but
/// picks up the server linkage, so the next push updates the existing server
/// row instead of creating a duplicate. A record hard-deleted mid-push leaves
/// an orphaned server row, which is deleted here.
async fn finish_push<R: RemoteClient>(
    store: &TransactionStore,
    remote: &R,
    owner: &OwnerId,
    snapshot: &Transaction,
    row: &RemoteTransaction,
) {
    match store
        .mark_synced(&snapshot.id, &row.id, row.updated_at, snapshot.local_updated_at)
        .await
    {
        Ok(PushOutcome::Synced) => {}
        Ok(PushOutcome::Superseded) => {
            tracing::debug!(
                transaction = %snapshot.id,
                "record changed during push, leaving it pending"
            );
        }
        Ok(PushOutcome::Missing) => match remote.delete(owner, &row.id).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(error) => {
                tracing::warn!(
                    server_id = %row.id,
                    %error,
                    "cleanup of orphaned server record failed"
                );
            }
        },
        Err(error) => {
            tracing::warn!(transaction = %snapshot.id, %error, "recording push result failed");
        }
    }
}

async fn refresh_quietly(store: &TransactionStore, owner: &OwnerId) {
    if let Err(error) = store.refresh_pending(owner).await {
        tracing::warn!(owner = %owner, %error, "refreshing pending count failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{OwnerId, SyncStatus, TransactionKind};
    use crate::remote::mock::MockRemote;
    use crate::remote::RemoteTransaction;
    use pretty_assertions::assert_eq;

    async fn setup() -> (TransactionStore, Arc<MockRemote>, DataRouter<MockRemote>) {
        let db = Database::open_in_memory().await.unwrap();
        let store = TransactionStore::new(db.connection().clone());
        let remote = Arc::new(MockRemote::new());
        let router = DataRouter::new(store.clone(), Arc::clone(&remote));
        (store, remote, router)
    }

    fn alice() -> OwnerContext {
        OwnerContext::authenticated(OwnerId::from("alice"))
    }

    fn guest() -> OwnerContext {
        OwnerContext::guest(OwnerId::from("guest-1"))
    }

    fn dto(description: &str, amount_minor: i64, kind: TransactionKind) -> NewTransaction {
        NewTransaction {
            date: NaiveDate::from_ymd_opt(2024, 5, 17).unwrap(),
            category: "groceries".to_string(),
            description: description.to_string(),
            amount_minor,
            kind,
            merchant: None,
        }
    }

    fn expense(description: &str) -> NewTransaction {
        dto(description, 1200, TransactionKind::Expense)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_mutations_never_touch_the_remote() {
        let (_store, remote, router) = setup().await;
        let ctx = guest();

        let tx = router.create(&ctx, expense("coffee")).await.unwrap();
        router
            .update(&ctx, &tx.id, &TransactionPatch {
                amount_minor: Some(900),
                ..Default::default()
            })
            .await
            .unwrap();
        router.get_all(&ctx, true).await.unwrap();
        let action = router.delete(&ctx, &tx.id).await.unwrap();
        router.drain_pushes().await;

        assert_eq!(action, DeleteAction::HardDelete);
        assert_eq!(remote.create_calls(), 0);
        assert_eq!(remote.update_calls(), 0);
        assert_eq!(remote.delete_calls(), 0);
        assert_eq!(remote.list_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_returns_before_push_and_push_marks_synced() {
        let (store, remote, router) = setup().await;
        let ctx = alice();

        let tx = router.create(&ctx, expense("coffee")).await.unwrap();
        // The caller always sees the local-first result
        assert_eq!(tx.sync_status, SyncStatus::Local);
        assert!(tx.server_id.is_none());

        router.drain_pushes().await;

        let pushed = store.get(&tx.id).await.unwrap().unwrap();
        assert_eq!(pushed.sync_status, SyncStatus::Synced);
        assert!(pushed.server_id.is_some());
        assert_eq!(remote.record_count(), 1);
        assert_eq!(store.pending_count(&ctx.owner_id).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_create_push_leaves_record_local() {
        let (store, remote, router) = setup().await;
        let ctx = alice();
        remote.fail_when_description_contains("flaky");

        let tx = router.create(&ctx, expense("flaky")).await.unwrap();
        router.drain_pushes().await;

        let stuck = store.get(&tx.id).await.unwrap().unwrap();
        assert_eq!(stuck.sync_status, SyncStatus::Local);
        assert!(stuck.server_id.is_none());
        assert_eq!(store.pending_count(&ctx.owner_id).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_pushes_when_server_id_exists() {
        let (store, remote, router) = setup().await;
        let ctx = alice();

        let tx = router.create(&ctx, expense("coffee")).await.unwrap();
        router.drain_pushes().await;

        let updated = router
            .update(&ctx, &tx.id, &TransactionPatch {
                amount_minor: Some(1500),
                ..Default::default()
            })
            .await
            .unwrap();
        // Local result is immediate
        assert_eq!(updated.sync_status, SyncStatus::PendingUpload);

        router.drain_pushes().await;

        let pushed = store.get(&tx.id).await.unwrap().unwrap();
        assert_eq!(pushed.sync_status, SyncStatus::Synced);
        let server_id = pushed.server_id.unwrap();
        assert_eq!(remote.record(&server_id).unwrap().amount_minor, 1500);
        assert_eq!(remote.update_calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_without_server_id_is_not_pushed() {
        let (store, remote, router) = setup().await;
        let ctx = alice();
        remote.fail_when_description_contains("flaky");

        let tx = router.create(&ctx, expense("flaky")).await.unwrap();
        router.drain_pushes().await;

        router
            .update(&ctx, &tx.id, &TransactionPatch {
                category: Some("fixed".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        router.drain_pushes().await;

        // Only the failed create call reached the remote
        assert_eq!(remote.create_calls(), 1);
        assert_eq!(remote.update_calls(), 0);
        let local = store.get(&tx.id).await.unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Local);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_of_synced_record_completes_in_background() {
        let (store, remote, router) = setup().await;
        let ctx = alice();

        let tx = router.create(&ctx, expense("doomed")).await.unwrap();
        router.drain_pushes().await;

        let action = router.delete(&ctx, &tx.id).await.unwrap();
        assert_eq!(action, DeleteAction::Queue);

        router.drain_pushes().await;
        assert!(store.get(&tx.id).await.unwrap().is_none());
        assert_eq!(remote.record_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_delete_push_keeps_record_queued() {
        let (store, remote, router) = setup().await;
        let ctx = alice();

        let tx = router.create(&ctx, expense("doomed")).await.unwrap();
        router.drain_pushes().await;
        remote.set_fail_deletes(true);

        router.delete(&ctx, &tx.id).await.unwrap();
        router.drain_pushes().await;

        let queued = store.get(&tx.id).await.unwrap().unwrap();
        assert_eq!(queued.sync_status, SyncStatus::PendingDelete);
        assert_eq!(remote.record_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_edit_during_push_keeps_server_linkage() {
        let (store, remote, _router) = setup().await;
        let owner = OwnerId::from("alice");

        let snapshot = store.create(&owner, expense("racy")).await.unwrap();
        let row = remote.create(&owner, &snapshot).await.unwrap();
        store
            .update(&snapshot.id, &TransactionPatch {
                amount_minor: Some(2500),
                ..Default::default()
            })
            .await
            .unwrap();

        finish_push(&store, remote.as_ref(), &owner, &snapshot, &row).await;

        // The edit stays queued, but with the server id recorded the next
        // push goes out as an update
        let fetched = store.get(&snapshot.id).await.unwrap().unwrap();
        assert_eq!(fetched.sync_status, SyncStatus::PendingUpload);
        assert_eq!(fetched.server_id.as_deref(), Some(row.id.as_str()));
        assert_eq!(remote.record_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_during_push_removes_orphaned_server_row() {
        let (store, remote, _router) = setup().await;
        let owner = OwnerId::from("alice");

        let snapshot = store.create(&owner, expense("gone already")).await.unwrap();
        let row = remote.create(&owner, &snapshot).await.unwrap();
        assert!(store.hard_delete(&snapshot.id).await.unwrap());

        finish_push(&store, remote.as_ref(), &owner, &snapshot, &row).await;

        assert_eq!(remote.delete_calls(), 1);
        assert_eq!(remote.record_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_all_materialises_remote_rows_for_hybrid_owners() {
        let (store, remote, router) = setup().await;
        let ctx = alice();
        remote.seed(RemoteTransaction {
            id: String::new(),
            date: NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(),
            category: "salary".to_string(),
            description: "march pay".to_string(),
            amount_minor: 320_000,
            kind: TransactionKind::Income,
            merchant: None,
            created_at: 10,
            updated_at: 10,
            is_archived: false,
        });

        let listed = router.get_all(&ctx, true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].sync_status, SyncStatus::Synced);
        assert_eq!(listed[0].description, "march pay");

        // The materialised copy persists locally
        assert_eq!(
            store.list_for_owner(&ctx.owner_id, true).await.unwrap().len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_get_all_falls_back_to_local_on_remote_failure() {
        let (_store, remote, router) = setup().await;
        let ctx = alice();
        router.create(&ctx, expense("coffee")).await.unwrap();
        router.drain_pushes().await;
        remote.set_fail_lists(true);

        let listed = router.get_all(&ctx, true).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description, "coffee");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_analytics_totals_and_category_ordering() {
        let (_store, _remote, router) = setup().await;
        let ctx = guest();

        router
            .create(&ctx, dto("pay", 500_000, TransactionKind::Income))
            .await
            .unwrap();
        router
            .create(&ctx, dto("rent", 180_000, TransactionKind::Expense))
            .await
            .unwrap();
        let mut groceries = dto("weekly shop", 24_000, TransactionKind::Expense);
        groceries.category = "food".to_string();
        router.create(&ctx, groceries).await.unwrap();

        let summary = router
            .get_analytics(
                &ctx,
                NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(summary.income_minor, 500_000);
        assert_eq!(summary.expense_minor, 204_000);
        assert_eq!(summary.net_minor(), 296_000);
        assert_eq!(summary.transaction_count, 3);

        // Largest absolute net first
        let categories: Vec<&str> = summary
            .by_category
            .iter()
            .map(|c| c.category.as_str())
            .collect();
        assert_eq!(categories, vec!["groceries", "food"]);
        assert_eq!(summary.by_category[0].net_minor, 500_000 - 180_000);
        assert_eq!(summary.by_category[0].count, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_analytics_excludes_out_of_range_records() {
        let (_store, _remote, router) = setup().await;
        let ctx = guest();

        let mut january = expense("old");
        january.date = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        router.create(&ctx, january).await.unwrap();
        router.create(&ctx, expense("in range")).await.unwrap();

        let summary = router
            .get_analytics(
                &ctx,
                NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(summary.transaction_count, 1);
        assert_eq!(summary.expense_minor, 1200);
    }
}
