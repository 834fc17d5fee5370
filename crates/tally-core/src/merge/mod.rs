//! Guest-to-account data migration
//!
//! When a guest signs in, their local history is reassigned to the
//! authenticated identity and pushed through a full sync pass. Reassigned
//! records are reset to `Local` first: they were never linked to a server
//! record under the new identity, so the upload phase creates fresh server
//! copies. Records whose upload fails simply stay `Local` under the new
//! owner, which makes the whole operation safe to retry.

use crate::error::{Error, Result};
use crate::models::{OwnerContext, OwnerId, SyncReport};
use crate::remote::RemoteClient;
use crate::store::TransactionStore;
use crate::sync::SyncEngine;

pub struct MergeService<R> {
    store: TransactionStore,
    engine: SyncEngine<R>,
}

impl<R: RemoteClient> MergeService<R> {
    #[must_use]
    pub fn new(store: TransactionStore, engine: SyncEngine<R>) -> Self {
        Self { store, engine }
    }

    /// Move every record owned by `guest` to the authenticated `target`,
    /// drop the guest identity, and sync the target.
    ///
    /// The returned report covers the sync pass; a partially-failed pass
    /// leaves the un-pushed records `Local` under the target, and calling
    /// this again (or any later sync) picks them up.
    pub async fn merge_guest_data(
        &self,
        guest: &OwnerId,
        target: &OwnerContext,
    ) -> Result<SyncReport> {
        if !target.is_hybrid() {
            return Err(Error::InvalidInput(
                "merge target must be an authenticated owner".into(),
            ));
        }
        if guest == &target.owner_id {
            return Err(Error::InvalidInput(
                "merge source and target must differ".into(),
            ));
        }

        let moved = self.store.reassign_owner(guest, &target.owner_id).await?;
        let dropped = self.store.delete_owner(guest).await?;
        self.store.refresh_pending(&target.owner_id).await?;
        tracing::info!(
            guest = %guest,
            owner = %target.owner_id,
            moved,
            guest_identity_dropped = dropped,
            "guest history reassigned"
        );

        self.engine.sync(target).await
    }
}
