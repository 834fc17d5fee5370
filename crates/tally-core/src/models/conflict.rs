//! Sync conflict model

use serde::{Deserialize, Serialize};

/// A remote change that collided with an un-pushed local edit.
///
/// Conflicts are never auto-resolved; they are counted in the sync report and
/// recorded here for later inspection. Both sides keep their data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Local transaction involved in the conflict
    pub transaction_id: String,
    /// Server identifier the colliding rows share
    pub server_id: String,
    /// Local row's clock when the conflict was detected (unix ms)
    pub local_updated_at: i64,
    /// Incoming remote timestamp that was declined (unix ms)
    pub incoming_updated_at: i64,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
}
