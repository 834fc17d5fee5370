//! Outcome of a sync pass

use serde::{Deserialize, Serialize};

/// Counters and per-record errors accumulated over one reconciliation pass.
///
/// A failing record never aborts a phase; it is reported here and retried on
/// the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Records pushed to the remote store (creates and re-uploads)
    pub uploaded: usize,
    /// Remote records inserted or overwritten locally
    pub downloaded: usize,
    /// Records whose deletion was confirmed and applied locally
    pub deleted: usize,
    /// Remote changes skipped because they collided with an un-pushed edit
    pub conflicts: usize,
    /// Per-record failure descriptions
    pub errors: Vec<String>,
}

impl SyncReport {
    /// True iff no phase produced any error
    #[must_use]
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_tracks_errors() {
        let mut report = SyncReport::default();
        assert!(report.success());
        report.errors.push("upload failed for tx-1".to_string());
        assert!(!report.success());
    }
}
