//! Aggregates served to the UI layer

use serde::{Deserialize, Serialize};

/// Per-category spend/income total in minor units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub category: String,
    /// Signed sum: income positive, expenses negative
    pub net_minor: i64,
    pub count: usize,
}

/// Income/expense roll-up over a date range, computed from the local store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub income_minor: i64,
    pub expense_minor: i64,
    pub transaction_count: usize,
    /// Categories sorted by absolute net, largest first
    pub by_category: Vec<CategoryTotal>,
}

impl AnalyticsSummary {
    #[must_use]
    pub const fn net_minor(&self) -> i64 {
        self.income_minor - self.expense_minor
    }
}
