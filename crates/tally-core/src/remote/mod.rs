//! Remote store boundary
//!
//! The authoritative server is only ever reached through [`RemoteClient`].
//! Every failure on this boundary — timeout, connection refused, 4xx/5xx —
//! is recoverable by design: interactive callers fall back to the local
//! store, and the sync engine defers the record to its next pass.

mod http;

use std::future::Future;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{OwnerId, Transaction, TransactionKind};

pub use http::{HttpRemoteClient, RemoteConfig};

/// Errors produced at the remote boundary
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure (connect, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("Remote API error: {0}")]
    Api(String),

    /// The server no longer knows the referenced record
    #[error("Remote record not found: {0}")]
    NotFound(String),

    /// The server answered with a body we could not interpret
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),

    /// The remote store could not be reached at all
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// A transaction as the server represents it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTransaction {
    /// Server-assigned identifier
    pub id: String,
    pub date: NaiveDate,
    pub category: String,
    pub description: String,
    pub amount_minor: i64,
    pub kind: TransactionKind,
    #[serde(default)]
    pub merchant: Option<String>,
    /// Server clock, unix ms
    pub created_at: i64,
    /// Server clock, unix ms; the conflict-comparison timestamp
    pub updated_at: i64,
    #[serde(default)]
    pub is_archived: bool,
}

/// Outgoing create/update payload built from a local record
#[derive(Debug, Clone, Serialize)]
pub struct TransactionPayload<'a> {
    pub date: NaiveDate,
    pub category: &'a str,
    pub description: &'a str,
    pub amount_minor: i64,
    pub kind: TransactionKind,
    pub merchant: Option<&'a str>,
    pub is_archived: bool,
}

impl<'a> TransactionPayload<'a> {
    #[must_use]
    pub fn from_transaction(tx: &'a Transaction) -> Self {
        Self {
            date: tx.date,
            category: &tx.category,
            description: &tx.description,
            amount_minor: tx.amount_minor,
            kind: tx.kind,
            merchant: tx.merchant.as_deref(),
            is_archived: tx.is_archived,
        }
    }
}

/// Network calls against the authoritative transaction store
pub trait RemoteClient: Send + Sync {
    /// Create a record on the server, returning the server's copy
    /// (including the assigned server id)
    fn create(
        &self,
        owner: &OwnerId,
        tx: &Transaction,
    ) -> impl Future<Output = RemoteResult<RemoteTransaction>> + Send;

    /// Overwrite the server copy identified by `server_id`
    fn update(
        &self,
        owner: &OwnerId,
        server_id: &str,
        tx: &Transaction,
    ) -> impl Future<Output = RemoteResult<RemoteTransaction>> + Send;

    /// Delete the server copy identified by `server_id`
    fn delete(
        &self,
        owner: &OwnerId,
        server_id: &str,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Fetch the owner's full remote record set
    fn list(&self, owner: &OwnerId)
        -> impl Future<Output = RemoteResult<Vec<RemoteTransaction>>> + Send;
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory remote store with failure injection, shared by the router,
    //! sync, and merge tests.

    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::{RemoteClient, RemoteError, RemoteResult, RemoteTransaction};
    use crate::models::{OwnerId, Transaction};

    #[derive(Debug, Default)]
    struct State {
        records: BTreeMap<String, RemoteTransaction>,
        next_id: u64,
        clock: i64,
        fail_matching: Vec<String>,
        fail_lists: bool,
        fail_deletes: bool,
        create_calls: usize,
        update_calls: usize,
        delete_calls: usize,
        list_calls: usize,
    }

    /// Test double for [`RemoteClient`]
    #[derive(Debug)]
    pub struct MockRemote {
        state: Mutex<State>,
    }

    impl MockRemote {
        pub fn new() -> Self {
            Self {
                state: Mutex::new(State {
                    clock: 1_000_000,
                    ..Default::default()
                }),
            }
        }

        /// Make create/update fail for records whose description contains
        /// `needle`
        pub fn fail_when_description_contains(&self, needle: &str) {
            self.state
                .lock()
                .unwrap()
                .fail_matching
                .push(needle.to_string());
        }

        pub fn set_fail_lists(&self, fail: bool) {
            self.state.lock().unwrap().fail_lists = fail;
        }

        pub fn set_fail_deletes(&self, fail: bool) {
            self.state.lock().unwrap().fail_deletes = fail;
        }

        /// Insert a server-side record directly (as if another device pushed
        /// it); returns the row
        pub fn seed(&self, mut row: RemoteTransaction) -> RemoteTransaction {
            let mut state = self.state.lock().unwrap();
            if row.id.is_empty() {
                state.next_id += 1;
                row.id = format!("srv-{}", state.next_id);
            }
            state.records.insert(row.id.clone(), row.clone());
            row
        }

        /// Bump a seeded record's `updated_at` past every timestamp handed
        /// out so far, simulating a newer edit from another device
        pub fn touch(&self, server_id: &str, category: &str) -> i64 {
            let mut state = self.state.lock().unwrap();
            state.clock += 1;
            let clock = state.clock;
            let row = state
                .records
                .get_mut(server_id)
                .expect("unknown server id in touch");
            row.category = category.to_string();
            row.updated_at = clock;
            clock
        }

        /// Drop a record server-side without going through `delete`, as if
        /// another device removed it
        pub fn forget(&self, server_id: &str) {
            self.state.lock().unwrap().records.remove(server_id);
        }

        pub fn record(&self, server_id: &str) -> Option<RemoteTransaction> {
            self.state.lock().unwrap().records.get(server_id).cloned()
        }

        pub fn record_count(&self) -> usize {
            self.state.lock().unwrap().records.len()
        }

        pub fn create_calls(&self) -> usize {
            self.state.lock().unwrap().create_calls
        }

        pub fn update_calls(&self) -> usize {
            self.state.lock().unwrap().update_calls
        }

        pub fn delete_calls(&self) -> usize {
            self.state.lock().unwrap().delete_calls
        }

        pub fn list_calls(&self) -> usize {
            self.state.lock().unwrap().list_calls
        }

        fn should_fail(state: &State, description: &str) -> bool {
            state
                .fail_matching
                .iter()
                .any(|needle| description.contains(needle.as_str()))
        }

        fn row_from(state: &mut State, id: String, tx: &Transaction) -> RemoteTransaction {
            state.clock += 1;
            RemoteTransaction {
                id,
                date: tx.date,
                category: tx.category.clone(),
                description: tx.description.clone(),
                amount_minor: tx.amount_minor,
                kind: tx.kind,
                merchant: tx.merchant.clone(),
                created_at: state.clock,
                updated_at: state.clock,
                is_archived: tx.is_archived,
            }
        }
    }

    impl RemoteClient for MockRemote {
        async fn create(&self, _owner: &OwnerId, tx: &Transaction) -> RemoteResult<RemoteTransaction> {
            let mut state = self.state.lock().unwrap();
            state.create_calls += 1;
            if Self::should_fail(&state, &tx.description) {
                return Err(RemoteError::Unavailable(format!(
                    "injected create failure for {}",
                    tx.id
                )));
            }
            state.next_id += 1;
            let id = format!("srv-{}", state.next_id);
            let row = Self::row_from(&mut state, id, tx);
            state.records.insert(row.id.clone(), row.clone());
            Ok(row)
        }

        async fn update(
            &self,
            _owner: &OwnerId,
            server_id: &str,
            tx: &Transaction,
        ) -> RemoteResult<RemoteTransaction> {
            let mut state = self.state.lock().unwrap();
            state.update_calls += 1;
            if Self::should_fail(&state, &tx.description) {
                return Err(RemoteError::Unavailable(format!(
                    "injected update failure for {}",
                    tx.id
                )));
            }
            if !state.records.contains_key(server_id) {
                return Err(RemoteError::NotFound(server_id.to_string()));
            }
            let row = Self::row_from(&mut state, server_id.to_string(), tx);
            state.records.insert(server_id.to_string(), row.clone());
            Ok(row)
        }

        async fn delete(&self, _owner: &OwnerId, server_id: &str) -> RemoteResult<()> {
            let mut state = self.state.lock().unwrap();
            state.delete_calls += 1;
            if state.fail_deletes {
                return Err(RemoteError::Unavailable(
                    "injected delete failure".to_string(),
                ));
            }
            if state.records.remove(server_id).is_none() {
                return Err(RemoteError::NotFound(server_id.to_string()));
            }
            Ok(())
        }

        async fn list(&self, _owner: &OwnerId) -> RemoteResult<Vec<RemoteTransaction>> {
            let mut state = self.state.lock().unwrap();
            state.list_calls += 1;
            if state.fail_lists {
                return Err(RemoteError::Unavailable(
                    "injected list failure".to_string(),
                ));
            }
            Ok(state.records.values().cloned().collect())
        }
    }
}
