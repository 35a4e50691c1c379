//! Transfer record store.
//!
//! The store is the single source of truth for transfer state. Every
//! mutation is an atomic read-modify-write of one row, serialized so
//! concurrent part completions never lose updates.

mod json;
mod memory;

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::types::{Transfer, TransferDirection, TransferId, TransferState};

pub use json::JsonFileStore;
pub use memory::MemoryStore;

/// Mutation applied by [`TransferStore::update`]. Returning an error
/// leaves the row untouched.
pub type Mutation<'a> = &'a mut dyn FnMut(&mut Transfer) -> Result<(), TransferError>;

/// Durable table of transfer records.
pub trait TransferStore: Send + Sync {
    /// Saves a new record and returns its freshly assigned id.
    fn create(&self, transfer: Transfer) -> Result<TransferId, TransferError>;

    fn get(&self, id: TransferId) -> Result<Option<Transfer>, TransferError>;

    /// Atomically applies `mutation` to one row and returns the new row.
    fn update(&self, id: TransferId, mutation: Mutation<'_>) -> Result<Transfer, TransferError>;

    /// Returns matching rows in id order.
    fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>, TransferError>;

    /// Deletes a row, returning it if it existed.
    fn remove(&self, id: TransferId) -> Result<Option<Transfer>, TransferError>;

    /// Applies a part-level progress change. Durable stores may defer
    /// writing it out; the next [`update`](Self::update) or
    /// [`flush`](Self::flush) persists it along with everything else.
    fn record_progress(
        &self,
        id: TransferId,
        mutation: Mutation<'_>,
    ) -> Result<Transfer, TransferError> {
        self.update(id, mutation)
    }

    /// Persists any deferred changes.
    fn flush(&self) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Row filter for [`TransferStore::list`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferFilter {
    pub state: Option<TransferState>,
    pub direction: Option<TransferDirection>,
}

impl TransferFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_state(state: TransferState) -> Self {
        Self {
            state: Some(state),
            direction: None,
        }
    }

    pub fn matches(&self, transfer: &Transfer) -> bool {
        self.state.is_none_or(|s| s == transfer.state)
            && self.direction.is_none_or(|d| d == transfer.direction)
    }
}

/// In-memory table shared by the store implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Table {
    next_id: TransferId,
    rows: BTreeMap<TransferId, Transfer>,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            next_id: 1,
            rows: BTreeMap::new(),
        }
    }
}

impl Table {
    fn insert(&mut self, mut transfer: Transfer) -> TransferId {
        let id = self.next_id;
        self.next_id += 1;
        transfer.id = id;
        self.rows.insert(id, transfer);
        id
    }

    fn get(&self, id: TransferId) -> Option<Transfer> {
        self.rows.get(&id).cloned()
    }

    /// Applies `mutation` to a copy of the row and returns it without
    /// storing it.
    fn apply(&self, id: TransferId, mutation: Mutation<'_>) -> Result<Transfer, TransferError> {
        let mut row = self
            .rows
            .get(&id)
            .cloned()
            .ok_or(TransferError::UnknownTransfer(id))?;
        mutation(&mut row)?;
        row.id = id;
        row.updated_at = Utc::now();
        Ok(row)
    }

    fn put(&mut self, row: Transfer) -> Option<Transfer> {
        self.rows.insert(row.id, row)
    }

    fn list(&self, filter: &TransferFilter) -> Vec<Transfer> {
        self.rows
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    fn remove(&mut self, id: TransferId) -> Option<Transfer> {
        self.rows.remove(&id)
    }
}

fn poisoned() -> TransferError {
    TransferError::Store("record store lock poisoned".into())
}
