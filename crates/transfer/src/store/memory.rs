use std::sync::Mutex;

use super::{Mutation, Table, TransferFilter, TransferStore, poisoned};
use crate::error::TransferError;
use crate::types::{Transfer, TransferId};

/// Volatile store; records vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransferStore for MemoryStore {
    fn create(&self, transfer: Transfer) -> Result<TransferId, TransferError> {
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table.insert(transfer))
    }

    fn get(&self, id: TransferId) -> Result<Option<Transfer>, TransferError> {
        let table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table.get(id))
    }

    fn update(&self, id: TransferId, mutation: Mutation<'_>) -> Result<Transfer, TransferError> {
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        let row = table.apply(id, mutation)?;
        table.put(row.clone());
        Ok(row)
    }

    fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>, TransferError> {
        let table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table.list(filter))
    }

    fn remove(&self, id: TransferId) -> Result<Option<Transfer>, TransferError> {
        let mut table = self.table.lock().map_err(|_| poisoned())?;
        Ok(table.remove(id))
    }
}
