//! Durable store persisted as a JSON file.
//!
//! Rows are cached in memory and the whole table is rewritten on every
//! mutation: first to a sibling temp file, then renamed over the
//! original so a crash never leaves a torn table behind. Part progress
//! is written out every [`DEFAULT_PROGRESS_INTERVAL`] acknowledgements;
//! parts lost to a crash in between are simply transferred again.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, trace, warn};

use super::{Mutation, Table, TransferFilter, TransferStore, poisoned};
use crate::error::TransferError;
use crate::types::{Transfer, TransferId};

/// Progress changes held in memory before the table is rewritten.
pub const DEFAULT_PROGRESS_INTERVAL: usize = 16;

pub struct JsonFileStore {
    path: PathBuf,
    table: Mutex<Cached>,
    progress_interval: usize,
}

struct Cached {
    table: Table,
    /// Progress changes not yet on disk.
    unsaved: usize,
}

impl JsonFileStore {
    /// Opens the store at `path`, loading existing records.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let table = load_table(&path)?;
        Ok(Self {
            path,
            table: Mutex::new(Cached { table, unsaved: 0 }),
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        })
    }

    /// Sets how many progress changes may be held before the table is
    /// rewritten. `1` persists every one.
    pub fn with_progress_interval(mut self, interval: usize) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `table` to disk.
    fn persist(&self, table: &Table) -> Result<(), TransferError> {
        let json = serde_json::to_vec_pretty(table)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        trace!("persisted {} transfer record(s) to {:?}", table.rows.len(), self.path);
        Ok(())
    }

    /// Applies a change, persists it, and rolls it back if persisting fails.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut Table) -> Result<(T, Option<Rollback>), TransferError>,
    ) -> Result<T, TransferError> {
        let mut cached = self.table.lock().map_err(|_| poisoned())?;
        let (value, rollback) = change(&mut cached.table)?;
        if let Err(e) = self.persist(&cached.table) {
            if let Some(rollback) = rollback {
                rollback.apply(&mut cached.table);
            }
            return Err(e);
        }
        cached.unsaved = 0;
        Ok(value)
    }

    fn persist_unsaved(&self, cached: &mut Cached) -> Result<(), TransferError> {
        if cached.unsaved > 0 {
            self.persist(&cached.table)?;
            cached.unsaved = 0;
        }
        Ok(())
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(path = ?self.path, error = %e, "cannot persist transfer progress");
        }
    }
}

/// Undo step for a change that failed to persist.
enum Rollback {
    Remove(TransferId),
    Restore(Transfer),
    Reinsert(Transfer),
}

impl Rollback {
    fn apply(self, table: &mut Table) {
        match self {
            Rollback::Remove(id) => {
                table.remove(id);
            }
            Rollback::Restore(row) | Rollback::Reinsert(row) => {
                table.put(row);
            }
        }
    }
}

impl TransferStore for JsonFileStore {
    fn create(&self, transfer: Transfer) -> Result<TransferId, TransferError> {
        self.commit(|table| {
            let id = table.insert(transfer);
            Ok((id, Some(Rollback::Remove(id))))
        })
    }

    fn get(&self, id: TransferId) -> Result<Option<Transfer>, TransferError> {
        let cached = self.table.lock().map_err(|_| poisoned())?;
        Ok(cached.table.get(id))
    }

    fn update(&self, id: TransferId, mutation: Mutation<'_>) -> Result<Transfer, TransferError> {
        self.commit(|table| {
            let row = table.apply(id, mutation)?;
            let previous = table.put(row.clone());
            Ok((row, previous.map(Rollback::Restore)))
        })
    }

    fn list(&self, filter: &TransferFilter) -> Result<Vec<Transfer>, TransferError> {
        let cached = self.table.lock().map_err(|_| poisoned())?;
        Ok(cached.table.list(filter))
    }

    fn remove(&self, id: TransferId) -> Result<Option<Transfer>, TransferError> {
        self.commit(|table| {
            let removed = table.remove(id);
            let rollback = removed.clone().map(Rollback::Reinsert);
            Ok((removed, rollback))
        })
    }

    fn record_progress(
        &self,
        id: TransferId,
        mutation: Mutation<'_>,
    ) -> Result<Transfer, TransferError> {
        let mut cached = self.table.lock().map_err(|_| poisoned())?;
        let row = cached.table.apply(id, mutation)?;
        cached.table.put(row.clone());
        cached.unsaved += 1;
        if cached.unsaved >= self.progress_interval
            && let Err(e) = self.persist_unsaved(&mut cached)
        {
            // Kept in memory; the next write retries.
            warn!(transfer_id = id, error = %e, "cannot persist transfer progress");
        }
        Ok(row)
    }

    fn flush(&self) -> Result<(), TransferError> {
        let mut cached = self.table.lock().map_err(|_| poisoned())?;
        self.persist_unsaved(&mut cached)
    }
}

/// Loads the table from disk; a missing file is an empty table.
fn load_table(path: &Path) -> Result<Table, TransferError> {
    if !path.exists() {
        return Ok(Table::default());
    }
    let data = std::fs::read(path)?;
    let table: Table = serde_json::from_slice(&data)?;
    debug!("loaded {} transfer record(s) from {:?}", table.rows.len(), path);
    Ok(table)
}
