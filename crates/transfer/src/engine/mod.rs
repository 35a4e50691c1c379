//! Transfer engine: commits state changes, owns the run queue and tracks
//! the transfers currently on a worker.
//!
//! Every state change goes through [`Engine::transition`] (or
//! [`Engine::fail`]), which persists the change and queues its
//! notification under one commit lock, so notifications for a transfer
//! are totally ordered.

mod runner;
mod scheduler;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::observer::{ObserverRegistry, SubscriptionHandle, TransferListener};
use crate::retry::RetryPolicy;
use crate::staging::{StagingAdapter, delete_staged_file};
use crate::storage::StorageClient;
use crate::store::{TransferFilter, TransferStore};
use crate::types::{PartState, Transfer, TransferDirection, TransferId, TransferState};
use crate::validation::ObjectLocation;

/// Cancellation handles of a transfer that is on a worker.
#[derive(Clone)]
pub(crate) struct RunControl {
    /// Stop launching new parts; in-flight parts finish.
    pub(crate) stop: CancellationToken,
    /// Abandon in-flight parts; their results are discarded.
    pub(crate) abort: CancellationToken,
}

pub(crate) struct Engine {
    pub(crate) config: TransferConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) store: Arc<dyn TransferStore>,
    pub(crate) storage: Arc<dyn StorageClient>,
    pub(crate) observers: ObserverRegistry,
    pub(crate) staging: StagingAdapter,
    commit: Mutex<()>,
    queue_tx: mpsc::UnboundedSender<(TransferId, u64)>,
    /// Latest queue ticket per transfer; older queue entries are stale.
    tickets: Mutex<HashMap<TransferId, u64>>,
    next_ticket: AtomicU64,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<TransferId, RunControl>>,
    leases: Mutex<HashMap<TransferId, Arc<tokio::sync::Mutex<()>>>>,
    online: AtomicBool,
    shutdown: CancellationToken,
}

impl Engine {
    /// Creates the engine and spawns its dispatcher. Must be called
    /// within a tokio runtime.
    pub(crate) fn start(
        config: TransferConfig,
        store: Arc<dyn TransferStore>,
        storage: Arc<dyn StorageClient>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.max_concurrent_transfers));
        let engine = Arc::new(Self {
            retry: config.retry_policy(),
            staging: StagingAdapter::new(config.staging_dir()),
            config,
            store,
            storage,
            observers: ObserverRegistry::new(),
            commit: Mutex::new(()),
            queue_tx,
            tickets: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            slots: Arc::clone(&slots),
            active: Mutex::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(scheduler::dispatch(
            Arc::downgrade(&engine),
            queue_rx,
            slots,
            engine.shutdown.clone(),
        ));
        engine
    }

    fn lock_commit(&self) -> Result<MutexGuard<'_, ()>, TransferError> {
        self.commit
            .lock()
            .map_err(|_| TransferError::Store("commit lock poisoned".into()))
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub(crate) fn get(&self, id: TransferId) -> Result<Transfer, TransferError> {
        self.store
            .get(id)?
            .ok_or(TransferError::UnknownTransfer(id))
    }

    /// Saves a new record, binds its initial listener, reports `WAITING`
    /// and queues it.
    pub(crate) fn create(
        &self,
        transfer: Transfer,
        listener: Option<Arc<dyn TransferListener>>,
    ) -> Result<Transfer, TransferError> {
        if self.is_shut_down() {
            return Err(TransferError::ShutDown);
        }
        let record = {
            let _commit = self.lock_commit()?;
            let id = self.store.create(transfer)?;
            if let Some(listener) = listener {
                self.observers.subscribe(id, listener);
            }
            self.observers.notify_state_changed(id, TransferState::Waiting);
            self.get(id)?
        };
        info!(
            transfer_id = record.id,
            direction = ?record.direction,
            bucket = %record.bucket,
            key = %record.key,
            "transfer created"
        );
        self.enqueue(record.id);
        Ok(record)
    }

    /// Puts transfer `id` at the back of the run queue. Any earlier queue
    /// entry for the same transfer becomes stale.
    pub(crate) fn enqueue(&self, id: TransferId) {
        let Ok(mut tickets) = self.tickets.lock() else {
            warn!(transfer_id = id, "run queue poisoned; transfer left queued");
            return;
        };
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        tickets.insert(id, ticket);
        if self.queue_tx.send((id, ticket)).is_err() {
            warn!(transfer_id = id, "run queue closed; transfer left queued");
        }
    }

    /// Whether `ticket` is the latest queue entry of transfer `id`.
    pub(crate) fn holds_ticket(&self, id: TransferId, ticket: u64) -> bool {
        self.tickets
            .lock()
            .map(|tickets| tickets.get(&id) == Some(&ticket))
            .unwrap_or(false)
    }

    /// Consumes the latest queue entry of transfer `id`. Returns false
    /// when `ticket` was superseded by a later enqueue.
    pub(crate) fn claim_ticket(&self, id: TransferId, ticket: u64) -> bool {
        match self.tickets.lock() {
            Ok(mut tickets) if tickets.get(&id) == Some(&ticket) => {
                tickets.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Moves transfer `id` to `to`, reporting it to listeners.
    pub(crate) fn transition(
        &self,
        id: TransferId,
        to: TransferState,
    ) -> Result<Transfer, TransferError> {
        let mut from = to;
        let updated = {
            let _commit = self.lock_commit()?;
            let updated = self.store.update(id, &mut |t| {
                t.state.check_transition(id, to)?;
                from = t.state;
                t.state = to;
                if to == TransferState::Waiting {
                    t.error = None;
                }
                Ok(())
            })?;
            self.observers.notify_state_changed(id, to);
            updated
        };
        info!(transfer_id = id, from = %from, to = %to, "transfer state changed");
        self.after_transition(&updated);
        Ok(updated)
    }

    /// Moves transfer `id` to `FAILED`, reporting `error` first.
    ///
    /// Transfers that already left the running states (canceled, for
    /// instance) are left alone.
    pub(crate) fn fail(&self, id: TransferId, error: TransferError) {
        let message = error.to_string();
        let error = Arc::new(error);
        let updated = {
            let _commit = match self.lock_commit() {
                Ok(guard) => guard,
                Err(e) => {
                    error!(transfer_id = id, error = %e, "cannot record failure");
                    return;
                }
            };
            let result = self.store.update(id, &mut |t| {
                t.state.check_transition(id, TransferState::Failed)?;
                t.state = TransferState::Failed;
                t.error = Some(message.clone());
                Ok(())
            });
            match result {
                Ok(updated) => {
                    self.observers.notify_error(id, Arc::clone(&error));
                    self.observers
                        .notify_state_changed(id, TransferState::Failed);
                    updated
                }
                Err(e) if e.is_usage_error() => {
                    debug!(transfer_id = id, error = %message, reason = %e, "failure discarded");
                    return;
                }
                Err(e) => {
                    error!(transfer_id = id, error = %e, "cannot record failure");
                    return;
                }
            }
        };
        error!(transfer_id = id, error = %message, "transfer failed");
        self.after_transition(&updated);
    }

    /// Deletes the engine-owned staged file once a transfer settles.
    fn after_transition(&self, transfer: &Transfer) {
        if transfer.state.is_settled() && transfer.is_temporary_file {
            delete_staged_file(&transfer.local_path);
        }
    }

    /// Applies a bookkeeping change to a non-terminal record.
    pub(crate) fn amend(
        &self,
        id: TransferId,
        change: &mut dyn FnMut(&mut Transfer),
    ) -> Result<Transfer, TransferError> {
        let _commit = self.lock_commit()?;
        self.store.update(id, &mut |t| {
            if t.state.is_terminal() {
                return Err(TransferError::AlreadyTerminal { id, state: t.state });
            }
            change(t);
            Ok(())
        })
    }

    /// Marks part `part_number` acknowledged and reports the new total.
    /// Results for transfers that already ended are discarded.
    pub(crate) fn record_part(
        &self,
        id: TransferId,
        part_number: u32,
        etag: &str,
    ) -> Result<(), TransferError> {
        let _commit = self.lock_commit()?;
        let mut advanced = false;
        let result = self.store.record_progress(id, &mut |t| {
            if t.state.is_terminal() {
                return Err(TransferError::AlreadyTerminal { id, state: t.state });
            }
            if let Some(part) = t
                .parts
                .iter_mut()
                .find(|p| p.part_number == part_number && !p.is_completed())
            {
                part.state = PartState::Completed;
                part.etag = Some(etag.to_string());
                t.bytes_transferred += part.len();
                advanced = true;
            }
            Ok(())
        });
        match result {
            Ok(updated) => {
                if advanced {
                    debug!(transfer_id = id, part = part_number, bytes = updated.bytes_transferred, "part completed");
                    self.observers.notify_progress(
                        id,
                        updated.bytes_transferred,
                        updated.total_bytes.unwrap_or(updated.bytes_transferred),
                    );
                }
                Ok(())
            }
            Err(e) if e.is_usage_error() => {
                debug!(transfer_id = id, part = part_number, "late part result discarded");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Records the body of a single-shot transfer as acknowledged.
    pub(crate) fn record_single_shot(
        &self,
        id: TransferId,
        total: u64,
        etag: &str,
    ) -> Result<(), TransferError> {
        let _commit = self.lock_commit()?;
        let result = self.store.update(id, &mut |t| {
            if t.state.is_terminal() {
                return Err(TransferError::AlreadyTerminal { id, state: t.state });
            }
            t.bytes_transferred = t.bytes_transferred.max(total);
            t.object_etag = Some(etag.to_string());
            Ok(())
        });
        match result {
            Ok(updated) => {
                self.observers
                    .notify_progress(id, updated.bytes_transferred, total);
                Ok(())
            }
            Err(e) if e.is_usage_error() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Registers fresh cancellation handles for a run of transfer `id`.
    pub(crate) fn activate(&self, id: TransferId) -> RunControl {
        let abort = self.shutdown.child_token();
        let control = RunControl {
            stop: abort.child_token(),
            abort,
        };
        if let Ok(mut active) = self.active.lock() {
            active.insert(id, control.clone());
        }
        control
    }

    pub(crate) fn deactivate(&self, id: TransferId) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&id);
        }
    }

    fn control_of(&self, id: TransferId) -> Option<RunControl> {
        self.active
            .lock()
            .ok()
            .and_then(|active| active.get(&id).cloned())
    }

    /// Returns the lease that keeps two workers off the same transfer.
    pub(crate) fn lease(&self, id: TransferId) -> Arc<tokio::sync::Mutex<()>> {
        match self.leases.lock() {
            Ok(mut leases) => Arc::clone(leases.entry(id).or_default()),
            Err(_) => Arc::default(),
        }
    }

    /// Drops the lease entry once no other worker is waiting for it.
    pub(crate) fn release_lease(&self, id: TransferId, lease: Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut leases) = self.leases.lock()
            && Arc::strong_count(&lease) == 2
        {
            leases.remove(&id);
        }
    }

    pub(crate) fn pause(&self, id: TransferId) -> Result<Transfer, TransferError> {
        let updated = self.transition(id, TransferState::Paused)?;
        if let Some(control) = self.control_of(id) {
            control.stop.cancel();
        }
        Ok(updated)
    }

    /// Re-queues a paused or failed transfer at the back of the queue.
    pub(crate) fn resume(&self, id: TransferId) -> Result<Transfer, TransferError> {
        if self.is_shut_down() {
            return Err(TransferError::ShutDown);
        }
        let current = self.get(id)?;
        current.state.check_transition(id, TransferState::Waiting)?;
        if current.direction == TransferDirection::Upload && !current.local_path.exists() {
            return Err(TransferError::Staging(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} no longer exists", current.local_path.display()),
            )));
        }
        let updated = self.transition(id, TransferState::Waiting)?;
        self.enqueue(id);
        Ok(updated)
    }

    /// Cancels transfer `id`. The record is `CANCELED` when this returns;
    /// in-flight parts are aborted in the background.
    pub(crate) fn cancel(self: &Arc<Self>, id: TransferId) -> Result<Transfer, TransferError> {
        let updated = self.transition(id, TransferState::Canceled)?;
        if let Some(control) = self.control_of(id) {
            control.abort.cancel();
        }
        if updated.direction == TransferDirection::Upload
            && let Some(upload_id) = updated.multipart_upload_id.clone()
        {
            self.abort_multipart_in_background(&updated, upload_id);
        }
        Ok(updated)
    }

    /// Asks the storage service to discard a multipart upload. Best effort.
    pub(crate) fn abort_multipart_in_background(self: &Arc<Self>, transfer: &Transfer, upload_id: String) {
        let location = match ObjectLocation::new(&transfer.bucket, &transfer.key) {
            Ok(location) => location,
            Err(e) => {
                warn!(transfer_id = transfer.id, error = %e, "cannot abort multipart upload");
                return;
            }
        };
        let engine = Arc::clone(self);
        let id = transfer.id;
        tokio::spawn(async move {
            let request = engine.storage.abort_multipart(&location, &upload_id);
            match tokio::time::timeout(engine.config.part_timeout(), request).await {
                Ok(Ok(())) => debug!(transfer_id = id, %upload_id, "multipart upload aborted"),
                Ok(Err(e)) => warn!(transfer_id = id, %upload_id, error = %e, "failed to abort multipart upload"),
                Err(_) => warn!(transfer_id = id, %upload_id, "abort of multipart upload timed out"),
            }
        });
    }

    /// Cancels transfer `id` if needed and forgets it.
    pub(crate) fn remove(self: &Arc<Self>, id: TransferId) -> Result<Transfer, TransferError> {
        let current = self.get(id)?;
        if !current.state.is_terminal() {
            match self.cancel(id) {
                Ok(_) => {}
                Err(e) if e.is_usage_error() => {}
                Err(e) => return Err(e),
            }
        }
        let removed = self
            .store
            .remove(id)?
            .ok_or(TransferError::UnknownTransfer(id))?;
        self.observers.unsubscribe_all(id);
        if let Ok(mut tickets) = self.tickets.lock() {
            tickets.remove(&id);
        }
        if removed.is_temporary_file {
            delete_staged_file(&removed.local_path);
        }
        info!(transfer_id = id, "transfer removed");
        Ok(removed)
    }

    /// Binds `listener` to transfer `id`. Unless the transfer is still
    /// `WAITING`, its current status is replayed to the new listener.
    pub(crate) fn subscribe(
        &self,
        id: TransferId,
        listener: Arc<dyn TransferListener>,
    ) -> Result<(SubscriptionHandle, Transfer), TransferError> {
        let _commit = self.lock_commit()?;
        let current = self.get(id)?;
        let handle = self.observers.subscribe(id, listener);
        if current.state != TransferState::Waiting {
            let progress = current
                .total_bytes
                .map(|total| (current.bytes_transferred, total));
            self.observers.replay(handle, id, current.state, progress);
        }
        Ok((handle, current))
    }

    /// Applies a connectivity change.
    ///
    /// Going offline parks queued and running transfers in
    /// `PAUSED_WAITING_FOR_NETWORK` and aborts their in-flight parts.
    /// Coming back moves them to `RESUMED_WAITING` and re-queues them.
    pub(crate) fn set_network_available(&self, available: bool) -> Result<(), TransferError> {
        let was = self.online.swap(available, Ordering::SeqCst);
        if was == available {
            return Ok(());
        }
        info!(available, "network availability changed");
        let transfers = self.store.list(&TransferFilter::all())?;
        if available {
            for t in transfers
                .iter()
                .filter(|t| t.state == TransferState::PausedWaitingForNetwork)
            {
                match self.transition(t.id, TransferState::ResumedWaiting) {
                    Ok(_) => self.enqueue(t.id),
                    Err(e) if e.is_usage_error() => {}
                    Err(e) => return Err(e),
                }
            }
        } else {
            for t in transfers
                .iter()
                .filter(|t| t.state.is_queued() || t.state.is_running())
            {
                self.park_for_network(t.id)?;
            }
        }
        Ok(())
    }

    /// Moves transfer `id` to `PAUSED_WAITING_FOR_NETWORK`.
    pub(crate) fn park_for_network(&self, id: TransferId) -> Result<(), TransferError> {
        match self.transition(id, TransferState::PausedWaitingForNetwork) {
            Ok(_) => {}
            Err(e) if e.is_usage_error() => return Ok(()),
            Err(e) => return Err(e),
        }
        if let Some(control) = self.control_of(id) {
            control.abort.cancel();
        }
        Ok(())
    }

    /// Re-queues transfers persisted by an earlier process.
    ///
    /// Records left running are repaired to `RESUMED_WAITING` first.
    /// Returns the number of transfers queued.
    pub(crate) fn recover(&self) -> Result<usize, TransferError> {
        let transfers = self.store.list(&TransferFilter::all())?;
        let mut queued = 0;
        for t in transfers {
            if self.control_of(t.id).is_some() {
                continue;
            }
            let state = if t.state.is_running() {
                let _commit = self.lock_commit()?;
                self.store.update(t.id, &mut |row| {
                    row.state = TransferState::ResumedWaiting;
                    Ok(())
                })?;
                self.observers
                    .notify_state_changed(t.id, TransferState::ResumedWaiting);
                info!(transfer_id = t.id, from = %t.state, "interrupted transfer repaired");
                TransferState::ResumedWaiting
            } else {
                t.state
            };
            if state.is_queued() {
                self.enqueue(t.id);
                queued += 1;
            }
        }
        info!(queued, "transfers recovered");
        Ok(queued)
    }

    /// Stops the dispatcher, aborts in-flight work and waits for the
    /// workers to return. Records keep their current state.
    pub(crate) async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("transfer engine shutting down");
        self.shutdown.cancel();
        let permits = u32::try_from(self.config.max_concurrent_transfers).unwrap_or(u32::MAX);
        match self.slots.acquire_many(permits).await {
            Ok(all) => all.forget(),
            Err(_) => debug!("worker slots already closed"),
        }
        self.slots.close();
        if let Err(e) = self.store.flush() {
            warn!(error = %e, "cannot persist transfer records");
        }
        self.observers.flush().await;
    }
}

/// Checks that `path` names an existing regular file and returns its size.
pub(crate) fn source_size(path: &Path) -> Result<u64, TransferError> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        )));
    }
    Ok(meta.len())
}
