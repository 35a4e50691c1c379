//! Listener bindings and notification delivery.
//!
//! Notifications are queued in commit order and delivered by one task,
//! so every listener sees the events of a transfer in the order they
//! were persisted. Listeners run outside every engine lock; a panicking
//! listener is logged and skipped without affecting the transfer or the
//! other listeners.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{trace, warn};

use crate::error::TransferError;
use crate::types::{TransferId, TransferState};

/// Callback interface for one or more transfers.
///
/// Callbacks run on the engine's delivery task and should return
/// quickly; slow listeners delay every later notification.
pub trait TransferListener: Send + Sync {
    fn on_state_changed(&self, id: TransferId, state: TransferState);

    /// Reports cumulative progress. `bytes_current` never decreases.
    fn on_progress_changed(&self, _id: TransferId, _bytes_current: u64, _bytes_total: u64) {}

    /// Called once when the transfer moves to `FAILED`, before the state
    /// change itself is reported.
    fn on_error(&self, _id: TransferId, _error: &TransferError) {}
}

/// Identifies one listener binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type Binding = (SubscriptionHandle, Arc<dyn TransferListener>);
type Bindings = RwLock<HashMap<TransferId, Vec<Binding>>>;

enum Notification {
    State(TransferId, TransferState),
    Progress(TransferId, u64, u64),
    Error(TransferId, Arc<TransferError>),
    /// Current status for one freshly attached listener only.
    Replay {
        handle: SubscriptionHandle,
        id: TransferId,
        state: TransferState,
        progress: Option<(u64, u64)>,
    },
    Flush(oneshot::Sender<()>),
}

/// Maps transfer ids to their listeners and delivers notifications.
pub struct ObserverRegistry {
    bindings: Arc<Bindings>,
    next_handle: AtomicU64,
    tx: mpsc::UnboundedSender<Notification>,
}

impl ObserverRegistry {
    /// Creates the registry and spawns its delivery task.
    ///
    /// Must be called within a tokio runtime. The task ends once the
    /// registry is dropped and the queue is drained.
    pub fn new() -> Self {
        let bindings: Arc<Bindings> = Arc::default();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(rx, Arc::clone(&bindings)));
        Self {
            bindings,
            next_handle: AtomicU64::new(1),
            tx,
        }
    }

    /// Binds `listener` to transfer `id`.
    pub fn subscribe(
        &self,
        id: TransferId,
        listener: Arc<dyn TransferListener>,
    ) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.entry(id).or_default().push((handle, listener));
        trace!(id, ?handle, "listener attached");
        handle
    }

    /// Removes one binding. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: TransferId, handle: SubscriptionHandle) -> bool {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = bindings.get_mut(&id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != handle);
        let removed = list.len() != before;
        if list.is_empty() {
            bindings.remove(&id);
        }
        removed
    }

    /// Removes every binding of transfer `id`.
    pub fn unsubscribe_all(&self, id: TransferId) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.remove(&id);
    }

    pub fn listener_count(&self, id: TransferId) -> usize {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings.get(&id).map_or(0, Vec::len)
    }

    pub fn notify_state_changed(&self, id: TransferId, state: TransferState) {
        self.send(Notification::State(id, state));
    }

    pub fn notify_progress(&self, id: TransferId, bytes_current: u64, bytes_total: u64) {
        self.send(Notification::Progress(id, bytes_current, bytes_total));
    }

    pub fn notify_error(&self, id: TransferId, error: Arc<TransferError>) {
        self.send(Notification::Error(id, error));
    }

    /// Sends the current status of transfer `id` to the listener bound
    /// by `handle` alone: progress first (when known), then the state.
    pub fn replay(
        &self,
        handle: SubscriptionHandle,
        id: TransferId,
        state: TransferState,
        progress: Option<(u64, u64)>,
    ) {
        self.send(Notification::Replay {
            handle,
            id,
            state,
            progress,
        });
    }

    /// Waits until every notification queued so far has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(Notification::Flush(tx));
        let _ = rx.await;
    }

    fn send(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            warn!("notification dropped: delivery task has stopped");
        }
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Notification>, bindings: Arc<Bindings>) {
    while let Some(notification) = rx.recv().await {
        match notification {
            Notification::State(id, state) => {
                for listener in listeners_of(&bindings, id) {
                    guarded(id, || listener.on_state_changed(id, state));
                }
            }
            Notification::Progress(id, current, total) => {
                for listener in listeners_of(&bindings, id) {
                    guarded(id, || listener.on_progress_changed(id, current, total));
                }
            }
            Notification::Error(id, error) => {
                for listener in listeners_of(&bindings, id) {
                    guarded(id, || listener.on_error(id, &error));
                }
            }
            Notification::Replay {
                handle,
                id,
                state,
                progress,
            } => {
                let listener = listeners_of_handle(&bindings, id, handle);
                if let Some(listener) = listener {
                    if let Some((current, total)) = progress {
                        guarded(id, || listener.on_progress_changed(id, current, total));
                    }
                    guarded(id, || listener.on_state_changed(id, state));
                }
            }
            Notification::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    trace!("notification delivery stopped");
}

/// Snapshot of the listeners bound to `id`, taken so no lock is held
/// while callbacks run.
fn listeners_of(bindings: &Bindings, id: TransferId) -> Vec<Arc<dyn TransferListener>> {
    let bindings = bindings.read().unwrap_or_else(|e| e.into_inner());
    bindings
        .get(&id)
        .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
        .unwrap_or_default()
}

fn listeners_of_handle(
    bindings: &Bindings,
    id: TransferId,
    handle: SubscriptionHandle,
) -> Option<Arc<dyn TransferListener>> {
    let bindings = bindings.read().unwrap_or_else(|e| e.into_inner());
    bindings
        .get(&id)?
        .iter()
        .find(|(h, _)| *h == handle)
        .map(|(_, l)| Arc::clone(l))
}

fn guarded(id: TransferId, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!(id, "transfer listener panicked; notification skipped");
    }
}
