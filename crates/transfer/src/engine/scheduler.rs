//! FIFO dispatcher feeding the bounded worker pool.

use std::sync::{Arc, Weak};

use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Engine, runner};
use crate::types::TransferId;

/// Takes queued transfer ids in arrival order and starts each on a
/// worker once one of the `slots` is free.
///
/// Every entry carries the ticket issued by [`Engine::enqueue`]. Entries
/// superseded by a later enqueue (a transfer paused and resumed while
/// waiting) and ids whose transfer is no longer queued are skipped
/// without keeping a slot, so a resumed transfer runs from the back of
/// the queue.
pub(super) async fn dispatch(
    engine: Weak<Engine>,
    mut queue: mpsc::UnboundedReceiver<(TransferId, u64)>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
) {
    loop {
        let (id, ticket) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = queue.recv() => match next {
                Some(entry) => entry,
                None => break,
            },
        };

        match engine.upgrade() {
            Some(engine) if !is_runnable(&engine, id, ticket) => continue,
            Some(_) => {}
            None => break,
        }

        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let Some(engine) = engine.upgrade() else {
            break;
        };
        // The transfer may have been paused and re-queued while this
        // entry waited for a slot.
        if !is_runnable(&engine, id, ticket) || !engine.claim_ticket(id, ticket) {
            trace!(transfer_id = id, ticket, "queue entry went stale while waiting for a slot");
            continue;
        }
        tokio::spawn(async move {
            runner::run(engine, id).await;
            drop(permit);
        });
    }
    debug!("dispatcher stopped");
}

fn is_runnable(engine: &Engine, id: TransferId, ticket: u64) -> bool {
    if !engine.holds_ticket(id, ticket) {
        trace!(transfer_id = id, ticket, "skipping superseded queue entry");
        return false;
    }
    match engine.store.get(id) {
        Ok(Some(t)) if !t.state.is_queued() => {
            trace!(transfer_id = id, state = %t.state, "skipping dequeued transfer");
            engine.claim_ticket(id, ticket);
            false
        }
        _ => true,
    }
}

