//! Transfer state machine.
//!
//! | From | To |
//! |------|----|
//! | `WAITING`, `RESUMED_WAITING` | `IN_PROGRESS`, `PAUSED`, `PAUSED_WAITING_FOR_NETWORK`, `CANCELED` |
//! | `IN_PROGRESS` | `PART_COMPLETED`, `COMPLETED` (single shot), `PAUSED`, `PAUSED_WAITING_FOR_NETWORK`, `FAILED`, `CANCELED` |
//! | `PART_COMPLETED` | `COMPLETED`, `PAUSED`, `PAUSED_WAITING_FOR_NETWORK`, `FAILED`, `CANCELED` |
//! | `PAUSED` | `WAITING`, `FAILED`, `CANCELED` |
//! | `PAUSED_WAITING_FOR_NETWORK` | `RESUMED_WAITING`, `PAUSED`, `FAILED`, `CANCELED` |
//! | `FAILED` | `WAITING`, `CANCELED` |
//! | `COMPLETED`, `CANCELED` | nothing |
//!
//! `PART_COMPLETED` is entered once per run, when every part has been
//! acknowledged and only finalisation remains. Individual parts are not
//! reported as state changes: each one is marked
//! [`PartState::Completed`](crate::PartState::Completed) on its record and
//! reported through `on_progress_changed`.

use crate::error::TransferError;
use crate::types::{TransferId, TransferState};

use TransferState::*;

impl TransferState {
    /// `COMPLETED` and `CANCELED` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Completed | Canceled)
    }

    /// Terminal, or `FAILED`: nothing will happen without a caller.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Failed
    }

    /// Eligible to be picked up by the scheduler.
    pub fn is_queued(self) -> bool {
        matches!(self, Waiting | ResumedWaiting)
    }

    /// Network work may be happening.
    pub fn is_running(self) -> bool {
        matches!(self, InProgress | PartCompleted)
    }

    pub fn can_transition_to(self, to: TransferState) -> bool {
        match self {
            Waiting | ResumedWaiting => {
                matches!(to, InProgress | Paused | PausedWaitingForNetwork | Canceled)
            }
            InProgress => matches!(
                to,
                PartCompleted | Completed | Paused | PausedWaitingForNetwork | Failed | Canceled
            ),
            PartCompleted => matches!(
                to,
                Completed | Paused | PausedWaitingForNetwork | Failed | Canceled
            ),
            Paused => matches!(to, Waiting | Failed | Canceled),
            PausedWaitingForNetwork => matches!(to, ResumedWaiting | Paused | Failed | Canceled),
            Failed => matches!(to, Waiting | Canceled),
            Completed | Canceled => false,
        }
    }

    /// Checks a move of transfer `id` from `self` to `to`.
    pub(crate) fn check_transition(
        self,
        id: TransferId,
        to: TransferState,
    ) -> Result<(), TransferError> {
        if self.is_terminal() {
            return Err(TransferError::AlreadyTerminal { id, state: self });
        }
        if !self.can_transition_to(to) {
            return Err(TransferError::InvalidStateTransition { from: self, to });
        }
        Ok(())
    }
}
