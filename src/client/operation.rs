//! The lifecycle of one in-flight invocation.
//!
//! ```text
//! ConnectionPending -> ConnectionAcquired -> FinishPending -> Finished
//!         |                   |                  |
//!         v                   +--------+---------+
//!      Canceled                        v
//!                            CancellationPending -> Canceled
//! ```
//!
//! Every transition is a compare-and-swap of an immutable [OpSnapshot]: it only succeeds
//! from the expected predecessor, so of two racing transitions exactly one wins and the
//! other becomes a no-op. The caller's outcome is a write-once cell, set by whichever
//! side won the race.

use arc_swap::ArcSwap;
use bytes::Bytes;
use occams_fabric_core::PeerToken;
use occams_fabric_core::error::InvokeError;
use std::pin::pin;
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpState {
    ConnectionPending,
    ConnectionAcquired,
    /// The synchronous part is in, asynchronous parts are outstanding
    FinishPending,
    Finished,
    /// Canceled while holding a connection, the driver has not released it yet
    CancellationPending,
    Canceled,
}

impl OpState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpState::Finished | OpState::Canceled)
    }
}

#[derive(Clone, Debug)]
pub struct OpSnapshot {
    pub state: OpState,
    pub error: Option<InvokeError>,
    /// Token of the bound connection, once acquired
    pub connection: Option<PeerToken>,
}

pub struct AsyncOperation {
    cell: ArcSwap<OpSnapshot>,
    outcome: OnceLock<Result<Bytes, InvokeError>>,
    delivered: Notify,
    terminal: Notify,
    cancel: Notify,
}

impl Default for AsyncOperation {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncOperation {
    pub fn new() -> Self {
        Self {
            cell: ArcSwap::from_pointee(OpSnapshot {
                state: OpState::ConnectionPending,
                error: None,
                connection: None,
            }),
            outcome: OnceLock::new(),
            delivered: Notify::new(),
            terminal: Notify::new(),
            cancel: Notify::new(),
        }
    }

    #[inline]
    pub fn snapshot(&self) -> Arc<OpSnapshot> {
        self.cell.load_full()
    }

    #[inline]
    pub fn state(&self) -> OpState {
        self.cell.load().state
    }

    /// Move from `from` to `to`, false if the current state is not `from`.
    ///
    /// `error` and `connection` replace the previous values when given.
    pub fn transition(
        &self, from: OpState, to: OpState, error: Option<InvokeError>, connection: Option<PeerToken>,
    ) -> bool {
        let mut current = self.cell.load_full();
        loop {
            if current.state != from {
                return false;
            }
            let next = Arc::new(OpSnapshot {
                state: to,
                error: error.clone().or_else(|| current.error.clone()),
                connection: connection.or(current.connection),
            });
            let prev = self.cell.compare_and_swap(&current, next);
            if Arc::ptr_eq(&prev, &current) {
                if to.is_terminal() {
                    self.terminal.notify_waiters();
                }
                return true;
            }
            current = arc_swap::Guard::into_inner(prev);
        }
    }

    /// Set the caller's outcome, only the first call has an effect.
    pub fn deliver(&self, outcome: Result<Bytes, InvokeError>) -> bool {
        if self.outcome.set(outcome).is_ok() {
            self.delivered.notify_waiters();
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn outcome(&self) -> Option<&Result<Bytes, InvokeError>> {
        self.outcome.get()
    }

    /// Wait for the synchronous outcome.
    pub async fn wait(&self) -> Result<Bytes, InvokeError> {
        loop {
            let mut notified = pin!(self.delivered.notified());
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }

    /// Wait until `Finished` or `Canceled`.
    pub async fn finished(&self) -> OpState {
        loop {
            let mut notified = pin!(self.terminal.notified());
            notified.as_mut().enable();
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    /// Cancel with `error` as the caller's outcome.
    ///
    /// Without a connection the operation is canceled right away. With one, it goes
    /// through `CancellationPending` and the driver owning the connection closes it.
    /// Once the synchronous part is in, the outcome belongs to it and a cancel only
    /// stops the wait for outstanding callbacks.
    /// Returns false when there was nothing left to cancel.
    pub fn cancel_with(&self, error: InvokeError) -> bool {
        if self.transition(OpState::ConnectionPending, OpState::Canceled, Some(error.clone()), None) {
            self.deliver(Err(error));
            return true;
        }
        if self.transition(OpState::ConnectionAcquired, OpState::CancellationPending, Some(error.clone()), None) {
            self.deliver(Err(error));
            self.cancel.notify_one();
            return true;
        }
        if self.transition(OpState::FinishPending, OpState::CancellationPending, Some(error), None) {
            self.cancel.notify_one();
            return true;
        }
        false
    }

    #[inline]
    pub fn cancel(&self) -> bool {
        self.cancel_with(InvokeError::Canceled)
    }

    /// Resolves once a cancellation needs the driver's attention.
    pub(crate) async fn cancel_requested(&self) {
        self.cancel.notified().await
    }
}
