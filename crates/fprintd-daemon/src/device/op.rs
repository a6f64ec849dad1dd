//! Per-device operation state.
//!
//! At most one non-idle operation exists per device. Stoppable operations
//! (enroll, verify, identify) carry a cancellation token and may have one
//! pending stop invocation; the state only returns to `None` through
//! [`OpState::action_completed`] (driven by the operation task) or an
//! explicit stop/vanish path.

use std::sync::Mutex;

use fprintd_core::Error;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::claims::SessionData;

/// The operation a device is currently performing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    None,
    Open,
    Close,
    Enroll,
    Verify,
    Identify,
    Delete,
}

impl Operation {
    /// Message for `already-in-use` when this operation blocks a start.
    fn in_progress_message(self) -> &'static str {
        match self {
            Operation::None => "Another operation is already in progress",
            Operation::Open => "Claim already in progress",
            Operation::Close => "Release already in progress",
            Operation::Enroll => "Enrollment already in progress",
            Operation::Verify | Operation::Identify => "Verification already in progress",
            Operation::Delete => "Delete already in progress",
        }
    }
}

/// The action a stop request targets; verify and identify collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    Verify,
    Enroll,
}

impl StopAction {
    fn matches(self, op: Operation) -> bool {
        match self {
            Self::Verify => matches!(op, Operation::Verify | Operation::Identify),
            Self::Enroll => op == Operation::Enroll,
        }
    }

    fn none_in_progress_message(self) -> &'static str {
        match self {
            Self::Verify => "No verification in progress",
            Self::Enroll => "No enrollment in progress",
        }
    }
}

struct OpInner {
    current: Operation,
    cancel: Option<CancellationToken>,
    stop_tx: Option<oneshot::Sender<()>>,
}

/// Operation bookkeeping for one device.
pub struct OpState {
    inner: Mutex<OpInner>,
    op_tx: watch::Sender<Operation>,
    /// True while the driver call of the current stoppable operation has
    /// not yet returned its final result.
    payload_tx: watch::Sender<bool>,
}

impl OpState {
    #[must_use]
    pub fn new() -> Self {
        let (op_tx, _) = watch::channel(Operation::None);
        let (payload_tx, _) = watch::channel(false);
        Self {
            inner: Mutex::new(OpInner {
                current: Operation::None,
                cancel: None,
                stop_tx: None,
            }),
            op_tx,
            payload_tx,
        }
    }

    #[must_use]
    pub fn current(&self) -> Operation {
        self.lock().current
    }

    /// Watch the operation tag; waiters use this to await a return to
    /// `None`.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Operation> {
        self.op_tx.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OpInner> {
        self.inner.lock().expect("operation state poisoned")
    }

    fn set_current(inner: &mut OpInner, op_tx: &watch::Sender<Operation>, op: Operation) {
        inner.current = op;
        let _ = op_tx.send(op);
    }

    /// Start rule: a new operation may only begin from `None`.
    ///
    /// # Errors
    ///
    /// `already-in-use` with a message naming the blocking operation.
    pub fn can_start(&self) -> Result<(), Error> {
        let inner = self.lock();
        if inner.current == Operation::None {
            Ok(())
        } else {
            Err(Error::AlreadyInUse(
                inner.current.in_progress_message().to_owned(),
            ))
        }
    }

    /// Begins a non-stoppable operation (open/close/delete); the returned
    /// guard resets the state to `None` when dropped.
    ///
    /// # Errors
    ///
    /// `already-in-use` if another operation is current.
    pub fn begin(self: &std::sync::Arc<Self>, op: Operation) -> Result<OpGuard, Error> {
        let mut inner = self.lock();
        if inner.current != Operation::None {
            return Err(Error::AlreadyInUse(
                inner.current.in_progress_message().to_owned(),
            ));
        }
        Self::set_current(&mut inner, &self.op_tx, op);
        Ok(OpGuard {
            state: std::sync::Arc::clone(self),
        })
    }

    /// Begins a stoppable operation, installing a fresh cancellation token.
    ///
    /// # Errors
    ///
    /// `already-in-use` if another operation is current.
    pub fn begin_stoppable(&self, op: Operation) -> Result<CancellationToken, Error> {
        debug_assert!(matches!(
            op,
            Operation::Enroll | Operation::Verify | Operation::Identify
        ));
        let mut inner = self.lock();
        if inner.current != Operation::None {
            return Err(Error::AlreadyInUse(
                inner.current.in_progress_message().to_owned(),
            ));
        }
        let token = CancellationToken::new();
        inner.cancel = Some(token.clone());
        inner.stop_tx = None;
        Self::set_current(&mut inner, &self.op_tx, op);
        let _ = self.payload_tx.send(true);
        Ok(token)
    }

    /// Stop rule.
    ///
    /// # Errors
    ///
    /// `already-in-use` when a different operation is running or a stop is
    /// already pending; `no-action-in-progress` when there is nothing to
    /// stop.
    pub fn can_stop(&self, action: StopAction) -> Result<(), Error> {
        let inner = self.lock();
        let action_matches = action.matches(inner.current);

        if action_matches && inner.stop_tx.is_none() {
            return Ok(());
        }

        if inner.current != Operation::None || action_matches {
            return Err(Error::AlreadyInUse(
                "Another operation is already in progress".into(),
            ));
        }

        Err(Error::NoActionInProgress(
            action.none_in_progress_message().to_owned(),
        ))
    }

    /// Records the stop invocation and cancels the running operation; the
    /// returned receiver resolves when the operation has fully wound down.
    /// If the driver call already finished, the stop completes immediately.
    ///
    /// # Errors
    ///
    /// `already-in-use` if another stop is already pending.
    pub fn request_stop(
        &self,
        session: Option<&SessionData>,
    ) -> Result<oneshot::Receiver<()>, Error> {
        let (tx, rx) = oneshot::channel();
        let cancel = {
            let mut inner = self.lock();
            if inner.stop_tx.is_some() {
                return Err(Error::AlreadyInUse(
                    "Another operation is already in progress".into(),
                ));
            }
            inner.stop_tx = Some(tx);
            inner.cancel.clone()
        };

        match cancel {
            Some(token) => token.cancel(),
            // The operation already completed on its own; finish the stop
            // right away.
            None => self.action_completed(session),
        }
        Ok(rx)
    }

    /// Marks the current driver call's final result as delivered; the
    /// verify-stop grace period waits on this.
    pub fn mark_payload_done(&self) {
        let _ = self.payload_tx.send(false);
    }

    /// Whether the driver side of the current verify/identify has already
    /// finished (no token, cancelled, or final result delivered).
    #[must_use]
    pub fn verify_has_completed(&self) -> bool {
        let inner = self.lock();
        match &inner.cancel {
            None => true,
            Some(token) => token.is_cancelled() || !*self.payload_tx.borrow(),
        }
    }

    /// Waits up to `grace` for the driver call to deliver its final result.
    pub async fn wait_driver_done(&self, grace: std::time::Duration) {
        let mut rx = self.payload_tx.subscribe();
        let _ = tokio::time::timeout(grace, rx.wait_for(|active| !active)).await;
    }

    /// The completion path of every stoppable operation task.
    ///
    /// With a pending stop: complete it and return to `None`. With a
    /// cancelled token: return to `None`. Otherwise the operation finished
    /// naturally and the tag stays set until the client sends its stop.
    /// The cancellation token is always cleared.
    pub fn action_completed(&self, session: Option<&SessionData>) {
        let stop_tx = {
            let mut inner = self.lock();
            let stop_tx = inner.stop_tx.take();
            let cancelled = inner
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled);

            if stop_tx.is_some() || cancelled {
                Self::set_current(&mut inner, &self.op_tx, Operation::None);
                if let Some(session) = session {
                    session.set_verify_status_reported(false);
                }
            }
            inner.cancel = None;
            stop_tx
        };

        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }
    }

    /// Cancels the current operation's token, if any. Returns whether a
    /// token existed (i.e. the operation task is still in flight).
    pub fn cancel_current(&self) -> bool {
        let cancel = self.lock().cancel.clone();
        match cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Vanish path helper: a stoppable operation whose driver call already
    /// finished is waiting for a stop that will never come; reset it.
    pub fn force_idle_if_awaiting_stop(&self) {
        let mut inner = self.lock();
        if inner.cancel.is_none()
            && matches!(
                inner.current,
                Operation::Enroll | Operation::Verify | Operation::Identify
            )
        {
            Self::set_current(&mut inner, &self.op_tx, Operation::None);
        }
    }

    /// Awaits the state machine's return to `None`.
    pub async fn wait_idle(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|op| *op == Operation::None).await;
    }
}

impl Default for OpState {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets the operation tag to `None` on drop.
pub struct OpGuard {
    state: std::sync::Arc<OpState>,
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        let mut inner = self.state.lock();
        OpState::set_current(&mut inner, &self.state.op_tx, Operation::None);
    }
}
