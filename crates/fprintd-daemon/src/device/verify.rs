//! Verify and identify operations, match reporting, and the post-match
//! storage reconciliation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use fprintd_core::driver::{DriverError, MatchEvent};
use fprintd_core::proto::Event;
use fprintd_core::status::verify_result_name;
use fprintd_core::{Error, Finger, Print};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::op::{Operation, StopAction};
use super::Device;
use crate::claims::{check_claim, Caller, ClaimRequirement, SessionData};

/// How long a stop waits for the driver's native completion after a
/// terminal status was already delivered.
const VERIFY_STOP_DEVICE_WAIT: std::time::Duration = std::time::Duration::from_secs(1);

/// What the spawned operation task will drive.
enum VerifyMode {
    Single(Print),
    Gallery(Vec<Print>),
}

impl Device {
    /// Starts a verification (or identification) for the claimed session.
    ///
    /// # Errors
    ///
    /// Claim/start-rule failures, `no-enrolled-prints` when the target
    /// finger or user has nothing enrolled.
    pub async fn verify_start(
        self: &Arc<Self>,
        caller: &Caller,
        finger_name: &str,
    ) -> Result<(), Error> {
        check_claim(&self.session, ClaimRequirement::Claimed, caller)?;
        let session = self
            .session
            .get()
            .ok_or_else(|| Error::Internal("claim disappeared during dispatch".into()))?;

        self.op.can_start()?;

        let mut finger = Finger::from_name(finger_name);
        let info = self.driver.info();

        let mode = if finger.is_named() {
            let print = self
                .store
                .load(&info, finger, &session.username)
                .map_err(|_| Error::NoEnrolledPrints(format!("No such print {finger}")))?;
            VerifyMode::Single(print)
        } else {
            let gallery = self.load_user_prints(&session.username);
            match gallery.len() {
                0 => {
                    return Err(Error::NoEnrolledPrints("No fingerprints enrolled".into()));
                }
                1 => {
                    // A single enrolled finger downgrades to plain verify,
                    // which also reports the finger truthfully.
                    let print = gallery.into_iter().next().expect("len checked");
                    finger = print.finger;
                    VerifyMode::Single(print)
                }
                _ if self.driver.features().identify => {
                    for print in &gallery {
                        debug!(finger = %print.finger, "adding finger to the gallery");
                    }
                    VerifyMode::Gallery(gallery)
                }
                _ => {
                    // No identify support: take the first enrolled finger in
                    // enumeration order so the selection stays deterministic
                    // and the selected-finger signal stays truthful.
                    let print = gallery.into_iter().next().expect("len checked");
                    finger = print.finger;
                    VerifyMode::Single(print)
                }
            }
        };

        let (operation, selected) = match &mode {
            VerifyMode::Single(_) => (Operation::Verify, finger.name()),
            VerifyMode::Gallery(_) => (Operation::Identify, Finger::Unknown.name()),
        };
        let token = self.op.begin_stoppable(operation)?;

        debug!(device = self.id(), finger = selected, "starting {operation:?}");

        let device = Arc::clone(self);
        let selected = selected.to_owned();
        tokio::spawn(async move {
            device.emit(Event::VerifyFingerSelected {
                device: device.path().to_owned(),
                finger: selected,
            });
            match mode {
                VerifyMode::Single(print) => device.run_verify(&session, print, token).await,
                VerifyMode::Gallery(gallery) => {
                    device.run_identify(&session, gallery, token).await;
                }
            }
        });

        Ok(())
    }

    /// Stops the current verification.
    ///
    /// # Errors
    ///
    /// Claim/stop-rule failures.
    pub async fn verify_stop(&self, caller: &Caller) -> Result<(), Error> {
        check_claim(&self.session, ClaimRequirement::Claimed, caller)?;
        self.op.can_stop(StopAction::Verify)?;

        if !self.op.verify_has_completed() {
            let reported = self
                .session
                .get()
                .is_some_and(|session| session.verify_status_reported());
            if reported {
                // A terminal status is already out; give the driver a moment
                // to deliver its own completion (and a possible real error)
                // before forcing the cancellation through.
                self.op.wait_driver_done(VERIFY_STOP_DEVICE_WAIT).await;
                self.op.can_stop(StopAction::Verify)?;
            }
        }

        let session = self.session.get();
        let done = self.op.request_stop(session.as_deref())?;
        let _ = done.await;
        Ok(())
    }

    async fn run_verify(
        self: &Arc<Self>,
        session: &Arc<SessionData>,
        print: Print,
        cancel: CancellationToken,
    ) {
        let (matched, error) = loop {
            let (match_tx, mut match_rx) = mpsc::unbounded_channel();
            let fut = self
                .driver
                .verify(&print, Some(match_tx), cancel.clone());
            tokio::pin!(fut);

            let result = loop {
                tokio::select! {
                    event = match_rx.recv() => {
                        if let Some(event) = event {
                            self.handle_match_event(session, &cancel, event);
                        }
                    }
                    result = &mut fut => break result,
                }
            };
            while let Ok(event) = match_rx.try_recv() {
                self.handle_match_event(session, &cancel, event);
            }

            debug!(
                device = self.id(),
                result = verify_result_name(result.as_ref().copied().unwrap_or(false), result.as_ref().err()),
                "verify completed"
            );

            match result {
                Err(err) if err.is_retry() => continue,
                Ok(matched) => break (matched, None),
                Err(err) => break (false, Some(err)),
            }
        };

        self.op.mark_payload_done();
        self.finish_match_operation(session, matched, error).await;
    }

    async fn run_identify(
        self: &Arc<Self>,
        session: &Arc<SessionData>,
        gallery: Vec<Print>,
        cancel: CancellationToken,
    ) {
        let (matched, error) = loop {
            let (match_tx, mut match_rx) = mpsc::unbounded_channel();
            let fut = self
                .driver
                .identify(&gallery, Some(match_tx), cancel.clone());
            tokio::pin!(fut);

            let result = loop {
                tokio::select! {
                    event = match_rx.recv() => {
                        if let Some(event) = event {
                            self.handle_match_event(session, &cancel, event);
                        }
                    }
                    result = &mut fut => break result,
                }
            };
            while let Ok(event) = match_rx.try_recv() {
                self.handle_match_event(session, &cancel, event);
            }

            match result {
                Err(err) if err.is_retry() => continue,
                Ok(outcome) => break (outcome.matched.is_some(), None),
                Err(err) => break (false, Some(err)),
            }
        };

        self.op.mark_payload_done();
        self.finish_match_operation(session, matched, error).await;
    }

    /// Common tail of verify/identify: report terminal errors, reconcile
    /// storage, wind the operation down.
    async fn finish_match_operation(
        &self,
        session: &SessionData,
        matched: bool,
        error: Option<DriverError>,
    ) {
        if let Some(err) = &error {
            self.report_verify_status(session, false, Some(err));
            if *err != DriverError::Cancelled {
                warn!(device = self.id(), "Device reported an error during verify: {err}");
            }
        }

        self.check_local_storage(matched, error.as_ref()).await;
        self.op.action_completed(Some(session));
    }

    /// The in-flight match callback: decides the reported match bit and
    /// forwards retry hints.
    fn handle_match_event(
        &self,
        session: &SessionData,
        cancel: &CancellationToken,
        event: MatchEvent,
    ) {
        debug_assert!(event.error.as_ref().is_none_or(DriverError::is_retry));
        let matched = event.print.is_some() && !cancel.is_cancelled();
        self.report_verify_status(session, matched, event.error.as_ref());
    }

    /// Emits a `VerifyStatus` signal, enforcing at-most-one terminal status
    /// per start.
    pub(crate) fn report_verify_status(
        &self,
        session: &SessionData,
        matched: bool,
        error: Option<&DriverError>,
    ) {
        let result = verify_result_name(matched, error);
        let done = error.is_none_or(|err| !err.is_retry());

        if done && session.verify_status_reported() {
            // Cancellation after a result is expected; anything else is a
            // driver double-report.
            if error != Some(&DriverError::Cancelled) {
                warn!("Verify status already reported. Ignoring {result}");
            }
            return;
        }

        debug!(device = self.id(), result, done, "reporting verify status");
        self.emit(Event::VerifyStatus {
            device: self.path().to_owned(),
            result: result.to_owned(),
            done,
        });

        if done {
            session.set_verify_status_reported(true);
        }
    }

    /// Storage reconciliation: prune host prints the device no longer
    /// knows. Runs at most once per claim session, on the first mismatch
    /// or on a data-not-found error.
    async fn check_local_storage(&self, found_match: bool, error: Option<&DriverError>) {
        debug_assert!(matches!(
            self.op.current(),
            Operation::Verify | Operation::Identify
        ));

        if !self.driver.features().storage_list {
            return;
        }

        let checked = self.local_storage_checked.load(Ordering::SeqCst);
        match error {
            Some(DriverError::DataNotFound) => {
                if checked {
                    warn!(
                        device = self.id(),
                        "Device reported that a passed print did not exist, but local storage was already reconciled"
                    );
                    return;
                }
                debug!(device = self.id(), "device reported a print as unknown");
            }
            Some(_) => return,
            None if checked || found_match => return,
            None => {
                debug!(device = self.id(), "match failed, reconciling local storage");
            }
        }

        self.local_storage_checked.store(true, Ordering::SeqCst);

        let device_prints = match self.driver.list_prints().await {
            Ok(prints) => prints,
            Err(err) => {
                warn!("Failed to query prints: {err}");
                return;
            }
        };

        for print in self.load_all_prints() {
            if device_prints.contains(&print) {
                continue;
            }
            // Unknown to the device: the host copy is stale.
            match self
                .store
                .delete(&self.driver.info(), print.finger, &print.username)
            {
                Ok(()) => {
                    tracing::info!(
                        finger = %print.finger,
                        user = %print.username,
                        "Deleted stored finger unknown to device"
                    );
                }
                Err(err) => {
                    warn!(
                        finger = %print.finger,
                        user = %print.username,
                        "Error deleting finger unknown to device: {err}"
                    );
                }
            }
        }
    }
}
