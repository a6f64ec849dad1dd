//! Enrollment: duplicate detection, the stage loop, and on-device storage
//! garbage collection.

use std::sync::Arc;

use chrono::NaiveDate;
use fprintd_core::driver::{DriverError, EnrollProgress, IdentifyOutcome};
use fprintd_core::proto::Event;
use fprintd_core::status::enroll_result_name;
use fprintd_core::{Error, Finger, Print};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::op::{Operation, StopAction};
use super::Device;
use crate::claims::{check_claim, Caller, ClaimRequirement, SessionData};

impl Device {
    /// Starts enrolling `finger_name` for the claimed session.
    ///
    /// An existing print for the finger is deleted first; devices that
    /// cannot list their storage get it cleared before the host's very
    /// first enrollment.
    ///
    /// # Errors
    ///
    /// Claim/start-rule failures, `invalid-fingername` for non-concrete
    /// fingers, and delete failures from the replace-first path.
    pub async fn enroll_start(
        self: &Arc<Self>,
        caller: &Caller,
        finger_name: &str,
    ) -> Result<(), Error> {
        check_claim(&self.session, ClaimRequirement::Claimed, caller)?;

        let finger = Finger::from_name(finger_name);
        if !finger.is_named() {
            return Err(Error::InvalidFingername);
        }

        let session = self
            .session
            .get()
            .ok_or_else(|| Error::Internal("claim disappeared during dispatch".into()))?;

        let existing = self
            .store
            .load(&self.driver.info(), finger, &session.username)
            .is_ok();

        self.op.can_start()?;

        if existing {
            self.delete_enrolled_fingers(&session.username, finger)
                .await?;
        }

        debug!(device = self.id(), %finger, "starting enrollment");

        let token = self.op.begin_stoppable(Operation::Enroll)?;

        let features = self.driver.features();
        if features.storage && !features.storage_list && self.load_all_prints().is_empty() {
            // Blind-storage device and our very first enrollment: drop
            // whatever a previous installation left on it.
            if let Err(err) = self.driver.clear_storage().await {
                warn!("Failed to clear storage before first enrollment: {err}");
            }
        }

        let device = Arc::clone(self);
        tokio::spawn(async move {
            device.run_enroll(&session, finger, token).await;
        });

        Ok(())
    }

    /// Stops the current enrollment.
    ///
    /// # Errors
    ///
    /// Claim/stop-rule failures.
    pub async fn enroll_stop(&self, caller: &Caller) -> Result<(), Error> {
        check_claim(&self.session, ClaimRequirement::Claimed, caller)?;
        self.op.can_stop(StopAction::Enroll)?;

        let session = self.session.get();
        let done = self.op.request_stop(session.as_deref())?;
        let _ = done.await;
        Ok(())
    }

    async fn run_enroll(
        self: &Arc<Self>,
        session: &Arc<SessionData>,
        finger: Finger,
        cancel: CancellationToken,
    ) {
        if self.driver.features().identify {
            // Duplicate prints are not allowed: identify the new sample
            // against everything known first.
            if !self.enroll_identify_pass(session, &cancel).await {
                return;
            }
        } else {
            warn!(
                device = %self.driver.info().name,
                "Device does not support identification, duplicate detection will not work"
            );
        }

        let mut gc_attempted = false;
        let name = loop {
            let template = Print::template(
                &session.username,
                finger,
                &self.driver.info(),
                today_local(),
            );
            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let fut = self.driver.enroll(template, progress_tx, cancel.clone());
            tokio::pin!(fut);

            let result = loop {
                tokio::select! {
                    progress = progress_rx.recv() => {
                        if let Some(progress) = progress {
                            self.handle_enroll_progress(&progress);
                        }
                    }
                    result = &mut fut => break result,
                }
            };
            while let Ok(progress) = progress_rx.try_recv() {
                self.handle_enroll_progress(&progress);
            }

            match result {
                Err(DriverError::DataFull)
                    if self.driver.features().storage_list && !gc_attempted =>
                {
                    debug!(device = self.id(), "Device storage is full");
                    gc_attempted = true;
                    if self.garbage_collect_device_print().await {
                        continue;
                    }
                    break enroll_result_name(true, false, Some(&DriverError::DataFull));
                }
                Ok(print) => {
                    if let Err(err) = self.store.save(&print) {
                        warn!("Failed to save enrolled print: {err}");
                        break "enroll-failed";
                    }
                    break enroll_result_name(true, true, None);
                }
                Err(err) => {
                    if err != DriverError::Cancelled {
                        warn!("Device reported an error during enroll: {err}");
                    }
                    break enroll_result_name(true, false, Some(&err));
                }
            }
        };

        debug!(device = self.id(), result = name, "enroll completed");
        self.emit(Event::EnrollStatus {
            device: self.path().to_owned(),
            result: name.to_owned(),
            done: true,
        });

        self.op.mark_payload_done();
        self.op.action_completed(Some(session));
    }

    /// The pre-enroll identify pass. Returns whether enrollment should
    /// proceed; on `false` the operation has already been wound down.
    async fn enroll_identify_pass(
        self: &Arc<Self>,
        session: &Arc<SessionData>,
        cancel: &CancellationToken,
    ) -> bool {
        loop {
            let gallery = self.load_all_prints();
            let result = self.driver.identify(&gallery, None, cancel.clone()).await;

            // Not finding the sample in device storage is the normal case
            // for an unenrolled finger.
            let result = match result {
                Err(DriverError::DataNotFound) => Ok(IdentifyOutcome::default()),
                other => other,
            };

            let outcome = match result {
                Err(err) if err.is_retry() => {
                    self.emit_enroll_status(enroll_result_name(false, false, Some(&err)), false);
                    continue;
                }
                Err(err) => {
                    if err != DriverError::Cancelled {
                        warn!("Device reported an error during identify for enroll: {err}");
                    }
                    self.emit_enroll_status(enroll_result_name(true, false, Some(&err)), true);
                    self.op.mark_payload_done();
                    self.op.action_completed(Some(session));
                    return false;
                }
                Ok(outcome) => outcome,
            };

            if outcome.matched.is_some() {
                // Already enrolled, by whoever: refuse.
                self.emit_enroll_status("enroll-duplicate", true);
                self.op.mark_payload_done();
                self.op.action_completed(Some(session));
                return false;
            }

            if let Some(found) = outcome.found {
                if self.driver.features().storage {
                    // On the device but unknown to the host: an orphan from
                    // an old installation. Remove it and continue.
                    if let Err(err) = self.driver.delete_print(&found).await {
                        warn!(
                            "Failed to garbage collect duplicate print, cannot continue with enroll: {err}"
                        );
                        self.emit_enroll_status("enroll-duplicate", true);
                        self.op.mark_payload_done();
                        self.op.action_completed(Some(session));
                        return false;
                    }
                }
            }

            // The identify pass counts as the extra enroll stage.
            self.emit_enroll_status("enroll-stage-passed", false);
            return true;
        }
    }

    fn handle_enroll_progress(&self, progress: &EnrollProgress) {
        let name = enroll_result_name(false, false, progress.error.as_ref());
        let base_stages = self.driver.properties().borrow().nr_enroll_stages;
        debug!(device = self.id(), result = name, stages = progress.completed_stages, "enroll stage");

        // The final stage's progress is superseded by the completion
        // callback.
        if progress.completed_stages < base_stages {
            self.emit_enroll_status(name, false);
        }
    }

    pub(crate) fn emit_enroll_status(&self, result: &str, done: bool) {
        self.emit(Event::EnrollStatus {
            device: self.path().to_owned(),
            result: result.to_owned(),
            done,
        });
    }

    /// One garbage-collect pass on a full device store: delete the most
    /// expendable device print that the host does not know about. Returns
    /// whether something was deleted.
    async fn garbage_collect_device_print(&self) -> bool {
        let device_prints = match self.driver.list_prints().await {
            Ok(prints) => prints,
            Err(err) => {
                warn!("Failed to query prints: {err}");
                return false;
            }
        };

        debug!(device = self.id(), count = device_prints.len(), "device prints stored");

        // Oldest first; ties broken by a per-print random tag so no slot is
        // systematically preferred.
        let mut keyed: Vec<(NaiveDate, u32, Print)> = {
            let mut rng = rand::thread_rng();
            device_prints
                .into_iter()
                .map(|print| (print.enroll_date, rng.gen::<u32>(), print))
                .collect()
        };
        keyed.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

        let host_prints = self.load_all_prints();
        let mut candidates = keyed
            .into_iter()
            .map(|(_, _, print)| print)
            .filter(|print| !host_prints.contains(print));

        let Some(victim) = candidates.next() else {
            debug!(device = self.id(), "no expendable device prints");
            return false;
        };

        match self.driver.delete_print(&victim).await {
            Ok(()) => true,
            Err(err) => {
                warn!("Failed to garbage collect a print: {err}");
                false
            }
        }
    }
}

fn today_local() -> NaiveDate {
    chrono::Local::now().date_naive()
}
