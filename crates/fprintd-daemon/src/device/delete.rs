//! Deleting enrolled prints, from host storage and (best effort) from
//! on-device storage.

use std::sync::Arc;

use fprintd_core::store::StoreError;
use fprintd_core::{Error, Finger};
use tracing::{debug, warn};

use super::op::Operation;
use super::{log_offending_client, Device};
use crate::claims::{check_claim, Caller, ClaimRequirement};

impl Device {
    /// Deletes one named finger of the claimed session's user.
    ///
    /// # Errors
    ///
    /// Claim/start-rule failures, `invalid-fingername`, and the delete
    /// outcome errors.
    pub async fn delete_enrolled_finger(
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

        let _guard = self.op.begin(Operation::Delete)?;
        self.delete_enrolled_fingers(&session.username, finger).await
    }

    /// Deletes every finger of the claimed session's user.
    ///
    /// # Errors
    ///
    /// Claim/start-rule failures and the delete outcome errors.
    pub async fn delete_enrolled_fingers2(self: &Arc<Self>, caller: &Caller) -> Result<(), Error> {
        check_claim(&self.session, ClaimRequirement::Claimed, caller)?;

        let session = self
            .session
            .get()
            .ok_or_else(|| Error::Internal("claim disappeared during dispatch".into()))?;

        let _guard = self.op.begin(Operation::Delete)?;
        self.delete_enrolled_fingers(&session.username, Finger::Unknown)
            .await
    }

    /// The deprecated username-taking delete. Auto-claims: works claimed
    /// (by the owner) or unclaimed, temporarily opening storage devices in
    /// the latter case.
    ///
    /// # Errors
    ///
    /// Claim failures (other than the absent claim it tolerates) and the
    /// delete outcome errors.
    pub async fn delete_enrolled_fingers_legacy(
        self: &Arc<Self>,
        caller: &Caller,
        username: &str,
    ) -> Result<(), Error> {
        warn!("The API user should be updated to use the DeleteEnrolledFingers2 method");
        log_offending_client(caller);

        let _guard = self.op.begin(Operation::Delete)?;

        let opened = match check_claim(&self.session, ClaimRequirement::AutoClaim, caller) {
            Ok(()) => self.session.get().is_some() && self.driver.is_open(),
            Err(Error::ClaimDevice(_)) => false,
            Err(err) => return Err(err),
        };

        self.add_client(caller.id);

        let storage = self.driver.features().storage;
        if !opened && storage {
            if let Err(err) = self.driver.open().await {
                debug!("could not open device for legacy delete: {err}");
            }
        }

        let result = self.delete_enrolled_fingers(username, Finger::Unknown).await;

        if !opened && storage {
            if let Err(err) = self.driver.close().await {
                debug!("could not close device after legacy delete: {err}");
            }
        }

        result
    }

    /// Shared delete engine: `Finger::Unknown` targets every finger.
    ///
    /// Device-side failures are collected at low priority; host-side
    /// failures supersede them.
    ///
    /// # Errors
    ///
    /// `no-enrolled-prints` when the user has nothing matching,
    /// `prints-not-deleted` when host deletion failed and the print is
    /// still discoverable, `prints-not-deleted-from-device` when only the
    /// device-side delete failed.
    pub(crate) async fn delete_enrolled_fingers(
        &self,
        username: &str,
        finger: Finger,
    ) -> Result<(), Error> {
        if finger.is_named() {
            debug!(device = self.id(), %finger, user = username, "deleting enrolled finger");
        } else {
            debug!(device = self.id(), user = username, "deleting enrolled fingers");
        }

        if !self.user_has_print_enrolled(username, finger) {
            return Err(if finger.is_named() {
                Error::NoEnrolledPrints(format!(
                    "Fingerprint for finger {finger} is not enrolled"
                ))
            } else {
                Error::NoEnrolledPrints("No fingerprint enrolled".into())
            });
        }

        // Device storage first; failures there are not fatal, drivers vary.
        let mut device_error = None;
        if self.driver.features().storage {
            let info = self.driver.info();
            for stored in self.store.discover_prints(&info, username) {
                let Ok(print) = self.store.load(&info, stored, username) else {
                    continue;
                };
                if finger.is_named() && print.finger != finger {
                    continue;
                }
                if let Err(err) = self.driver.delete_print(&print).await {
                    warn!("Error deleting print from device: {err}");
                    warn!("This might indicate an issue in the driver or the fingerprint device");
                    device_error.get_or_insert_with(|| {
                        Error::PrintsNotDeletedFromDevice(format!(
                            "Failed to delete print from device storage: {err}"
                        ))
                    });
                }
            }
        }

        let info = self.driver.info();
        let mut host_error = None;
        let targets: Vec<Finger> = if finger.is_named() {
            vec![finger]
        } else {
            Finger::named().collect()
        };
        for target in targets {
            match self.store.delete(&info, target, username) {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(err) => {
                    // Only a failure that leaves the print discoverable
                    // counts.
                    if host_error.is_none() && self.user_has_print_enrolled(username, target) {
                        host_error = Some(Error::PrintsNotDeleted(format!(
                            "Failed to delete fingerprint reference: {err}"
                        )));
                    }
                }
            }
        }

        if let Some(err) = host_error {
            return Err(err);
        }
        if let Some(err) = device_error {
            // Low priority: only reported when nothing worse happened.
            return Err(err);
        }
        Ok(())
    }
}
