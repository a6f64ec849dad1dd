//! Per-device session: claim lifecycle, authorization hook, watched
//! clients, and the operation state machine.

pub mod delete;
pub mod enroll;
pub mod op;
pub mod verify;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use fprintd_core::driver::{DeviceDriver, DeviceInfo, DriverError, Temperature};
use fprintd_core::proto::{device_path, DeviceSnapshot, Event, Request};
use fprintd_core::store::PrintStore;
use fprintd_core::{Error, Finger, Print};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::claims::{check_claim, Caller, CallerId, ClaimRequirement, SessionData, SessionSlot};
use crate::policy::PolicyGate;
use op::{OpState, Operation};

/// Delivery of device signals to interested clients; implemented by the
/// protocol server and by test collectors.
pub trait EventSink: Send + Sync {
    fn emit(&self, targets: &[CallerId], event: Event);
}

/// A discarding sink for contexts with no clients to notify.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _targets: &[CallerId], _event: Event) {}
}

/// One published fingerprint reader.
pub struct Device {
    id: u32,
    path: String,
    pub(crate) driver: Arc<dyn DeviceDriver>,
    pub(crate) store: Arc<dyn PrintStore>,
    gate: PolicyGate,
    pub(crate) session: SessionSlot,
    pub(crate) op: Arc<OpState>,
    /// Clients being watched for liveness; also the signal audience.
    clients: Mutex<HashSet<CallerId>>,
    sink: Arc<dyn EventSink>,
    busy_tx: watch::Sender<bool>,
    /// One-shot latch for storage reconciliation, reset on claim.
    pub(crate) local_storage_checked: AtomicBool,
}

impl Device {
    pub fn new(
        id: u32,
        driver: Arc<dyn DeviceDriver>,
        store: Arc<dyn PrintStore>,
        gate: PolicyGate,
        sink: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let (busy_tx, _) = watch::channel(false);
        let device = Arc::new(Self {
            id,
            path: device_path(id),
            driver,
            store,
            gate,
            session: SessionSlot::new(),
            op: Arc::new(OpState::new()),
            clients: Mutex::new(HashSet::new()),
            sink,
            busy_tx,
            local_storage_checked: AtomicBool::new(false),
        });
        device.spawn_property_watcher();
        device
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn info(&self) -> DeviceInfo {
        self.driver.info()
    }

    /// The operation currently in progress.
    #[must_use]
    pub fn current_operation(&self) -> Operation {
        self.op.current()
    }

    /// Whether any session currently owns the device.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.session.get().is_some()
    }

    /// Waits for the state machine to return to idle.
    pub async fn wait_idle(&self) {
        self.op.wait_idle().await;
    }

    /// Busy means a client is watched or the reader is still warm.
    #[must_use]
    pub fn busy(&self) -> bool {
        let watched = !self.clients.lock().expect("clients poisoned").is_empty();
        watched || self.driver.properties().borrow().temperature > Temperature::Cold
    }

    /// Subscribe to busy transitions (observed by the manager's idle
    /// timer).
    #[must_use]
    pub fn busy_watch(&self) -> watch::Receiver<bool> {
        self.busy_tx.subscribe()
    }

    /// Current published property snapshot.
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        let props = self.driver.properties().borrow().clone();
        let mut stages = props.nr_enroll_stages;
        // The internal identify pass before enrollment counts as a stage.
        if self.driver.features().identify {
            stages += 1;
        }
        DeviceSnapshot {
            name: self.driver.info().name,
            scan_type: props.scan_type.as_str().to_owned(),
            num_enroll_stages: stages,
            finger_present: props.finger_status.present,
            finger_needed: props.finger_status.needed,
            busy: self.busy(),
        }
    }

    fn spawn_property_watcher(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut rx = self.driver.properties();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let Some(device) = Weak::upgrade(&weak) else {
                    return;
                };
                device.update_busy();
                let snapshot = device.snapshot();
                debug!(device = device.id, ?snapshot, "device properties changed");
                device.emit(Event::PropertiesChanged {
                    device: device.path.clone(),
                    properties: snapshot,
                });
            }
        });
    }

    pub(crate) fn update_busy(&self) {
        let busy = self.busy();
        self.busy_tx.send_if_modified(|current| {
            if *current == busy {
                false
            } else {
                *current = busy;
                true
            }
        });
    }

    /// Emits a signal to every watched client.
    pub(crate) fn emit(&self, event: Event) {
        let targets: Vec<CallerId> = self
            .clients
            .lock()
            .expect("clients poisoned")
            .iter()
            .copied()
            .collect();
        self.sink.emit(&targets, event);
    }

    /// Starts watching a client for liveness (and signals).
    pub(crate) fn add_client(&self, caller: CallerId) {
        let added = self.clients.lock().expect("clients poisoned").insert(caller);
        if added {
            self.update_busy();
        }
    }

    /// The claim-state requirement of each operation.
    #[must_use]
    pub fn claim_requirement(request: &Request) -> ClaimRequirement {
        match request {
            Request::Claim { .. } => ClaimRequirement::Unclaimed,
            Request::DeleteEnrolledFingers { .. } => ClaimRequirement::AutoClaim,
            Request::ListEnrolledFingers { .. } | Request::GetProperties { .. } => {
                ClaimRequirement::Anytime
            }
            _ => ClaimRequirement::Claimed,
        }
    }

    /// The authorization hook run before dispatching any device method:
    /// claim pre-check, acting-user resolution, permission check. Returns
    /// the resolved acting username for the operations that carry one.
    ///
    /// The method handlers re-check the claim themselves; this gate exists
    /// to refuse early, before any interactive authentication is prompted.
    ///
    /// # Errors
    ///
    /// The claim, resolution, or permission failure, unchanged.
    pub async fn authorize(
        &self,
        caller: &Caller,
        request: &Request,
    ) -> Result<Option<String>, Error> {
        check_claim(&self.session, Self::claim_requirement(request), caller)?;

        let requested_user = match request {
            Request::Claim { username, .. }
            | Request::ListEnrolledFingers { username, .. }
            | Request::DeleteEnrolledFingers { username, .. } => Some(username.as_str()),
            _ => None,
        };
        let resolved = match requested_user {
            Some(requested) => Some(self.gate.resolve_username(caller, requested).await?),
            None => None,
        };

        self.gate.authorize(caller, request).await?;
        Ok(resolved)
    }

    // --- claim lifecycle -------------------------------------------------

    /// Claims the device for `caller`, opening the hardware.
    ///
    /// # Errors
    ///
    /// `already-in-use` when claimed or busy; `internal` when the open
    /// fails.
    pub async fn claim(&self, caller: &Caller, username: String) -> Result<(), Error> {
        check_claim(&self.session, ClaimRequirement::Unclaimed, caller)?;

        self.add_client(caller.id);
        let session = SessionData::new(caller.clone(), username);
        let _invocation = session.begin_invocation();
        self.session.replace(Some(Arc::clone(&session)));

        debug!(device = self.id, user = %session.username, "user claiming the device");

        let guard = match self.op.begin(Operation::Open) {
            Ok(guard) => guard,
            Err(err) => {
                self.session.replace(None);
                return Err(err);
            }
        };
        let result = self.driver.open().await;
        drop(guard);

        if let Err(err) = result {
            self.session.replace(None);
            return Err(Error::Internal(format!("Open failed with error: {err}")));
        }

        self.local_storage_checked.store(false, Ordering::SeqCst);
        debug!(device = self.id, "claimed device");
        Ok(())
    }

    /// Releases the caller's claim, cancelling any in-flight operation and
    /// closing the hardware.
    ///
    /// # Errors
    ///
    /// Claim-check failures, or `internal` when the close fails.
    pub async fn release(&self, caller: &Caller) -> Result<(), Error> {
        check_claim(&self.session, ClaimRequirement::Claimed, caller)?;

        match self.op.current() {
            Operation::Enroll => warn!("Enrollment was in progress, stopping it"),
            Operation::Verify | Operation::Identify => {
                warn!("Verification was in progress, stopping it");
            }
            Operation::Delete => warn!("Deletion was in progress, stopping it"),
            _ => {}
        }
        if self.op.cancel_current() {
            self.op.wait_idle().await;
        } else {
            // A completed verify/enroll may still be waiting for its stop.
            self.op.force_idle_if_awaiting_stop();
        }

        // The wait yielded to the loop; the session may be gone already.
        let Some(session) = self.session.get() else {
            return Ok(());
        };
        let _invocation = session.begin_invocation();

        let guard = self.op.begin(Operation::Close)?;
        let result = self.driver.close().await;
        drop(guard);

        self.session.replace(None);
        result.map_err(|err| Error::Internal(format!("Release failed with error: {err}")))?;

        debug!(device = self.id, "released device");
        Ok(())
    }

    /// The liveness path: a watched client's connection went away.
    pub async fn client_vanished(&self, caller: CallerId) {
        let owns_claim = self
            .session
            .get()
            .is_some_and(|session| session.caller.id == caller);

        if owns_claim {
            if !self.op.cancel_current() {
                // The operation already finished and was waiting for a stop
                // that will never arrive.
                self.op.force_idle_if_awaiting_stop();
            }
            self.op.wait_idle().await;

            // The session may have disappeared while waiting if the device
            // was already closing.
            if self.session.get().is_some() {
                if let Err(err) = self.driver.close().await {
                    error!(device = self.id, "Error closing device after disconnect: {err}");
                }
            }
            self.session.replace(None);
        }

        let removed = self.clients.lock().expect("clients poisoned").remove(&caller);
        if removed {
            self.update_busy();
        }
    }

    // --- queries ---------------------------------------------------------

    /// Lists the acting user's enrolled fingers.
    ///
    /// # Errors
    ///
    /// `no-enrolled-prints` when the user has none.
    pub fn list_enrolled_fingers(
        &self,
        caller: &Caller,
        username: &str,
    ) -> Result<Vec<String>, Error> {
        self.add_client(caller.id);

        let fingers: Vec<String> = self
            .load_user_prints(username)
            .into_iter()
            .filter(|print| print.finger.is_named())
            .map(|print| print.finger.name().to_owned())
            .collect();

        if fingers.is_empty() {
            return Err(Error::NoEnrolledPrints("Failed to discover prints".into()));
        }
        Ok(fingers)
    }

    // --- suspend/resume --------------------------------------------------

    /// Forwards a suspend request to the driver.
    ///
    /// # Errors
    ///
    /// Whatever the driver reports.
    pub async fn suspend(&self) -> Result<(), DriverError> {
        self.driver.suspend().await
    }

    /// Forwards a resume request to the driver.
    ///
    /// # Errors
    ///
    /// Whatever the driver reports.
    pub async fn resume(&self) -> Result<(), DriverError> {
        self.driver.resume().await
    }

    // --- print loading helpers ------------------------------------------

    /// Loads every readable print of `username` for this device.
    pub(crate) fn load_user_prints(&self, username: &str) -> Vec<Print> {
        let info = self.driver.info();
        self.store
            .discover_prints(&info, username)
            .into_iter()
            .filter_map(|finger| match self.store.load(&info, finger, username) {
                Ok(print) => Some(print),
                Err(err) => {
                    debug!(device = self.id, %finger, user = username, "skipping unreadable print: {err}");
                    None
                }
            })
            .collect()
    }

    /// Loads every readable print of every user for this device.
    pub(crate) fn load_all_prints(&self) -> Vec<Print> {
        self.store
            .discover_users()
            .iter()
            .flat_map(|user| self.load_user_prints(user))
            .collect()
    }

    pub(crate) fn user_has_print_enrolled(&self, username: &str, finger: Finger) -> bool {
        let prints = self.store.discover_prints(&self.driver.info(), username);
        if finger.is_named() {
            prints.contains(&finger)
        } else {
            !prints.is_empty()
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.op.current() != Operation::None || self.session.get().is_some() {
            error!(device = self.id, "Device was not cleaned up properly before being dropped");
        }
    }
}

/// Reads a vanished-or-misbehaving client's process name for the
/// deprecation log.
pub(crate) fn client_process_name(pid: Option<i32>) -> Option<String> {
    let pid = pid?;
    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let comm = comm.trim();
    if comm.is_empty() {
        None
    } else {
        Some(comm.to_owned())
    }
}

pub(crate) fn log_offending_client(caller: &Caller) {
    if let Some(name) = client_process_name(caller.pid) {
        warn!("Offending API user is {name}");
    } else {
        info!(uid = caller.uid, "Could not identify offending API user");
    }
}
