//! Sleep/resume coordination.
//!
//! While awake the coordinator holds a delay inhibitor; when the OS
//! announces a sleep transition it suspends every device and releases the
//! inhibitor only after the last suspend completed. On resume every device
//! is told to resume and a fresh inhibitor is taken.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fprintd_core::driver::DriverError;
use tracing::{debug, warn};

use crate::manager::Manager;

/// Sleep-preparation notifications from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepEvent {
    /// The system is about to sleep.
    PrepareForSleep,
    /// The system woke up (also synthesized once at startup).
    Resumed,
}

/// The platform's sleep signalling and inhibitor facility, an external
/// collaborator.
#[async_trait]
pub trait SleepMonitor: Send {
    /// The next sleep transition, or `None` when the monitor closes.
    async fn next_event(&mut self) -> Option<SleepEvent>;

    /// Takes a delay inhibitor; the returned fd blocks the sleep
    /// transition until closed.
    ///
    /// # Errors
    ///
    /// Whatever the platform reports.
    fn take_inhibitor(&self) -> std::io::Result<OwnedFd>;
}

/// Coordinates device suspend/resume around sleep transitions.
pub struct SuspendCoordinator {
    manager: Arc<Manager>,
    inhibitor: Arc<Mutex<Option<OwnedFd>>>,
}

impl SuspendCoordinator {
    #[must_use]
    pub fn new(manager: Arc<Manager>) -> Self {
        Self {
            manager,
            inhibitor: Arc::new(Mutex::new(None)),
        }
    }

    /// Consumes sleep events until the monitor closes. A synthetic resume
    /// runs first so the initial inhibitor is taken.
    pub async fn run<M: SleepMonitor>(&self, mut monitor: M) {
        self.handle_event(SleepEvent::Resumed, &monitor);
        while let Some(event) = monitor.next_event().await {
            self.handle_event(event, &monitor);
        }
    }

    /// Dispatches one sleep event (visible for tests).
    pub fn handle_event<M: SleepMonitor>(&self, event: SleepEvent, monitor: &M) {
        match event {
            SleepEvent::PrepareForSleep => self.prepare_for_sleep(),
            SleepEvent::Resumed => self.resumed(monitor),
        }
    }

    /// Suspends every device; the held inhibitor is closed when the last
    /// suspend completes. The sentinel count keeps the zero-device case
    /// releasing too.
    fn prepare_for_sleep(&self) {
        debug!("Preparing devices for sleep");

        let pending = Arc::new(AtomicI32::new(1));
        let inhibitor = Arc::clone(&self.inhibitor);

        for device in self.manager.devices() {
            pending.fetch_add(1, Ordering::SeqCst);
            let pending = Arc::clone(&pending);
            let inhibitor = Arc::clone(&inhibitor);
            tokio::spawn(async move {
                if let Err(err) = device.suspend().await {
                    // Closed and incapable devices have nothing to prepare.
                    if !matches!(err, DriverError::NotOpen | DriverError::NotSupported) {
                        warn!("Unexpected error while suspending device: {err}");
                    }
                }
                Self::complete_one(&pending, &inhibitor);
            });
        }

        // The sentinel: with zero devices this is the release itself.
        Self::complete_one(&pending, &inhibitor);
    }

    fn complete_one(pending: &AtomicI32, inhibitor: &Mutex<Option<OwnedFd>>) {
        if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let fd = inhibitor.lock().expect("inhibitor poisoned").take();
            drop(fd);
            debug!("Released delay inhibitor for sleep");
        }
    }

    /// Tells every device to resume, then re-acquires the inhibitor.
    fn resumed<M: SleepMonitor>(&self, monitor: &M) {
        debug!("Preparing devices for resume");

        for device in self.manager.devices() {
            tokio::spawn(async move {
                if let Err(err) = device.resume().await {
                    warn!("Unexpected error while resuming device: {err}");
                }
            });
        }

        match monitor.take_inhibitor() {
            Ok(fd) => {
                debug!("Got delay inhibitor for sleep");
                let previous = self
                    .inhibitor
                    .lock()
                    .expect("inhibitor poisoned")
                    .replace(fd);
                drop(previous);
            }
            Err(err) => warn!("Failed to install a sleep delay inhibitor: {err}"),
        }
    }

    /// Whether an inhibitor is currently held (visible for tests).
    #[must_use]
    pub fn holds_inhibitor(&self) -> bool {
        self.inhibitor.lock().expect("inhibitor poisoned").is_some()
    }
}

/// Channel-fed monitor for tests and embedding: events are injected through
/// a channel and each inhibitor is a fresh descriptor whose lifetime the
/// coordinator fully owns.
pub struct ChannelSleepMonitor {
    events: tokio::sync::mpsc::UnboundedReceiver<SleepEvent>,
}

impl ChannelSleepMonitor {
    #[must_use]
    pub fn new() -> (tokio::sync::mpsc::UnboundedSender<SleepEvent>, Self) {
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        (tx, Self { events })
    }
}

#[async_trait]
impl SleepMonitor for ChannelSleepMonitor {
    async fn next_event(&mut self) -> Option<SleepEvent> {
        self.events.recv().await
    }

    fn take_inhibitor(&self) -> std::io::Result<OwnedFd> {
        let file = std::fs::File::open("/dev/null")?;
        Ok(OwnedFd::from(file))
    }
}
