//! Device discovery, session lifetimes, and the idle-exit timer.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fprintd_core::driver::DeviceDriver;
use fprintd_core::store::PrintStore;
use fprintd_core::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::device::{Device, EventSink};
use crate::policy::PolicyGate;

/// Default idle-exit grace.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the drain waits for in-flight operations before exiting
/// anyway.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Hotplug notifications from the hardware context.
pub enum HostEvent {
    Added(Arc<dyn DeviceDriver>),
    Removed(String),
}

/// The hardware enumeration context, an external collaborator.
#[async_trait]
pub trait DeviceHost: Send {
    /// Initial enumeration; the manager blocks on this before publishing
    /// itself so early clients see all devices.
    async fn enumerate(&mut self) -> Vec<Arc<dyn DeviceDriver>>;

    /// The next hotplug event, or `None` when the host shuts down.
    async fn next_event(&mut self) -> Option<HostEvent>;
}

/// A host with a fixed device set and no hotplug.
pub struct StaticHost {
    drivers: Vec<Arc<dyn DeviceDriver>>,
}

impl StaticHost {
    #[must_use]
    pub fn new(drivers: Vec<Arc<dyn DeviceDriver>>) -> Self {
        Self { drivers }
    }
}

#[async_trait]
impl DeviceHost for StaticHost {
    async fn enumerate(&mut self) -> Vec<Arc<dyn DeviceDriver>> {
        std::mem::take(&mut self.drivers)
    }

    async fn next_event(&mut self) -> Option<HostEvent> {
        // No hotplug: park forever so the loop only ends on shutdown.
        std::future::pending().await
    }
}

/// Owns every published device and decides when the process may exit.
pub struct Manager {
    store: Arc<dyn PrintStore>,
    gate: PolicyGate,
    sink: Arc<dyn EventSink>,
    devices: Mutex<Vec<Arc<Device>>>,
    next_id: AtomicU32,
    busy_changed_tx: mpsc::UnboundedSender<()>,
    busy_changed_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    idle_timeout: Option<Duration>,
    shutdown_tx: watch::Sender<bool>,
}

impl Manager {
    #[must_use]
    pub fn new(
        store: Arc<dyn PrintStore>,
        gate: PolicyGate,
        sink: Arc<dyn EventSink>,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let (busy_changed_tx, busy_changed_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let manager = Arc::new(Self {
            store,
            gate,
            sink,
            devices: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(0),
            busy_changed_tx,
            busy_changed_rx: Mutex::new(Some(busy_changed_rx)),
            idle_timeout,
            shutdown_tx,
        });
        manager.spawn_idle_timer();
        manager
    }

    /// Runs initial enumeration, then keeps consuming hotplug events until
    /// the host closes or shutdown is requested.
    pub async fn run<H: DeviceHost>(self: &Arc<Self>, mut host: H) {
        for driver in host.enumerate().await {
            self.attach(driver);
        }

        let mut shutdown = self.shutdown_watch();
        loop {
            tokio::select! {
                event = host.next_event() => match event {
                    Some(HostEvent::Added(driver)) => {
                        self.attach(driver);
                    }
                    Some(HostEvent::Removed(device_id)) => self.detach(&device_id),
                    None => return,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Publishes a new device under the next monotonic path.
    pub fn attach(self: &Arc<Self>, driver: Arc<dyn DeviceDriver>) -> Arc<Device> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let device = Device::new(
            id,
            driver,
            Arc::clone(&self.store),
            self.gate.clone(),
            Arc::clone(&self.sink),
        );

        info!(id, path = device.path(), name = %device.info().name, "device added");
        self.devices.lock().expect("devices poisoned").push(Arc::clone(&device));

        // Forward the device's busy transitions to the idle timer.
        let tx = self.busy_changed_tx.clone();
        let mut busy_rx = device.busy_watch();
        tokio::spawn(async move {
            while busy_rx.changed().await.is_ok() {
                if tx.send(()).is_err() {
                    return;
                }
            }
        });

        let _ = self.busy_changed_tx.send(());
        device
    }

    /// Unpublishes the device backed by the given hardware id.
    pub fn detach(&self, device_id: &str) {
        let removed = {
            let mut devices = self.devices.lock().expect("devices poisoned");
            let before = devices.len();
            devices.retain(|device| device.info().device_id != device_id);
            before != devices.len()
        };
        if removed {
            info!(device_id, "device removed");
        } else {
            warn!(device_id, "removal for unknown device");
        }
        // The removed device may have been the busy one.
        let _ = self.busy_changed_tx.send(());
    }

    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.lock().expect("devices poisoned").clone()
    }

    /// Device paths in discovery order.
    #[must_use]
    pub fn get_devices(&self) -> Vec<String> {
        self.devices()
            .iter()
            .map(|device| device.path().to_owned())
            .collect()
    }

    /// The default (last discovered) device.
    ///
    /// # Errors
    ///
    /// `no-such-device` when none are present.
    pub fn get_default_device(&self) -> Result<String, Error> {
        self.devices()
            .last()
            .map(|device| device.path().to_owned())
            .ok_or(Error::NoSuchDevice)
    }

    /// Looks a device up by its published path.
    #[must_use]
    pub fn find_device(&self, path: &str) -> Option<Arc<Device>> {
        self.devices()
            .into_iter()
            .find(|device| device.path() == path)
    }

    #[must_use]
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits (bounded) for every device to wind down its current
    /// operation. New operations are already refused by the dispatcher
    /// once shutdown is requested.
    pub async fn drain(&self) {
        let devices = self.devices();
        let wait = async {
            for device in &devices {
                device.op.wait_idle().await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, wait).await.is_err() {
            warn!("Exiting with operations still in flight");
        }
    }

    /// Arms the idle-exit countdown whenever no device is busy; a busy
    /// transition rearms it.
    fn spawn_idle_timer(self: &Arc<Self>) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let Some(mut rx) = self
            .busy_changed_rx
            .lock()
            .expect("busy receiver poisoned")
            .take()
        else {
            return;
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                let any_busy = manager.devices().iter().any(|device| device.busy());
                drop(manager);

                if any_busy {
                    if rx.recv().await.is_none() {
                        return;
                    }
                    continue;
                }

                tokio::select! {
                    () = tokio::time::sleep(timeout) => {
                        let Some(manager) = weak.upgrade() else {
                            return;
                        };
                        // Re-check: a device may have turned busy without a
                        // wakeup racing in yet.
                        if manager.devices().iter().any(|device| device.busy()) {
                            continue;
                        }
                        info!("No devices in use for {timeout:?}, shutting down");
                        manager.request_shutdown();
                        return;
                    }
                    event = rx.recv() => {
                        if event.is_none() {
                            return;
                        }
                    }
                }
            }
        });
    }
}
