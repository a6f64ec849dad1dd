//! Shared fixture for the device/manager integration tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use fprintd_core::driver::virtual_dev::VirtualDevice;
use fprintd_core::driver::DeviceFeatures;
use fprintd_core::proto::Event;
use fprintd_core::store::{create_store, PrintStore};
use fprintd_core::{Finger, Print};
use fprintd_daemon::claims::{Caller, CallerId};
use fprintd_daemon::device::{Device, EventSink};
use fprintd_daemon::policy::{PolicyGate, StaticPolicy};
use tokio::sync::mpsc;

/// Forwards every emitted signal to the test, regardless of audience.
pub struct TestSink(pub mpsc::UnboundedSender<Event>);

impl EventSink for TestSink {
    fn emit(&self, _targets: &[CallerId], event: Event) {
        let _ = self.0.send(event);
    }
}

pub struct Fixture {
    pub _dir: tempfile::TempDir,
    pub store: Arc<dyn PrintStore>,
    pub driver: Arc<VirtualDevice>,
    pub device: Arc<Device>,
    pub events: mpsc::UnboundedReceiver<Event>,
}

impl Fixture {
    pub fn new(features: DeviceFeatures) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = create_store("file", Some(dir.path().to_path_buf())).unwrap();
        store.init().unwrap();

        let driver = Arc::new(VirtualDevice::new("virtual_image", "0").with_features(features));
        let (tx, events) = mpsc::unbounded_channel();
        let device = Device::new(
            0,
            Arc::clone(&driver) as _,
            Arc::clone(&store),
            PolicyGate::new(Arc::new(StaticPolicy::new())),
            Arc::new(TestSink(tx)),
        );

        Self {
            _dir: dir,
            store,
            driver,
            device,
            events,
        }
    }

    /// Builds a print bound to the fixture device.
    pub fn print(&self, user: &str, finger: Finger, day: u32) -> Print {
        Print {
            username: user.to_owned(),
            finger,
            driver: "virtual_image".into(),
            device_id: "0".into(),
            enroll_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            data: format!("{user}-{finger}-template").into_bytes(),
        }
    }

    /// Persists a print on the host, optionally mirroring it to device
    /// storage.
    pub fn enroll_on_host(&self, print: &Print, on_device: bool) {
        self.store.save(print).unwrap();
        if on_device {
            self.driver.seed_storage([print.clone()]);
        }
    }

    /// The next emitted signal, bounded so a broken path fails fast.
    pub async fn next_event(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for a device signal")
            .expect("event channel closed")
    }

    /// Asserts the next non-property signal is a `VerifyStatus` and returns
    /// (result, done).
    pub async fn next_verify_status(&mut self) -> (String, bool) {
        match self.next_non_property_event().await {
            Event::VerifyStatus { result, done, .. } => (result, done),
            other => panic!("expected VerifyStatus, got {other:?}"),
        }
    }

    /// Asserts the next non-property signal is an `EnrollStatus` and returns
    /// (result, done).
    pub async fn next_enroll_status(&mut self) -> (String, bool) {
        match self.next_non_property_event().await {
            Event::EnrollStatus { result, done, .. } => (result, done),
            other => panic!("expected EnrollStatus, got {other:?}"),
        }
    }

    /// Drains property-change notifications, returning the first other
    /// event.
    pub async fn next_non_property_event(&mut self) -> Event {
        loop {
            match self.next_event().await {
                Event::PropertiesChanged { .. } => {}
                other => return other,
            }
        }
    }
}

pub fn caller(id: CallerId) -> Caller {
    Caller::new(id, 1000, None)
}

/// Lets spawned operation tasks make progress on the current-thread
/// runtime.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
