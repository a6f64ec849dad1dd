//! Scripted in-memory reader used by the test suites.
//!
//! Tests queue the outcome of each scan before (or while) an operation runs;
//! the device blocks until a step is available, which lets a test drive an
//! operation mid-flight (e.g. cancel while a scan is pending).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{
    DeviceDriver, DeviceFeatures, DeviceInfo, DeviceProperties, DriverError, EnrollProgress,
    FingerStatus, IdentifyOutcome, MatchEvent, MatchSink, ProgressSink, RetryHint, ScanType,
    Temperature,
};
use crate::print::Print;

/// One scripted verify scan.
#[derive(Debug, Clone)]
pub enum VerifyStep {
    Retry(RetryHint),
    Match(bool),
    Error(DriverError),
}

/// One scripted identify scan.
#[derive(Debug, Clone)]
pub enum IdentifyStep {
    Retry(RetryHint),
    /// Match the gallery entry at this index.
    Match(usize),
    NoMatch,
    /// No gallery match, but this device-stored print matched.
    Found(Print),
    Error(DriverError),
}

/// One scripted enroll event.
#[derive(Debug, Clone)]
pub enum EnrollStep {
    StagePassed,
    Retry(RetryHint),
    Complete,
    Error(DriverError),
}

/// Unbounded script queue the device awaits on.
struct Script<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> Script<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn push(&self, step: T) {
        // The receiver lives as long as the device.
        let _ = self.tx.send(step);
    }

    async fn next(&self) -> T {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .expect("script channel closed")
    }
}

/// Scripted virtual fingerprint reader.
pub struct VirtualDevice {
    info: DeviceInfo,
    features: DeviceFeatures,
    props_tx: watch::Sender<DeviceProperties>,
    open: AtomicBool,
    storage: Mutex<Vec<Print>>,
    verify_steps: Script<VerifyStep>,
    identify_steps: Script<IdentifyStep>,
    enroll_steps: Script<EnrollStep>,
    open_error: Mutex<Option<DriverError>>,
    delete_errors: Mutex<Vec<DriverError>>,
    manual_suspend: AtomicBool,
    suspend_gate: Script<Result<(), DriverError>>,
    suspend_calls: AtomicU32,
    resume_calls: AtomicU32,
    enroll_counter: AtomicU32,
}

impl VirtualDevice {
    #[must_use]
    pub fn new(driver: &str, device_id: &str) -> Self {
        let (props_tx, _) = watch::channel(DeviceProperties {
            scan_type: ScanType::Press,
            nr_enroll_stages: 5,
            finger_status: FingerStatus::default(),
            temperature: Temperature::Cold,
        });
        Self {
            info: DeviceInfo {
                driver: driver.to_owned(),
                device_id: device_id.to_owned(),
                name: format!("Virtual {driver} reader"),
            },
            features: DeviceFeatures::default(),
            props_tx,
            open: AtomicBool::new(false),
            storage: Mutex::new(Vec::new()),
            verify_steps: Script::new(),
            identify_steps: Script::new(),
            enroll_steps: Script::new(),
            open_error: Mutex::new(None),
            delete_errors: Mutex::new(Vec::new()),
            manual_suspend: AtomicBool::new(false),
            suspend_gate: Script::new(),
            suspend_calls: AtomicU32::new(0),
            resume_calls: AtomicU32::new(0),
            enroll_counter: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_features(mut self, features: DeviceFeatures) -> Self {
        self.features = features;
        self
    }

    // --- scripting -------------------------------------------------------

    pub fn queue_verify(&self, step: VerifyStep) {
        self.verify_steps.push(step);
    }

    pub fn queue_identify(&self, step: IdentifyStep) {
        self.identify_steps.push(step);
    }

    pub fn queue_enroll(&self, step: EnrollStep) {
        self.enroll_steps.push(step);
    }

    /// Queues `stages - 1` passed stages followed by a completion, the
    /// common happy-path enroll script.
    pub fn queue_enroll_success(&self, stages: u32) {
        for _ in 1..stages {
            self.queue_enroll(EnrollStep::StagePassed);
        }
        self.queue_enroll(EnrollStep::Complete);
    }

    pub fn fail_next_open(&self, error: DriverError) {
        *self.open_error.lock().unwrap() = Some(error);
    }

    pub fn fail_next_delete(&self, error: DriverError) {
        self.delete_errors.lock().unwrap().push(error);
    }

    /// When enabled, `suspend` blocks until [`Self::complete_suspend`] is
    /// called, letting tests observe barrier ordering.
    pub fn set_manual_suspend(&self, manual: bool) {
        self.manual_suspend.store(manual, Ordering::SeqCst);
    }

    pub fn complete_suspend(&self, result: Result<(), DriverError>) {
        self.suspend_gate.push(result);
    }

    // --- state inspection ------------------------------------------------

    pub fn seed_storage(&self, prints: impl IntoIterator<Item = Print>) {
        self.storage.lock().unwrap().extend(prints);
    }

    #[must_use]
    pub fn storage_snapshot(&self) -> Vec<Print> {
        self.storage.lock().unwrap().clone()
    }

    #[must_use]
    pub fn suspend_calls(&self) -> u32 {
        self.suspend_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn resume_calls(&self) -> u32 {
        self.resume_calls.load(Ordering::SeqCst)
    }

    // --- property control ------------------------------------------------

    pub fn set_temperature(&self, temperature: Temperature) {
        self.props_tx.send_modify(|p| p.temperature = temperature);
    }

    pub fn set_scan_type(&self, scan_type: ScanType) {
        self.props_tx.send_modify(|p| p.scan_type = scan_type);
    }

    pub fn set_nr_enroll_stages(&self, stages: u32) {
        self.props_tx.send_modify(|p| p.nr_enroll_stages = stages);
    }

    pub fn set_finger_status(&self, status: FingerStatus) {
        self.props_tx.send_modify(|p| p.finger_status = status);
    }

    fn require_open(&self) -> Result<(), DriverError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DriverError::NotOpen)
        }
    }

    fn report(sink: &Option<MatchSink>, event: MatchEvent) {
        if let Some(sink) = sink {
            let _ = sink.send(event);
        }
    }
}

#[async_trait]
impl DeviceDriver for VirtualDevice {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn features(&self) -> DeviceFeatures {
        self.features
    }

    fn properties(&self) -> watch::Receiver<DeviceProperties> {
        self.props_tx.subscribe()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), DriverError> {
        if let Some(err) = self.open_error.lock().unwrap().take() {
            return Err(err);
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn enroll(
        &self,
        template: Print,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Print, DriverError> {
        self.require_open()?;
        let mut completed = 0u32;
        loop {
            let step = tokio::select! {
                () = cancel.cancelled() => return Err(DriverError::Cancelled),
                step = self.enroll_steps.next() => step,
            };
            match step {
                EnrollStep::StagePassed => {
                    completed += 1;
                    let _ = progress.send(EnrollProgress {
                        completed_stages: completed,
                        error: None,
                    });
                }
                EnrollStep::Retry(hint) => {
                    let _ = progress.send(EnrollProgress {
                        completed_stages: completed,
                        error: Some(DriverError::Retry(hint)),
                    });
                }
                EnrollStep::Complete => {
                    let serial = self.enroll_counter.fetch_add(1, Ordering::SeqCst);
                    let mut print = template;
                    print.data = format!("{}-template-{serial}", self.info.driver).into_bytes();
                    if self.features.storage {
                        self.storage.lock().unwrap().push(print.clone());
                    }
                    return Ok(print);
                }
                EnrollStep::Error(err) => return Err(err),
            }
        }
    }

    async fn verify(
        &self,
        print: &Print,
        report: Option<MatchSink>,
        cancel: CancellationToken,
    ) -> Result<bool, DriverError> {
        self.require_open()?;
        let step = tokio::select! {
            () = cancel.cancelled() => return Err(DriverError::Cancelled),
            step = self.verify_steps.next() => step,
        };
        match step {
            VerifyStep::Retry(hint) => {
                Self::report(
                    &report,
                    MatchEvent {
                        print: None,
                        error: Some(DriverError::Retry(hint)),
                    },
                );
                Err(DriverError::Retry(hint))
            }
            VerifyStep::Match(matched) => {
                Self::report(
                    &report,
                    MatchEvent {
                        print: matched.then(|| print.clone()),
                        error: None,
                    },
                );
                Ok(matched)
            }
            VerifyStep::Error(err) => Err(err),
        }
    }

    async fn identify(
        &self,
        gallery: &[Print],
        report: Option<MatchSink>,
        cancel: CancellationToken,
    ) -> Result<IdentifyOutcome, DriverError> {
        self.require_open()?;
        let step = tokio::select! {
            () = cancel.cancelled() => return Err(DriverError::Cancelled),
            step = self.identify_steps.next() => step,
        };
        match step {
            IdentifyStep::Retry(hint) => {
                Self::report(
                    &report,
                    MatchEvent {
                        print: None,
                        error: Some(DriverError::Retry(hint)),
                    },
                );
                Err(DriverError::Retry(hint))
            }
            IdentifyStep::Match(index) => {
                let matched = gallery.get(index).cloned();
                Self::report(
                    &report,
                    MatchEvent {
                        print: matched.clone(),
                        error: None,
                    },
                );
                Ok(IdentifyOutcome {
                    matched,
                    found: None,
                })
            }
            IdentifyStep::NoMatch => {
                Self::report(
                    &report,
                    MatchEvent {
                        print: None,
                        error: None,
                    },
                );
                Ok(IdentifyOutcome::default())
            }
            IdentifyStep::Found(found) => {
                Self::report(
                    &report,
                    MatchEvent {
                        print: None,
                        error: None,
                    },
                );
                Ok(IdentifyOutcome {
                    matched: None,
                    found: Some(found),
                })
            }
            IdentifyStep::Error(err) => Err(err),
        }
    }

    async fn list_prints(&self) -> Result<Vec<Print>, DriverError> {
        if !self.features.storage_list {
            return Err(DriverError::NotSupported);
        }
        Ok(self.storage.lock().unwrap().clone())
    }

    async fn delete_print(&self, print: &Print) -> Result<(), DriverError> {
        if !self.features.storage {
            return Err(DriverError::NotSupported);
        }
        {
            let mut errors = self.delete_errors.lock().unwrap();
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }
        let mut storage = self.storage.lock().unwrap();
        let before = storage.len();
        storage.retain(|p| p != print);
        if storage.len() == before {
            return Err(DriverError::DataNotFound);
        }
        Ok(())
    }

    async fn clear_storage(&self) -> Result<(), DriverError> {
        if !self.features.storage {
            return Err(DriverError::NotSupported);
        }
        self.storage.lock().unwrap().clear();
        Ok(())
    }

    async fn suspend(&self) -> Result<(), DriverError> {
        self.suspend_calls.fetch_add(1, Ordering::SeqCst);
        if self.manual_suspend.load(Ordering::SeqCst) {
            return self.suspend_gate.next().await;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), DriverError> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
