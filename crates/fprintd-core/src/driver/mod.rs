//! Uniform capability interface over the opaque fingerprint driver library.
//!
//! The daemon drives readers exclusively through [`DeviceDriver`]; the
//! concrete implementation wraps whatever hardware library is linked in.
//! [`virtual_dev`] provides a scripted in-memory implementation used by the
//! test suites.

pub mod virtual_dev;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::print::Print;

/// Static identity of a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Driver name, part of the print storage key.
    pub driver: String,
    /// Stable device identifier, part of the print storage key.
    pub device_id: String,
    /// Human-readable product name.
    pub name: String,
}

/// How the reader takes a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Press,
    Swipe,
}

impl ScanType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Press => "press",
            Self::Swipe => "swipe",
        }
    }
}

/// Reader temperature class; anything above `Cold` marks the device busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Temperature {
    Cold,
    Warm,
    Hot,
}

/// Finger presence bits reported by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerStatus {
    pub present: bool,
    pub needed: bool,
}

/// Optional driver capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    /// Can match one sample against a gallery.
    pub identify: bool,
    /// Keeps prints in on-device storage.
    pub storage: bool,
    /// Can enumerate its on-device storage.
    pub storage_list: bool,
}

/// Observable reader properties, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProperties {
    pub scan_type: ScanType,
    /// Enroll stages the driver itself needs (the session adds one for its
    /// internal identify pass on capable devices).
    pub nr_enroll_stages: u32,
    pub finger_status: FingerStatus,
    pub temperature: Temperature,
}

/// Retry classification for scan failures the client should just repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    TooShort,
    CenterFinger,
    RemoveFinger,
    General,
}

/// Errors surfaced by the capability layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The scan should be repeated; never terminal for an operation.
    #[error("scan needs to be retried")]
    Retry(RetryHint),
    /// The operation's cancellation token fired.
    #[error("operation was cancelled")]
    Cancelled,
    /// Protocol failure talking to the reader; reads as a disconnect.
    #[error("device protocol error: {0}")]
    Proto(String),
    /// A referenced print is not present in on-device storage.
    #[error("print not found in device storage")]
    DataNotFound,
    /// On-device storage is full.
    #[error("device storage is full")]
    DataFull,
    /// The device is not open.
    #[error("device is not open")]
    NotOpen,
    /// The device does not support the requested operation.
    #[error("operation not supported by device")]
    NotSupported,
    /// Any other I/O failure.
    #[error("device error: {0}")]
    Io(String),
}

impl DriverError {
    /// Whether the current capability call should simply be reissued.
    #[must_use]
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }
}

/// In-flight match report delivered while a verify/identify is running,
/// before the call itself returns.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    /// The matching print, if any.
    pub print: Option<Print>,
    /// Retry-class failure for this attempt; terminal errors are reported
    /// through the call result instead.
    pub error: Option<DriverError>,
}

/// Progress report for one enroll stage.
#[derive(Debug, Clone)]
pub struct EnrollProgress {
    /// Stages completed so far.
    pub completed_stages: u32,
    /// Retry-class failure for this stage, if the sample was rejected.
    pub error: Option<DriverError>,
}

/// Outcome of an identify call.
#[derive(Debug, Clone, Default)]
pub struct IdentifyOutcome {
    /// Gallery print that matched.
    pub matched: Option<Print>,
    /// Device-stored print that matched but was not in the gallery.
    pub found: Option<Print>,
}

/// Sender for in-flight match reports.
pub type MatchSink = mpsc::UnboundedSender<MatchEvent>;
/// Sender for enroll progress reports.
pub type ProgressSink = mpsc::UnboundedSender<EnrollProgress>;

/// The capability surface of one fingerprint reader.
///
/// All calls are serialized by the owning device session; implementations
/// may still be called concurrently for `suspend`/`resume` during sleep
/// transitions.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Static identity.
    fn info(&self) -> DeviceInfo;

    /// Capability bits.
    fn features(&self) -> DeviceFeatures;

    /// Subscribes to observable property changes.
    fn properties(&self) -> watch::Receiver<DeviceProperties>;

    /// Whether the device is currently open.
    fn is_open(&self) -> bool;

    /// Opens the device for exclusive use.
    async fn open(&self) -> Result<(), DriverError>;

    /// Closes the device.
    async fn close(&self) -> Result<(), DriverError>;

    /// Runs the enroll flow for `template`, reporting per-stage progress.
    /// Returns the completed print on success.
    async fn enroll(
        &self,
        template: Print,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<Print, DriverError>;

    /// Matches a sample against a single print. A [`MatchEvent`] is
    /// delivered through `report` before the call returns.
    async fn verify(
        &self,
        print: &Print,
        report: Option<MatchSink>,
        cancel: CancellationToken,
    ) -> Result<bool, DriverError>;

    /// Matches a sample against a gallery. A [`MatchEvent`] is delivered
    /// through `report` before the call returns.
    async fn identify(
        &self,
        gallery: &[Print],
        report: Option<MatchSink>,
        cancel: CancellationToken,
    ) -> Result<IdentifyOutcome, DriverError>;

    /// Lists on-device prints (requires the storage-list feature).
    async fn list_prints(&self) -> Result<Vec<Print>, DriverError>;

    /// Deletes one print from on-device storage.
    async fn delete_print(&self, print: &Print) -> Result<(), DriverError>;

    /// Clears all on-device storage.
    async fn clear_storage(&self) -> Result<(), DriverError>;

    /// Prepares the device for system sleep.
    async fn suspend(&self) -> Result<(), DriverError>;

    /// Restores the device after system sleep.
    async fn resume(&self) -> Result<(), DriverError>;
}
