//! Persistent print storage.
//!
//! [`PrintStore`] is the pluggable storage contract; [`file::FileStore`] is
//! the shipped backend. Backends are registered statically and selected by
//! the `type` key of the daemon configuration's `[storage]` table.

pub mod file;

use std::path::PathBuf;
use std::sync::Arc;

use crate::driver::DeviceInfo;
use crate::finger::Finger;
use crate::print::Print;

/// Errors produced by print store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No print stored for the requested (device, finger, user).
    #[error("print not found")]
    NotFound,
    /// A stored print exists but does not belong to the requested identity.
    #[error("stored print is incompatible: {0}")]
    Incompatible(String),
    /// Print encoding failed.
    #[error("failed to serialize print: {0}")]
    Serialize(String),
    /// Filesystem permission failure.
    #[error("permission denied: {0}")]
    Permission(String),
    /// Any other I/O failure.
    #[error("storage I/O error: {0}")]
    Io(String),
    /// The configured storage backend name is not registered.
    #[error("unknown storage backend '{0}'")]
    UnknownBackend(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound,
            std::io::ErrorKind::PermissionDenied => Self::Permission(err.to_string()),
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Contract every storage backend satisfies.
///
/// Invariant: `discover_prints` agrees with the set of fingers for which
/// `load` succeeds.
pub trait PrintStore: Send + Sync {
    /// One-time setup after construction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot come up.
    fn init(&self) -> Result<(), StoreError>;

    /// Teardown before shutdown.
    fn deinit(&self);

    /// Persists a print under its (user, driver, device, finger) key.
    ///
    /// # Errors
    ///
    /// Returns serialize/io/permission error kinds.
    fn save(&self, print: &Print) -> Result<(), StoreError>;

    /// Loads the print for (device, finger, user).
    ///
    /// # Errors
    ///
    /// `NotFound` when absent; `Incompatible` when the stored print's
    /// finger/username/device binding disagrees with the request.
    fn load(&self, device: &DeviceInfo, finger: Finger, username: &str)
        -> Result<Print, StoreError>;

    /// Deletes the print for (device, finger, user), pruning any now-empty
    /// per-user directories.
    ///
    /// # Errors
    ///
    /// `NotFound` when there was nothing to delete.
    fn delete(
        &self,
        device: &DeviceInfo,
        finger: Finger,
        username: &str,
    ) -> Result<(), StoreError>;

    /// The fingers with a stored print for (device, user).
    fn discover_prints(&self, device: &DeviceInfo, username: &str) -> Vec<Finger>;

    /// All usernames with stored prints.
    fn discover_users(&self) -> Vec<String>;
}

/// Instantiates the storage backend named by the configuration.
///
/// `state_dir` overrides the backend's own root resolution when given.
///
/// # Errors
///
/// Returns [`StoreError::UnknownBackend`] for unregistered names.
pub fn create_store(
    backend: &str,
    state_dir: Option<PathBuf>,
) -> Result<Arc<dyn PrintStore>, StoreError> {
    match backend {
        "file" => Ok(Arc::new(file::FileStore::new(state_dir))),
        other => Err(StoreError::UnknownBackend(other.to_owned())),
    }
}
