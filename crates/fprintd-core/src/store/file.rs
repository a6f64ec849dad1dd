//! File-backed print store.
//!
//! Layout: `<root>/<username>/<driver>/<device-id>/<finger-hex>`, where the
//! leaf file holds the serialized print and `<finger-hex>` is the finger's
//! single lowercase hex digit. Directories are created owner-only.

use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{PrintStore, StoreError};
use crate::driver::DeviceInfo;
use crate::finger::Finger;
use crate::print::Print;

/// Compiled-in default storage root.
const DEFAULT_ROOT: &str = "/var/lib/fprint";

/// Mode for every directory under the root.
const DIR_MODE: u32 = 0o700;

/// File-backed [`PrintStore`].
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root`, falling back to the
    /// `STATE_DIRECTORY` environment variable and then the compiled-in
    /// default.
    #[must_use]
    pub fn new(root: Option<PathBuf>) -> Self {
        let root = root.unwrap_or_else(|| {
            Self::root_from_env(std::env::var("STATE_DIRECTORY").ok().as_deref())
        });
        Self { root }
    }

    /// Resolves the storage root from a `STATE_DIRECTORY` value. systemd
    /// concatenates multiple state directories with colons; the first one
    /// wins.
    fn root_from_env(state_directory: Option<&str>) -> PathBuf {
        match state_directory {
            Some(value) if !value.is_empty() => {
                let first = value.split(':').next().unwrap_or(value);
                if first.is_empty() {
                    PathBuf::from(DEFAULT_ROOT)
                } else {
                    PathBuf::from(first)
                }
            }
            _ => PathBuf::from(DEFAULT_ROOT),
        }
    }

    /// The per-user storage base.
    fn user_dir(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    /// The per-device directory under a user's base.
    fn device_dir(&self, device: &DeviceInfo, username: &str) -> PathBuf {
        self.user_dir(username)
            .join(&device.driver)
            .join(&device.device_id)
    }

    fn print_path(&self, device: &DeviceInfo, finger: Finger, username: &str) -> PathBuf {
        self.device_dir(device, username).join(finger.hex_code())
    }

    fn create_dir_owner_only(path: &Path) -> std::io::Result<()> {
        fs::DirBuilder::new().recursive(true).mode(DIR_MODE).create(path)
    }
}

impl PrintStore for FileStore {
    fn init(&self) -> Result<(), StoreError> {
        debug!(root = %self.root.display(), "file store initialized");
        Ok(())
    }

    fn deinit(&self) {}

    fn save(&self, print: &Print) -> Result<(), StoreError> {
        let device = DeviceInfo {
            driver: print.driver.clone(),
            device_id: print.device_id.clone(),
            name: String::new(),
        };
        let bytes = print
            .serialize()
            .map_err(|e| StoreError::Serialize(e.to_string()))?;

        let path = self.print_path(&device, print.finger, &print.username);
        let dir = path.parent().ok_or_else(|| {
            StoreError::Io(format!("print path {} has no parent", path.display()))
        })?;
        Self::create_dir_owner_only(dir)?;
        fs::write(&path, bytes)?;

        debug!(path = %path.display(), "print saved");
        Ok(())
    }

    fn load(
        &self,
        device: &DeviceInfo,
        finger: Finger,
        username: &str,
    ) -> Result<Print, StoreError> {
        let path = self.print_path(device, finger, username);
        let bytes = fs::read(&path)?;
        let print = Print::deserialize(&bytes).map_err(|e| StoreError::Io(e.to_string()))?;

        // The file's metadata must agree with where we found it.
        if print.finger != finger {
            return Err(StoreError::Incompatible(format!(
                "stored print is for finger {}, requested {}",
                print.finger, finger
            )));
        }
        if print.username != username {
            return Err(StoreError::Incompatible(format!(
                "stored print belongs to '{}', requested '{}'",
                print.username, username
            )));
        }
        if !print.is_compatible(device) {
            return Err(StoreError::Incompatible(format!(
                "stored print is for {}/{}, requested {}/{}",
                print.driver, print.device_id, device.driver, device.device_id
            )));
        }

        Ok(print)
    }

    fn delete(
        &self,
        device: &DeviceInfo,
        finger: Finger,
        username: &str,
    ) -> Result<(), StoreError> {
        let path = self.print_path(device, finger, username);
        if !path.exists() {
            return Err(StoreError::NotFound);
        }
        fs::remove_file(&path)?;
        debug!(path = %path.display(), "print deleted");

        // Prune empty directories, but never above the user's base.
        if self.discover_prints(device, username).is_empty() {
            let base = self.user_dir(username);
            let mut dir = path.parent().map(Path::to_path_buf);
            while let Some(current) = dir {
                if !current.starts_with(&base) || fs::remove_dir(&current).is_err() {
                    break;
                }
                dir = current.parent().map(Path::to_path_buf);
            }
        }

        Ok(())
    }

    fn discover_prints(&self, device: &DeviceInfo, username: &str) -> Vec<Finger> {
        let dir = self.device_dir(device, username);
        let Ok(entries) = fs::read_dir(&dir) else {
            debug!(dir = %dir.display(), "no print directory for user");
            return Vec::new();
        };

        let mut fingers = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match Finger::from_hex_code(name) {
                Some(finger) => fingers.push(finger),
                None => debug!(file = name, "skipping unrecognized print file"),
            }
        }
        fingers.sort();
        fingers
    }

    fn discover_users(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut users = Vec::new();
        for entry in entries.flatten() {
            match entry.file_name().into_string() {
                Ok(name) if !name.is_empty() => users.push(name),
                Ok(_) => {}
                Err(name) => warn!(?name, "skipping non-UTF-8 user directory"),
            }
        }
        users.sort();
        users
    }
}
