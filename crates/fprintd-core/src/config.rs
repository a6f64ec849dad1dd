//! Daemon configuration file.
//!
//! A small TOML document, by default `/etc/fprintd.conf`:
//!
//! ```toml
//! [storage]
//! type = "file"
//! ```
//!
//! A missing file yields the defaults; a malformed file is a startup error.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fprintd.conf";

/// Errors loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Parsed daemon configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[storage]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Backend name; `"file"` is built in.
    #[serde(rename = "type", default = "default_storage_type")]
    pub backend: String,
    /// Overrides the backend's storage root.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_storage_type() -> String {
    "file".to_owned()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_type(),
            state_dir: None,
        }
    }
}

impl DaemonConfig {
    /// Loads the configuration from `path`; a missing file is the default
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unreadable or malformed files.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_default() {
        let config = DaemonConfig::load(Path::new("/nonexistent/fprintd.conf")).unwrap();
        assert_eq!(config.storage.backend, "file");
        assert!(config.storage.state_dir.is_none());
    }

    #[test]
    fn storage_table_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\ntype = \"file\"\nstate_dir = \"/tmp/prints\"").unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.storage.backend, "file");
        assert_eq!(config.storage.state_dir.as_deref(), Some(Path::new("/tmp/prints")));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage\ntype =").unwrap();
        assert!(matches!(
            DaemonConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn unknown_keys_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\ntype = \"file\"\nbogus = 1").unwrap();
        assert!(DaemonConfig::load(file.path()).is_err());
    }
}
