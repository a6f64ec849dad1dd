//! Enrolled print records and their on-disk serialization.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::driver::DeviceInfo;
use crate::finger::Finger;

/// Current print file format version.
const FORMAT_VERSION: u32 = 1;

/// A serialized fingerprint template plus the metadata binding it to a user,
/// finger and reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Print {
    /// Owning OS username.
    pub username: String,
    /// Finger this template was taken from.
    pub finger: Finger,
    /// Driver name of the enrolling reader.
    pub driver: String,
    /// Stable identifier of the enrolling reader.
    pub device_id: String,
    /// Local date of enrollment.
    pub enroll_date: NaiveDate,
    /// Opaque template bytes produced by the driver.
    #[serde(with = "serde_bytes_b64")]
    pub data: Vec<u8>,
}

/// Envelope written to disk; the version gate keeps older daemons from
/// misreading newer formats.
#[derive(Serialize, Deserialize)]
struct PrintFile {
    version: u32,
    #[serde(flatten)]
    print: Print,
}

/// Errors produced by print (de)serialization.
#[derive(Debug, thiserror::Error)]
pub enum PrintCodecError {
    #[error("failed to encode print: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode print: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("unsupported print format version {0}")]
    UnsupportedVersion(u32),
}

impl Print {
    /// Builds an empty enroll template bound to the given identity; the
    /// driver fills in `data` on successful enrollment.
    #[must_use]
    pub fn template(username: &str, finger: Finger, device: &DeviceInfo, date: NaiveDate) -> Self {
        Self {
            username: username.to_owned(),
            finger,
            driver: device.driver.clone(),
            device_id: device.device_id.clone(),
            enroll_date: date,
            data: Vec::new(),
        }
    }

    /// Serializes the print to its opaque on-disk form.
    ///
    /// # Errors
    ///
    /// Returns [`PrintCodecError::Encode`] if encoding fails.
    pub fn serialize(&self) -> Result<Vec<u8>, PrintCodecError> {
        serde_json::to_vec(&PrintFile {
            version: FORMAT_VERSION,
            print: self.clone(),
        })
        .map_err(PrintCodecError::Encode)
    }

    /// Deserializes a print from its on-disk form.
    ///
    /// # Errors
    ///
    /// Returns a decode error for malformed bytes and
    /// [`PrintCodecError::UnsupportedVersion`] for future format versions.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, PrintCodecError> {
        let file: PrintFile = serde_json::from_slice(bytes).map_err(PrintCodecError::Decode)?;
        if file.version != FORMAT_VERSION {
            return Err(PrintCodecError::UnsupportedVersion(file.version));
        }
        Ok(file.print)
    }

    /// Whether this print was produced by (and can be used with) the given
    /// reader.
    #[must_use]
    pub fn is_compatible(&self, device: &DeviceInfo) -> bool {
        self.driver == device.driver && self.device_id == device.device_id
    }
}

/// Template bytes are stored base64-encoded so the envelope stays valid
/// JSON regardless of driver output.
mod serde_bytes_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
