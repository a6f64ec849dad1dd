//! Control-socket wire protocol.
//!
//! Frames are length-prefixed JSON documents (see [`framing`]). The method,
//! signal, error and status vocabulary is the published fprintd surface; the
//! identifiers below are stable and must not change spelling.

pub mod framing;

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Well-known service name, carried for client compatibility.
pub const SERVICE_NAME: &str = "net.reactivated.Fprint";

/// Path the manager answers under.
pub const MANAGER_PATH: &str = "/net/reactivated/Fprint/Manager";

/// Prefix of per-device paths; the suffix is the monotonic device id.
pub const DEVICE_PATH_PREFIX: &str = "/net/reactivated/Fprint/Device/";

/// Default location of the control socket.
pub const DEFAULT_SOCKET_PATH: &str = "/run/fprintd/control.sock";

/// Builds the stable path for a device id.
#[must_use]
pub fn device_path(id: u32) -> String {
    format!("{DEVICE_PATH_PREFIX}{id}")
}

/// Parses a device path back into its id.
#[must_use]
pub fn parse_device_path(path: &str) -> Option<u32> {
    path.strip_prefix(DEVICE_PATH_PREFIX)?.parse().ok()
}

/// A client method call. Variant names mirror the published method names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Request {
    GetDevices,
    GetDefaultDevice,
    Claim { device: String, username: String },
    Release { device: String },
    VerifyStart { device: String, finger: String },
    VerifyStop { device: String },
    EnrollStart { device: String, finger: String },
    EnrollStop { device: String },
    ListEnrolledFingers { device: String, username: String },
    /// Deprecated username-taking form; kept for old clients.
    DeleteEnrolledFingers { device: String, username: String },
    DeleteEnrolledFingers2 { device: String },
    DeleteEnrolledFinger { device: String, finger: String },
    GetProperties { device: String },
}

impl Request {
    /// The device path this request targets, if any.
    #[must_use]
    pub fn device(&self) -> Option<&str> {
        match self {
            Self::GetDevices | Self::GetDefaultDevice => None,
            Self::Claim { device, .. }
            | Self::Release { device }
            | Self::VerifyStart { device, .. }
            | Self::VerifyStop { device }
            | Self::EnrollStart { device, .. }
            | Self::EnrollStop { device }
            | Self::ListEnrolledFingers { device, .. }
            | Self::DeleteEnrolledFingers { device, .. }
            | Self::DeleteEnrolledFingers2 { device }
            | Self::DeleteEnrolledFinger { device, .. }
            | Self::GetProperties { device } => Some(device),
        }
    }

    /// The published method name, for logging.
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::GetDevices => "GetDevices",
            Self::GetDefaultDevice => "GetDefaultDevice",
            Self::Claim { .. } => "Claim",
            Self::Release { .. } => "Release",
            Self::VerifyStart { .. } => "VerifyStart",
            Self::VerifyStop { .. } => "VerifyStop",
            Self::EnrollStart { .. } => "EnrollStart",
            Self::EnrollStop { .. } => "EnrollStop",
            Self::ListEnrolledFingers { .. } => "ListEnrolledFingers",
            Self::DeleteEnrolledFingers { .. } => "DeleteEnrolledFingers",
            Self::DeleteEnrolledFingers2 { .. } => "DeleteEnrolledFingers2",
            Self::DeleteEnrolledFinger { .. } => "DeleteEnrolledFinger",
            Self::GetProperties { .. } => "GetProperties",
        }
    }
}

/// Published device properties, as one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub name: String,
    /// `"press"` or `"swipe"`.
    pub scan_type: String,
    pub num_enroll_stages: u32,
    pub finger_present: bool,
    pub finger_needed: bool,
    pub busy: bool,
}

/// Successful method results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Reply {
    Ok,
    Devices { paths: Vec<String> },
    Device { path: String },
    Fingers { fingers: Vec<String> },
    Properties { properties: DeviceSnapshot },
}

/// Server-initiated notifications. Variant names mirror the published
/// signal names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal")]
pub enum Event {
    VerifyStatus {
        device: String,
        result: String,
        done: bool,
    },
    VerifyFingerSelected {
        device: String,
        finger: String,
    },
    EnrollStatus {
        device: String,
        result: String,
        done: bool,
    },
    PropertiesChanged {
        device: String,
        properties: DeviceSnapshot,
    },
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Correlates the reply; unique per connection.
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Reply {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply: Option<Reply>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<WireError>,
    },
    Event {
        #[serde(flatten)]
        event: Event,
    },
}

impl ServerMessage {
    /// Builds a reply frame from a handler result.
    #[must_use]
    pub fn reply(id: u64, result: Result<Reply, WireError>) -> Self {
        match result {
            Ok(reply) => Self::Reply {
                id,
                reply: Some(reply),
                error: None,
            },
            Err(error) => Self::Reply {
                id,
                reply: None,
                error: Some(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_path_round_trip() {
        assert_eq!(device_path(3), "/net/reactivated/Fprint/Device/3");
        assert_eq!(parse_device_path("/net/reactivated/Fprint/Device/3"), Some(3));
        assert_eq!(parse_device_path("/net/reactivated/Fprint/Manager"), None);
        assert_eq!(parse_device_path("/net/reactivated/Fprint/Device/x"), None);
    }

    #[test]
    fn request_wire_shape_uses_method_names() {
        let msg = ClientMessage {
            id: 7,
            request: Request::VerifyStart {
                device: device_path(1),
                finger: "any".into(),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "VerifyStart");
        assert_eq!(json["finger"], "any");

        let parsed: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn reply_and_error_frames_round_trip() {
        let ok = ServerMessage::reply(1, Ok(Reply::Fingers {
            fingers: vec!["right-index-finger".into()],
        }));
        let json = serde_json::to_string(&ok).unwrap();
        assert_eq!(serde_json::from_str::<ServerMessage>(&json).unwrap(), ok);

        let err = ServerMessage::reply(
            2,
            Err(WireError {
                name: "claim-device".into(),
                message: "Device was not claimed before use".into(),
            }),
        );
        let json: serde_json::Value = serde_json::to_value(&err).unwrap();
        assert_eq!(json["error"]["name"], "claim-device");
    }

    #[test]
    fn event_frames_carry_signal_names() {
        let event = ServerMessage::Event {
            event: Event::VerifyStatus {
                device: device_path(1),
                result: "verify-match".into(),
                done: true,
            },
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["signal"], "VerifyStatus");
        assert_eq!(json["done"], true);
    }
}
