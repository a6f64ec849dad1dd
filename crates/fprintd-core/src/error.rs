//! Client-facing service errors.
//!
//! Every error carries a stable kind token that crosses the wire unchanged;
//! clients match on the token, humans read the message.

use serde::{Deserialize, Serialize};

/// Errors returned to clients by service operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation requires a claim and the device is not claimed.
    #[error("{0}")]
    ClaimDevice(String),
    /// Claimed by someone else, another operation in progress, or a stop is
    /// already pending.
    #[error("{0}")]
    AlreadyInUse(String),
    /// Unexpected capability or environment failure.
    #[error("{0}")]
    Internal(String),
    /// Policy refused the action.
    #[error("{0}")]
    PermissionDenied(String),
    /// The target finger/user has no enrolled print.
    #[error("{0}")]
    NoEnrolledPrints(String),
    /// Reserved for compatibility with the published error vocabulary.
    #[error("finger is already enrolled")]
    FingerAlreadyEnrolled,
    /// Stop requested with no matching operation in progress.
    #[error("{0}")]
    NoActionInProgress(String),
    /// The finger token was not recognized.
    #[error("invalid finger name")]
    InvalidFingername,
    /// No device available for `GetDefaultDevice`.
    #[error("no devices available")]
    NoSuchDevice,
    /// The host store failed to delete a print.
    #[error("{0}")]
    PrintsNotDeleted(String),
    /// The device failed to delete a print (low priority).
    #[error("{0}")]
    PrintsNotDeletedFromDevice(String),
}

impl Error {
    /// The stable wire token for this error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClaimDevice(_) => "claim-device",
            Self::AlreadyInUse(_) => "already-in-use",
            Self::Internal(_) => "internal",
            Self::PermissionDenied(_) => "permission-denied",
            Self::NoEnrolledPrints(_) => "no-enrolled-prints",
            Self::FingerAlreadyEnrolled => "finger-already-enrolled",
            Self::NoActionInProgress(_) => "no-action-in-progress",
            Self::InvalidFingername => "invalid-fingername",
            Self::NoSuchDevice => "no-such-device",
            Self::PrintsNotDeleted(_) => "prints-not-deleted",
            Self::PrintsNotDeletedFromDevice(_) => "prints-not-deleted-from-device",
        }
    }
}

/// Wire form of [`Error`]: the kind token plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct WireError {
    pub name: String,
    pub message: String,
}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        Self {
            name: err.kind().to_owned(),
            message: err.to_string(),
        }
    }
}

impl From<Error> for WireError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}
