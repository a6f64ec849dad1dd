//! Mapping from driver outcomes to the wire status vocabulary.
//!
//! The status strings are a published API; the tables here must not drift.

use crate::driver::{DriverError, RetryHint};

/// Wire status for a verify/identify outcome.
///
/// `matched` is only meaningful when `error` is `None`.
#[must_use]
pub fn verify_result_name(matched: bool, error: Option<&DriverError>) -> &'static str {
    let Some(error) = error else {
        return if matched { "verify-match" } else { "verify-no-match" };
    };

    match error {
        DriverError::Retry(RetryHint::TooShort) => "verify-swipe-too-short",
        DriverError::Retry(RetryHint::CenterFinger) => "verify-finger-not-centered",
        DriverError::Retry(RetryHint::RemoveFinger) => "verify-remove-and-retry",
        DriverError::Retry(RetryHint::General) => "verify-retry-scan",
        DriverError::Proto(_) => "verify-disconnected",
        // A cancelled scan and a print the device no longer knows both read
        // as "did not match" to the client.
        DriverError::Cancelled | DriverError::DataNotFound => "verify-no-match",
        _ => "verify-unknown-error",
    }
}

/// Wire status for an enroll outcome.
///
/// `completed` distinguishes a progress report from the final result;
/// `enrolled` is whether a print was actually produced.
#[must_use]
pub fn enroll_result_name(completed: bool, enrolled: bool, error: Option<&DriverError>) -> &'static str {
    let Some(error) = error else {
        if !completed {
            return "enroll-stage-passed";
        }
        return if enrolled { "enroll-completed" } else { "enroll-failed" };
    };

    match error {
        DriverError::Retry(RetryHint::TooShort) => "enroll-swipe-too-short",
        DriverError::Retry(RetryHint::CenterFinger) => "enroll-finger-not-centered",
        DriverError::Retry(RetryHint::RemoveFinger) => "enroll-remove-and-retry",
        DriverError::Retry(RetryHint::General) => "enroll-retry-scan",
        DriverError::Proto(_) => "enroll-disconnected",
        DriverError::DataFull => "enroll-data-full",
        DriverError::Cancelled => "enroll-failed",
        _ => "enroll-unknown-error",
    }
}
