//! Login-time fingerprint verification helper.
//!
//! Speaks the PAM contract through its environment and exit code:
//!
//! - `PAM_USER` (or the invoking user) is the account to verify;
//! - `PAM_RHOST` marks remote sessions, which are always refused;
//! - exit 0 = success, 1 = authentication error, 2 = authentication
//!   information unavailable, 3 = maximum tries exhausted.
//!
//! Options arrive as PAM-style argv tokens: `debug[=on|off|1|0|true|false]`,
//! `max-tries=<n>`, `timeout=<seconds>`.

mod client;
mod strings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use fprintd_core::proto::{Event, Reply, Request, DEFAULT_SOCKET_PATH};
use nix::unistd::{Uid, User};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use client::{ClientError, DaemonClient};
use strings::{finger_message, retry_message};

const DEFAULT_MAX_TRIES: u32 = 3;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_TIMEOUT: Duration = Duration::from_secs(10);

/// PAM result codes, as process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthResult {
    Success,
    AuthErr,
    AuthInfoUnavail,
    MaxTries,
}

impl AuthResult {
    fn exit_code(self) -> ExitCode {
        match self {
            Self::Success => ExitCode::from(0),
            Self::AuthErr => ExitCode::from(1),
            Self::AuthInfoUnavail => ExitCode::from(2),
            Self::MaxTries => ExitCode::from(3),
        }
    }
}

#[derive(Debug)]
struct Options {
    debug: bool,
    max_tries: u32,
    timeout: Duration,
}

impl Options {
    fn parse(args: impl Iterator<Item = String>) -> Self {
        let mut options = Self {
            debug: false,
            max_tries: DEFAULT_MAX_TRIES,
            timeout: DEFAULT_TIMEOUT,
        };

        for arg in args {
            if arg == "debug" {
                options.debug = true;
            } else if let Some(value) = arg.strip_prefix("debug=") {
                match value {
                    "on" | "true" | "1" => options.debug = true,
                    "off" | "false" | "0" => options.debug = false,
                    other => eprintln!("invalid debug value '{other}', ignoring"),
                }
            } else if let Some(value) = arg.strip_prefix("max-tries=") {
                options.max_tries = match value.parse::<u32>() {
                    Ok(n) if n >= 1 => n,
                    _ => DEFAULT_MAX_TRIES,
                };
            } else if let Some(value) = arg.strip_prefix("timeout=") {
                options.timeout = match value.parse::<u64>() {
                    Ok(secs) if Duration::from_secs(secs) >= MIN_TIMEOUT => {
                        Duration::from_secs(secs)
                    }
                    _ => MIN_TIMEOUT,
                };
            }
        }

        options
    }
}

fn is_remote_session() -> bool {
    match std::env::var("PAM_RHOST") {
        Ok(rhost) => !rhost.is_empty() && rhost != "localhost",
        Err(_) => false,
    }
}

fn target_username() -> Option<String> {
    if let Ok(user) = std::env::var("PAM_USER") {
        if !user.is_empty() {
            return Some(user);
        }
    }
    User::from_uid(Uid::current()).ok().flatten().map(|u| u.name)
}

fn socket_path() -> PathBuf {
    std::env::var_os("FPRINTD_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}

fn main() -> ExitCode {
    let options = Options::parse(std::env::args().skip(1));

    let filter = if options.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    if is_remote_session() {
        debug!("remote session, refusing fingerprint auth");
        return AuthResult::AuthInfoUnavail.exit_code();
    }

    let Some(username) = target_username() else {
        return AuthResult::AuthInfoUnavail.exit_code();
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return AuthResult::AuthInfoUnavail.exit_code();
        }
    };

    runtime.block_on(authenticate(&options, &username)).exit_code()
}

async fn authenticate(options: &Options, username: &str) -> AuthResult {
    let mut client = match DaemonClient::connect(&socket_path()).await {
        Ok(client) => client,
        Err(err) => {
            debug!("could not reach fprintd: {err}");
            return AuthResult::AuthInfoUnavail;
        }
    };

    let Some(selection) = select_device(&mut client, username).await else {
        return AuthResult::AuthInfoUnavail;
    };
    debug!(device = %selection.path, "using device");

    if let Err(err) = client
        .call(Request::Claim {
            device: selection.path.clone(),
            username: username.to_owned(),
        })
        .await
    {
        debug!("failed to claim device: {err}");
        return AuthResult::AuthInfoUnavail;
    }

    let result = run_verify(&mut client, options, &selection).await;

    // On success the connection is simply dropped; the daemon's liveness
    // tracking releases the claim. Anything else releases explicitly.
    if result != AuthResult::Success {
        let _ = client
            .call(Request::Release {
                device: selection.path.clone(),
            })
            .await;
    }
    result
}

struct DeviceSelection {
    path: String,
    /// Reader name, used in prompts only when several readers exist.
    reader_name: Option<String>,
    is_swipe: bool,
}

/// Picks the device with the most prints enrolled for the user.
async fn select_device(client: &mut DaemonClient, username: &str) -> Option<DeviceSelection> {
    let Ok(Reply::Devices { paths }) = client.call(Request::GetDevices).await else {
        return None;
    };

    let multiple = paths.len() > 1;
    let mut best: Option<(usize, String)> = None;
    for path in paths {
        let enrolled = match client
            .call(Request::ListEnrolledFingers {
                device: path.clone(),
                username: username.to_owned(),
            })
            .await
        {
            Ok(Reply::Fingers { fingers }) => fingers.len(),
            // A device we cannot list is a device we cannot verify on.
            _ => 0,
        };
        debug!(device = %path, enrolled, "prints registered");
        if enrolled > 0 && best.as_ref().is_none_or(|(count, _)| enrolled > *count) {
            best = Some((enrolled, path));
        }
    }

    let (_, path) = best?;
    let mut reader_name = None;
    let mut is_swipe = false;
    if let Ok(Reply::Properties { properties }) = client
        .call(Request::GetProperties { device: path.clone() })
        .await
    {
        is_swipe = properties.scan_type == "swipe";
        if multiple {
            reader_name = Some(properties.name);
        }
    }

    Some(DeviceSelection {
        path,
        reader_name,
        is_swipe,
    })
}

enum AttemptOutcome {
    Terminal(String),
    TimedOut,
    Failed(AuthResult),
}

async fn run_verify(
    client: &mut DaemonClient,
    options: &Options,
    selection: &DeviceSelection,
) -> AuthResult {
    let mut tries_left = options.max_tries;

    while tries_left > 0 {
        let outcome = run_one_attempt(client, options, selection).await;

        match &outcome {
            AttemptOutcome::Failed(result) => return *result,
            AttemptOutcome::Terminal(result) if result == "verify-match" => {
                return AuthResult::Success;
            }
            AttemptOutcome::Terminal(_) | AttemptOutcome::TimedOut => {}
        }

        // Errors from the stop are deliberately ignored.
        let _ = client
            .call(Request::VerifyStop {
                device: selection.path.clone(),
            })
            .await;

        match outcome {
            AttemptOutcome::TimedOut => {
                println!("Verification timed out");
                return AuthResult::AuthInfoUnavail;
            }
            AttemptOutcome::Terminal(result) => match result.as_str() {
                "verify-no-match" => {
                    println!("Failed to match fingerprint");
                }
                "verify-unknown-error" | "verify-disconnected" => {
                    return AuthResult::AuthInfoUnavail;
                }
                _ => {
                    println!("An unknown error occurred");
                    return AuthResult::AuthErr;
                }
            },
            AttemptOutcome::Failed(_) => unreachable!("handled above"),
        }

        tries_left -= 1;
    }

    AuthResult::MaxTries
}

async fn run_one_attempt(
    client: &mut DaemonClient,
    options: &Options,
    selection: &DeviceSelection,
) -> AttemptOutcome {
    let deadline = Instant::now() + options.timeout;

    debug!("about to call VerifyStart");
    if let Err(err) = client
        .call(Request::VerifyStart {
            device: selection.path.clone(),
            finger: "any".to_owned(),
        })
        .await
    {
        debug!("VerifyStart failed: {err}");
        return match err.kind() {
            Some("no-enrolled-prints") => AttemptOutcome::Failed(AuthResult::AuthInfoUnavail),
            Some(_) => AttemptOutcome::Failed(AuthResult::AuthErr),
            // Transport gone mid-operation, including the daemon being
            // replaced underneath us.
            None => AttemptOutcome::Failed(AuthResult::AuthInfoUnavail),
        };
    }

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return AttemptOutcome::TimedOut;
        }

        let event = match tokio::time::timeout(remaining, client.next_event()).await {
            Err(_) => return AttemptOutcome::TimedOut,
            Ok(Err(err)) => {
                debug!("connection lost during verify: {err}");
                return AttemptOutcome::Failed(AuthResult::AuthInfoUnavail);
            }
            Ok(Ok(event)) => event,
        };

        match event {
            Event::VerifyFingerSelected { device, finger } if device == selection.path => {
                let message = finger_message(
                    &finger,
                    selection.reader_name.as_deref(),
                    selection.is_swipe,
                );
                debug!("finger selected: {finger}");
                println!("{message}");
            }
            Event::VerifyStatus {
                device,
                result,
                done,
            } if device == selection.path => {
                debug!(result, done, "verify status");
                if done {
                    return AttemptOutcome::Terminal(result);
                }
                if let Some(message) = retry_message(&result, selection.is_swipe) {
                    println!("{message}");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::parse(std::iter::empty());
        assert!(!options.debug);
        assert_eq!(options.max_tries, 3);
        assert_eq!(options.timeout, Duration::from_secs(30));
    }

    #[test]
    fn debug_forms() {
        for (token, expected) in [
            ("debug", true),
            ("debug=on", true),
            ("debug=1", true),
            ("debug=true", true),
            ("debug=off", false),
            ("debug=0", false),
            ("debug=false", false),
        ] {
            let options = Options::parse([token.to_owned()].into_iter());
            assert_eq!(options.debug, expected, "{token}");
        }
    }

    #[test]
    fn max_tries_bounds() {
        assert_eq!(
            Options::parse(["max-tries=5".to_owned()].into_iter()).max_tries,
            5
        );
        assert_eq!(
            Options::parse(["max-tries=0".to_owned()].into_iter()).max_tries,
            3
        );
        assert_eq!(
            Options::parse(["max-tries=bogus".to_owned()].into_iter()).max_tries,
            3
        );
    }

    #[test]
    fn timeout_bounds() {
        assert_eq!(
            Options::parse(["timeout=45".to_owned()].into_iter()).timeout,
            Duration::from_secs(45)
        );
        assert_eq!(
            Options::parse(["timeout=5".to_owned()].into_iter()).timeout,
            Duration::from_secs(10)
        );
        assert_eq!(
            Options::parse(["timeout=bogus".to_owned()].into_iter()).timeout,
            Duration::from_secs(10)
        );
    }
}
