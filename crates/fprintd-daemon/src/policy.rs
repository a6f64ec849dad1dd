//! Authorization gate: operation permissions and acting-user resolution.
//!
//! Every incoming call passes the claim check, then (for the operations
//! that act on a user's prints) acting-user resolution, then the permission
//! check. The policy backend itself is opaque behind [`PolicyAuthority`].

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use fprintd_core::proto::Request;
use fprintd_core::Error;
use nix::unistd::{Uid, User};
use tracing::debug;

use crate::claims::Caller;

/// Policy action tags, spelled exactly as the policy configuration does.
pub mod actions {
    pub const VERIFY: &str = "net.reactivated.fprint.device.verify";
    pub const ENROLL: &str = "net.reactivated.fprint.device.enroll";
    pub const SETUSERNAME: &str = "net.reactivated.fprint.device.setusername";
}

/// Errors from the policy backend itself (distinct from a clean "no").
#[derive(Debug, thiserror::Error)]
#[error("policy backend failure: {0}")]
pub struct PolicyError(pub String);

/// Opaque policy decision backend.
#[async_trait]
pub trait PolicyAuthority: Send + Sync {
    /// Whether `caller` holds `action`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] when the backend cannot answer; callers
    /// treat that as a denial.
    async fn check(&self, caller: &Caller, action: &str) -> Result<bool, PolicyError>;
}

/// Shipped authority: local callers may verify and enroll their own prints;
/// only root may act on another user's behalf.
pub struct LocalPolicy;

#[async_trait]
impl PolicyAuthority for LocalPolicy {
    async fn check(&self, caller: &Caller, action: &str) -> Result<bool, PolicyError> {
        Ok(match action {
            actions::VERIFY | actions::ENROLL => true,
            actions::SETUSERNAME => caller.uid == 0,
            _ => false,
        })
    }
}

/// Scripted authority for tests.
#[derive(Default)]
pub struct StaticPolicy {
    grants: HashSet<(u32, &'static str)>,
}

impl StaticPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn grant(mut self, uid: u32, action: &'static str) -> Self {
        self.grants.insert((uid, action));
        self
    }

    /// Grants verify+enroll to a uid, the common client profile.
    #[must_use]
    pub fn grant_user(self, uid: u32) -> Self {
        self.grant(uid, actions::VERIFY).grant(uid, actions::ENROLL)
    }
}

#[async_trait]
impl PolicyAuthority for StaticPolicy {
    async fn check(&self, caller: &Caller, action: &str) -> Result<bool, PolicyError> {
        Ok(self
            .grants
            .iter()
            .any(|(uid, a)| *uid == caller.uid && *a == action))
    }
}

/// The authorization gate in front of every device operation.
#[derive(Clone)]
pub struct PolicyGate {
    authority: Arc<dyn PolicyAuthority>,
}

impl PolicyGate {
    #[must_use]
    pub fn new(authority: Arc<dyn PolicyAuthority>) -> Self {
        Self { authority }
    }

    /// The permission tags an operation may satisfy; holding any one of
    /// them is enough.
    #[must_use]
    pub fn required_permissions(request: &Request) -> &'static [&'static str] {
        match request {
            Request::Claim { .. } => &[actions::VERIFY, actions::ENROLL],
            Request::EnrollStart { .. }
            | Request::DeleteEnrolledFinger { .. }
            | Request::DeleteEnrolledFingers { .. }
            | Request::DeleteEnrolledFingers2 { .. } => &[actions::ENROLL],
            Request::VerifyStart { .. } | Request::ListEnrolledFingers { .. } => {
                &[actions::VERIFY]
            }
            // Stop/release never re-authorize: the caller already proved
            // itself to start, and prompting again mid-operation would
            // deadlock interactive agents.
            _ => &[],
        }
    }

    /// Checks the permission table for `request`; the first grant wins.
    ///
    /// # Errors
    ///
    /// `permission-denied` when no required tag is granted.
    pub async fn authorize(&self, caller: &Caller, request: &Request) -> Result<(), Error> {
        let required = Self::required_permissions(request);
        if required.is_empty() {
            return Ok(());
        }

        for action in required {
            debug!(uid = caller.uid, action, "checking policy action");
            match self.authority.check(caller, action).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => {
                    return Err(Error::PermissionDenied(format!("Not Authorized: {err}")));
                }
            }
        }

        Err(Error::PermissionDenied(format!(
            "Not Authorized: {}",
            required.join(", ")
        )))
    }

    /// Resolves the acting username for a call.
    ///
    /// An empty or self-matching requested name resolves to the caller's
    /// own passwd name; any other name additionally requires the
    /// set-username permission.
    ///
    /// # Errors
    ///
    /// `internal` if the caller's uid has no passwd entry;
    /// `permission-denied` if a foreign name is requested without the
    /// set-username grant.
    pub async fn resolve_username(
        &self,
        caller: &Caller,
        requested: &str,
    ) -> Result<String, Error> {
        let own = User::from_uid(Uid::from_raw(caller.uid))
            .map_err(|e| {
                Error::Internal(format!(
                    "Could not look up user with UID {}: {e}",
                    caller.uid
                ))
            })?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "Failed to get information about user UID {}",
                    caller.uid
                ))
            })?;

        if requested.is_empty() || requested == own.name {
            return Ok(own.name);
        }

        match self.authority.check(caller, actions::SETUSERNAME).await {
            Ok(true) => Ok(requested.to_owned()),
            Ok(false) => Err(Error::PermissionDenied(format!(
                "Not Authorized: {}",
                actions::SETUSERNAME
            ))),
            Err(err) => Err(Error::PermissionDenied(format!("Not Authorized: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fprintd_core::proto::device_path;

    fn caller(uid: u32) -> Caller {
        Caller::new(1, uid, None)
    }

    fn own_username() -> String {
        User::from_uid(Uid::effective()).unwrap().unwrap().name
    }

    #[test]
    fn permission_table_matches_published_contract() {
        let dev = device_path(0);
        let claim = Request::Claim {
            device: dev.clone(),
            username: String::new(),
        };
        assert_eq!(
            PolicyGate::required_permissions(&claim),
            &[actions::VERIFY, actions::ENROLL]
        );
        assert_eq!(
            PolicyGate::required_permissions(&Request::VerifyStart {
                device: dev.clone(),
                finger: "any".into()
            }),
            &[actions::VERIFY]
        );
        assert_eq!(
            PolicyGate::required_permissions(&Request::EnrollStart {
                device: dev.clone(),
                finger: "left-thumb".into()
            }),
            &[actions::ENROLL]
        );
        assert_eq!(
            PolicyGate::required_permissions(&Request::Release { device: dev.clone() }),
            &[] as &[&str]
        );
        assert_eq!(
            PolicyGate::required_permissions(&Request::VerifyStop { device: dev }),
            &[] as &[&str]
        );
    }

    #[tokio::test]
    async fn first_matching_grant_wins() {
        let uid = Uid::effective().as_raw();
        // Only enroll granted; Claim requires verify OR enroll.
        let gate = PolicyGate::new(Arc::new(StaticPolicy::new().grant(uid, actions::ENROLL)));
        let claim = Request::Claim {
            device: device_path(0),
            username: String::new(),
        };
        assert!(gate.authorize(&caller(uid), &claim).await.is_ok());
    }

    #[tokio::test]
    async fn no_grant_is_denied() {
        let gate = PolicyGate::new(Arc::new(StaticPolicy::new()));
        let verify = Request::VerifyStart {
            device: device_path(0),
            finger: "any".into(),
        };
        assert!(matches!(
            gate.authorize(&caller(1000), &verify).await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn empty_username_resolves_to_caller() {
        let uid = Uid::effective().as_raw();
        let gate = PolicyGate::new(Arc::new(StaticPolicy::new()));
        let name = gate.resolve_username(&caller(uid), "").await.unwrap();
        assert_eq!(name, own_username());
    }

    #[tokio::test]
    async fn own_name_needs_no_extra_permission() {
        let uid = Uid::effective().as_raw();
        let gate = PolicyGate::new(Arc::new(StaticPolicy::new()));
        let own = own_username();
        assert_eq!(gate.resolve_username(&caller(uid), &own).await.unwrap(), own);
    }

    #[tokio::test]
    async fn foreign_name_requires_setusername() {
        let uid = Uid::effective().as_raw();
        let gate = PolicyGate::new(Arc::new(StaticPolicy::new()));
        assert!(matches!(
            gate.resolve_username(&caller(uid), "somebody-else").await,
            Err(Error::PermissionDenied(_))
        ));

        let gate = PolicyGate::new(Arc::new(
            StaticPolicy::new().grant(uid, actions::SETUSERNAME),
        ));
        assert_eq!(
            gate.resolve_username(&caller(uid), "somebody-else")
                .await
                .unwrap(),
            "somebody-else"
        );
    }
}
