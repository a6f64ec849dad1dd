//! Device ownership: sessions, the session slot, and claim checks.
//!
//! A device is owned by at most one session at a time. The slot is read on
//! every incoming call and replaced on claim/release/vanish; readers must
//! never observe a torn value, which the short non-awaiting critical
//! section guarantees on the daemon's single event loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fprintd_core::Error;

/// Connection-scoped caller identity, assigned by the protocol server.
pub type CallerId = u64;

/// A caller as seen by the authorization layer: connection id plus the
/// credentials captured from its socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: CallerId,
    /// Peer uid from `SO_PEERCRED`.
    pub uid: u32,
    /// Peer pid, when the platform reports one.
    pub pid: Option<i32>,
}

impl Caller {
    #[must_use]
    pub fn new(id: CallerId, uid: u32, pid: Option<i32>) -> Self {
        Self { id, uid, pid }
    }
}

/// Per-claim soft state.
#[derive(Debug)]
pub struct SessionData {
    /// The claiming caller.
    pub caller: Caller,
    /// Acting username resolved at claim time.
    pub username: String,
    /// Whether the current verify/identify already delivered a terminal
    /// status; duplicates under cancellation races are dropped.
    verify_status_reported: AtomicBool,
    /// A claim/release invocation of this session is still being processed.
    invocation_active: AtomicBool,
}

impl SessionData {
    #[must_use]
    pub fn new(caller: Caller, username: String) -> Arc<Self> {
        Arc::new(Self {
            caller,
            username,
            verify_status_reported: AtomicBool::new(false),
            invocation_active: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn verify_status_reported(&self) -> bool {
        self.verify_status_reported.load(Ordering::SeqCst)
    }

    pub fn set_verify_status_reported(&self, reported: bool) {
        self.verify_status_reported.store(reported, Ordering::SeqCst);
    }

    #[must_use]
    pub fn invocation_active(&self) -> bool {
        self.invocation_active.load(Ordering::SeqCst)
    }

    /// Marks a claim/release invocation in flight for the session's
    /// lifetime on the stack; cleared by [`InvocationGuard`].
    pub fn begin_invocation(self: &Arc<Self>) -> InvocationGuard {
        self.invocation_active.store(true, Ordering::SeqCst);
        InvocationGuard {
            session: Arc::clone(self),
        }
    }
}

/// Clears the in-flight invocation marker on drop.
pub struct InvocationGuard {
    session: Arc<SessionData>,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        self.session.invocation_active.store(false, Ordering::SeqCst);
    }
}

/// The per-device session slot.
#[derive(Default)]
pub struct SessionSlot {
    slot: Mutex<Option<Arc<SessionData>>>,
}

impl SessionSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current session, if claimed.
    #[must_use]
    pub fn get(&self) -> Option<Arc<SessionData>> {
        self.slot.lock().expect("session slot poisoned").clone()
    }

    /// Installs (or clears) the session, returning the previous one.
    pub fn replace(&self, session: Option<Arc<SessionData>>) -> Option<Arc<SessionData>> {
        std::mem::replace(&mut *self.slot.lock().expect("session slot poisoned"), session)
    }
}

/// Claim-state requirement of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRequirement {
    /// Always passes.
    Anytime,
    /// Treated as `Claimed` when a session exists, `Unclaimed` otherwise.
    AutoClaim,
    /// Fails if the device is already claimed.
    Unclaimed,
    /// Requires the caller to own the claim.
    Claimed,
}

/// Evaluates a claim requirement against the slot.
///
/// # Errors
///
/// `claim-device` when a claim is required but absent; `already-in-use`
/// when claimed by another caller, claimed at all for `Unclaimed`, or the
/// owning session has another invocation in flight.
pub fn check_claim(
    slot: &SessionSlot,
    requirement: ClaimRequirement,
    caller: &Caller,
) -> Result<(), Error> {
    if requirement == ClaimRequirement::Anytime {
        return Ok(());
    }

    let session = slot.get();
    let requirement = match requirement {
        ClaimRequirement::AutoClaim => {
            if session.is_some() {
                ClaimRequirement::Claimed
            } else {
                ClaimRequirement::Unclaimed
            }
        }
        other => other,
    };

    if requirement == ClaimRequirement::Unclaimed {
        return if session.is_none() {
            Ok(())
        } else {
            Err(Error::AlreadyInUse("Device was already claimed".into()))
        };
    }

    let Some(session) = session else {
        return Err(Error::ClaimDevice("Device was not claimed before use".into()));
    };

    if session.caller.id != caller.id || session.invocation_active() {
        return Err(Error::AlreadyInUse(
            "Device already in use by another user".into(),
        ));
    }

    Ok(())
}
