//! Device session and operation state machine scenarios.

mod common;

use std::sync::Arc;

use common::{caller, settle, Fixture};
use fprintd_core::driver::virtual_dev::{EnrollStep, IdentifyStep, VerifyStep};
use fprintd_core::driver::{DeviceDriver, DeviceFeatures, DriverError, RetryHint};
use fprintd_core::proto::Event;
use fprintd_core::{Error, Finger};

fn plain_device() -> DeviceFeatures {
    DeviceFeatures::default()
}

fn identify_device() -> DeviceFeatures {
    DeviceFeatures {
        identify: true,
        storage: false,
        storage_list: false,
    }
}

fn storage_device() -> DeviceFeatures {
    DeviceFeatures {
        identify: true,
        storage: true,
        storage_list: true,
    }
}

// --- S1: claim then verify a single enrolled finger ----------------------

#[tokio::test]
async fn claim_verify_single_finger_release() {
    let mut fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::RightIndexFinger, 1), false);

    device.claim(&alice, "alice".into()).await.unwrap();
    assert!(device.busy());

    fx.driver.queue_verify(VerifyStep::Match(true));
    device.verify_start(&alice, "any").await.unwrap();

    match fx.next_non_property_event().await {
        Event::VerifyFingerSelected { finger, .. } => {
            assert_eq!(finger, "right-index-finger");
        }
        other => panic!("expected VerifyFingerSelected, got {other:?}"),
    }
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-match".to_owned(), true)
    );

    device.verify_stop(&alice).await.unwrap();
    device.release(&alice).await.unwrap();

    // The claim is gone; the connection going away clears the watch.
    device.client_vanished(alice.id).await;
    assert!(!device.busy());
    assert!(!device.is_claimed());
}

// --- S2: claim contention -------------------------------------------------

#[tokio::test]
async fn second_claim_fails_while_claimed() {
    let fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);

    device.claim(&caller(1), "alice".into()).await.unwrap();
    assert!(matches!(
        device.claim(&caller(2), "bob".into()).await,
        Err(Error::AlreadyInUse(_))
    ));

    // An unrelated caller can still list, and gets the no-prints error.
    assert!(matches!(
        device.list_enrolled_fingers(&caller(2), "bob"),
        Err(Error::NoEnrolledPrints(_))
    ));
}

#[tokio::test]
async fn claimed_operations_enforce_ownership() {
    let fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);

    // Unclaimed: operations requiring a claim fail claim-device.
    assert!(matches!(
        device.verify_start(&caller(1), "any").await,
        Err(Error::ClaimDevice(_))
    ));

    device.claim(&caller(1), "alice".into()).await.unwrap();

    // A non-owner fails already-in-use.
    assert!(matches!(
        device.verify_start(&caller(2), "any").await,
        Err(Error::AlreadyInUse(_))
    ));
    assert!(matches!(
        device.release(&caller(2)).await,
        Err(Error::AlreadyInUse(_))
    ));
}

// --- at-most-one operation per device ------------------------------------

#[tokio::test]
async fn concurrent_starts_fail_already_in_use() {
    let mut fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), false);
    device.claim(&alice, "alice".into()).await.unwrap();

    // First start wins; the scan stays pending (nothing scripted).
    device.verify_start(&alice, "left-thumb").await.unwrap();

    assert!(matches!(
        device.verify_start(&alice, "left-thumb").await,
        Err(Error::AlreadyInUse(msg)) if msg == "Verification already in progress"
    ));
    assert!(matches!(
        device.enroll_start(&alice, "right-thumb").await,
        Err(Error::AlreadyInUse(_))
    ));
    assert!(matches!(
        device.delete_enrolled_fingers2(&alice).await,
        Err(Error::AlreadyInUse(_))
    ));

    device.verify_stop(&alice).await.unwrap();
    let _ = fx.next_non_property_event().await; // finger-selected
}

#[tokio::test]
async fn stop_without_start_is_rejected() {
    let fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    device.claim(&alice, "alice".into()).await.unwrap();

    assert!(matches!(
        device.verify_stop(&alice).await,
        Err(Error::NoActionInProgress(msg)) if msg == "No verification in progress"
    ));
    assert!(matches!(
        device.enroll_stop(&alice).await,
        Err(Error::NoActionInProgress(msg)) if msg == "No enrollment in progress"
    ));
}

// --- S4: verify cancelled mid-flight --------------------------------------

#[tokio::test]
async fn verify_stop_cancels_pending_scan() {
    let mut fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), false);
    device.claim(&alice, "alice".into()).await.unwrap();

    // No scripted scan: the driver blocks until cancelled.
    device.verify_start(&alice, "left-thumb").await.unwrap();
    settle().await;

    device.verify_stop(&alice).await.unwrap();

    match fx.next_non_property_event().await {
        Event::VerifyFingerSelected { .. } => {}
        other => panic!("expected VerifyFingerSelected, got {other:?}"),
    }
    // A cancelled scan reads as no-match (or nothing at all).
    let next = tokio::time::timeout(std::time::Duration::from_millis(200), fx.events.recv()).await;
    if let Ok(Some(Event::VerifyStatus { result, done, .. })) = next {
        assert_eq!(result, "verify-no-match");
        assert!(done);
    }

    assert_eq!(
        fx.device.current_operation(),
        fprintd_daemon::device::op::Operation::None
    );
}

// --- terminal status idempotence ------------------------------------------

#[tokio::test]
async fn exactly_one_terminal_status_per_start() {
    let mut fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), false);
    device.claim(&alice, "alice".into()).await.unwrap();

    fx.driver.queue_verify(VerifyStep::Retry(RetryHint::TooShort));
    fx.driver.queue_verify(VerifyStep::Match(true));
    device.verify_start(&alice, "left-thumb").await.unwrap();
    settle().await;
    device.verify_stop(&alice).await.unwrap();

    let mut terminal = 0;
    let mut saw_retry = false;
    while let Ok(event) = fx.events.try_recv() {
        match event {
            Event::VerifyStatus { done: true, .. } => terminal += 1,
            Event::VerifyStatus { result, done: false, .. } => {
                assert_eq!(result, "verify-swipe-too-short");
                saw_retry = true;
            }
            _ => {}
        }
    }
    assert_eq!(terminal, 1);
    assert!(saw_retry);
}

// --- retry restarts the same call transparently ----------------------------

#[tokio::test]
async fn retry_errors_restart_verification() {
    let mut fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), false);
    device.claim(&alice, "alice".into()).await.unwrap();

    fx.driver.queue_verify(VerifyStep::Retry(RetryHint::CenterFinger));
    fx.driver.queue_verify(VerifyStep::Retry(RetryHint::General));
    fx.driver.queue_verify(VerifyStep::Match(false));
    device.verify_start(&alice, "left-thumb").await.unwrap();
    settle().await;

    let _ = fx.next_non_property_event().await; // finger-selected
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-finger-not-centered".to_owned(), false)
    );
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-retry-scan".to_owned(), false)
    );
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-no-match".to_owned(), true)
    );

    device.verify_stop(&alice).await.unwrap();
}

// --- verify "any" resolution ----------------------------------------------

#[tokio::test]
async fn verify_any_without_prints_fails() {
    let fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    device.claim(&alice, "alice".into()).await.unwrap();
    assert!(matches!(
        device.verify_start(&alice, "any").await,
        Err(Error::NoEnrolledPrints(_))
    ));
}

#[tokio::test]
async fn verify_any_identifies_across_gallery() {
    let mut fx = Fixture::new(identify_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), false);
    fx.enroll_on_host(&fx.print("alice", Finger::RightThumb, 2), false);
    device.claim(&alice, "alice".into()).await.unwrap();

    fx.driver.queue_identify(IdentifyStep::Match(1));
    device.verify_start(&alice, "any").await.unwrap();

    match fx.next_non_property_event().await {
        Event::VerifyFingerSelected { finger, .. } => assert_eq!(finger, "any"),
        other => panic!("expected VerifyFingerSelected, got {other:?}"),
    }
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-match".to_owned(), true)
    );
    device.verify_stop(&alice).await.unwrap();
}

#[tokio::test]
async fn verify_any_without_identify_picks_first_finger() {
    let mut fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::RightThumb, 1), false);
    fx.enroll_on_host(&fx.print("alice", Finger::LeftIndexFinger, 2), false);
    device.claim(&alice, "alice".into()).await.unwrap();

    fx.driver.queue_verify(VerifyStep::Match(true));
    device.verify_start(&alice, "any").await.unwrap();

    // Deterministic choice: first in finger enumeration order.
    match fx.next_non_property_event().await {
        Event::VerifyFingerSelected { finger, .. } => {
            assert_eq!(finger, "left-index-finger");
        }
        other => panic!("expected VerifyFingerSelected, got {other:?}"),
    }
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-match".to_owned(), true)
    );
    device.verify_stop(&alice).await.unwrap();
}

// --- client vanish ---------------------------------------------------------

#[tokio::test]
async fn vanish_cancels_and_closes() {
    let mut fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), false);
    device.claim(&alice, "alice".into()).await.unwrap();
    device.verify_start(&alice, "left-thumb").await.unwrap();
    settle().await;

    device.client_vanished(alice.id).await;

    assert!(!fx.device.is_claimed());
    assert!(!fx.driver.is_open());
    assert!(!device.busy());
    assert_eq!(
        fx.device.current_operation(),
        fprintd_daemon::device::op::Operation::None
    );
}

// --- S3: duplicate detection during enroll ---------------------------------

#[tokio::test]
async fn enroll_duplicate_is_refused() {
    let mut fx = Fixture::new(identify_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftIndexFinger, 1), false);
    device.claim(&alice, "alice".into()).await.unwrap();

    // The pre-identify matches the existing print: the same physical
    // finger is being enrolled under a new name.
    fx.driver.queue_identify(IdentifyStep::Match(0));
    device.enroll_start(&alice, "right-index-finger").await.unwrap();

    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-duplicate".to_owned(), true)
    );
    device.enroll_stop(&alice).await.unwrap();

    // Nothing new was stored.
    assert_eq!(
        fx.store.discover_prints(&fx.device.info(), "alice"),
        vec![Finger::LeftIndexFinger]
    );
}

#[tokio::test]
async fn enroll_removes_device_orphan_and_proceeds() {
    let mut fx = Fixture::new(storage_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    device.claim(&alice, "alice".into()).await.unwrap();

    // The device knows a print the host does not: delete it and continue.
    let orphan = fx.print("ghost", Finger::RightThumb, 1);
    fx.driver.seed_storage([orphan.clone()]);
    fx.driver.queue_identify(IdentifyStep::Found(orphan.clone()));
    fx.driver.set_nr_enroll_stages(2);
    fx.driver.queue_enroll(EnrollStep::StagePassed);
    fx.driver.queue_enroll(EnrollStep::Complete);

    device.enroll_start(&alice, "left-thumb").await.unwrap();

    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-stage-passed".to_owned(), false)
    );
    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-stage-passed".to_owned(), false)
    );
    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-completed".to_owned(), true)
    );
    device.enroll_stop(&alice).await.unwrap();

    let stored = fx.driver.storage_snapshot();
    assert!(!stored.contains(&orphan));
    assert!(fx
        .store
        .load(&fx.device.info(), Finger::LeftThumb, "alice")
        .is_ok());
}

// --- enroll success, stage counting, persistence ----------------------------

#[tokio::test]
async fn enroll_passes_stages_and_persists() {
    let mut fx = Fixture::new(identify_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    device.claim(&alice, "alice".into()).await.unwrap();

    fx.driver.set_nr_enroll_stages(3);
    // Identify-capable devices report one extra stage for the internal
    // identify pass.
    assert_eq!(fx.device.snapshot().num_enroll_stages, 4);

    fx.driver.queue_identify(IdentifyStep::NoMatch);
    fx.driver.queue_enroll(EnrollStep::StagePassed);
    fx.driver.queue_enroll(EnrollStep::Retry(RetryHint::TooShort));
    fx.driver.queue_enroll(EnrollStep::StagePassed);
    fx.driver.queue_enroll(EnrollStep::Complete);

    device.enroll_start(&alice, "right-index-finger").await.unwrap();

    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-stage-passed".to_owned(), false)
    );
    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-stage-passed".to_owned(), false)
    );
    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-swipe-too-short".to_owned(), false)
    );
    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-stage-passed".to_owned(), false)
    );
    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-completed".to_owned(), true)
    );

    device.enroll_stop(&alice).await.unwrap();

    let print = fx
        .store
        .load(&fx.device.info(), Finger::RightIndexFinger, "alice")
        .unwrap();
    assert_eq!(print.username, "alice");
    assert!(!print.data.is_empty());
}

#[tokio::test]
async fn enroll_rejects_wildcard_finger() {
    let fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    device.claim(&alice, "alice".into()).await.unwrap();
    assert!(matches!(
        device.enroll_start(&alice, "any").await,
        Err(Error::InvalidFingername)
    ));
    assert!(matches!(
        device.enroll_start(&alice, "sixth-finger").await,
        Err(Error::InvalidFingername)
    ));
}

#[tokio::test]
async fn reenrolling_replaces_the_existing_print() {
    let mut fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    let old = fx.print("alice", Finger::LeftThumb, 1);
    fx.enroll_on_host(&old, false);
    device.claim(&alice, "alice".into()).await.unwrap();

    fx.driver.set_nr_enroll_stages(1);
    fx.driver.queue_enroll(EnrollStep::Complete);
    device.enroll_start(&alice, "left-thumb").await.unwrap();

    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-completed".to_owned(), true)
    );
    device.enroll_stop(&alice).await.unwrap();

    let stored = fx
        .store
        .load(&fx.device.info(), Finger::LeftThumb, "alice")
        .unwrap();
    assert_ne!(stored.data, old.data);
}

// --- data-full garbage collection ------------------------------------------

#[tokio::test]
async fn data_full_triggers_one_gc_pass() {
    let mut fx = Fixture::new(DeviceFeatures {
        identify: false,
        storage: true,
        storage_list: true,
    });
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    device.claim(&alice, "alice".into()).await.unwrap();

    // An old print from a previous installation fills the device.
    let relic = fx.print("old-install", Finger::RightThumb, 1);
    fx.driver.seed_storage([relic.clone()]);

    fx.driver.set_nr_enroll_stages(1);
    fx.driver.queue_enroll(EnrollStep::Error(DriverError::DataFull));
    fx.driver.queue_enroll(EnrollStep::Complete);

    device.enroll_start(&alice, "left-thumb").await.unwrap();

    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-completed".to_owned(), true)
    );
    device.enroll_stop(&alice).await.unwrap();

    // The relic was collected to make room.
    assert!(!fx.driver.storage_snapshot().contains(&relic));
    assert!(fx
        .store
        .load(&fx.device.info(), Finger::LeftThumb, "alice")
        .is_ok());
}

#[tokio::test]
async fn data_full_gc_runs_at_most_once() {
    let mut fx = Fixture::new(DeviceFeatures {
        identify: false,
        storage: true,
        storage_list: true,
    });
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    device.claim(&alice, "alice".into()).await.unwrap();

    let relic_a = fx.print("old-install", Finger::RightThumb, 1);
    let relic_b = fx.print("old-install", Finger::LeftThumb, 2);
    fx.driver.seed_storage([relic_a, relic_b]);

    fx.driver.set_nr_enroll_stages(1);
    fx.driver.queue_enroll(EnrollStep::Error(DriverError::DataFull));
    fx.driver.queue_enroll(EnrollStep::Error(DriverError::DataFull));

    device.enroll_start(&alice, "left-thumb").await.unwrap();

    assert_eq!(
        fx.next_enroll_status().await,
        ("enroll-data-full".to_owned(), true)
    );
    device.enroll_stop(&alice).await.unwrap();

    // Only one garbage collection was attempted: one relic remains.
    assert_eq!(fx.driver.storage_snapshot().len(), 1);
}

// --- delete -----------------------------------------------------------------

#[tokio::test]
async fn delete_clears_host_and_device() {
    let fx = Fixture::new(storage_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), true);
    fx.enroll_on_host(&fx.print("alice", Finger::RightThumb, 2), true);
    device.claim(&alice, "alice".into()).await.unwrap();

    device.delete_enrolled_fingers2(&alice).await.unwrap();

    assert!(fx.store.discover_prints(&fx.device.info(), "alice").is_empty());
    assert!(fx.driver.storage_snapshot().is_empty());

    // Deleting again: nothing enrolled.
    assert!(matches!(
        device.delete_enrolled_fingers2(&alice).await,
        Err(Error::NoEnrolledPrints(_))
    ));
}

#[tokio::test]
async fn delete_single_finger() {
    let fx = Fixture::new(plain_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), false);
    fx.enroll_on_host(&fx.print("alice", Finger::RightThumb, 2), false);
    device.claim(&alice, "alice".into()).await.unwrap();

    assert!(matches!(
        device.delete_enrolled_finger(&alice, "any").await,
        Err(Error::InvalidFingername)
    ));
    assert!(matches!(
        device.delete_enrolled_finger(&alice, "left-index-finger").await,
        Err(Error::NoEnrolledPrints(_))
    ));

    device
        .delete_enrolled_finger(&alice, "left-thumb")
        .await
        .unwrap();
    assert_eq!(
        fx.store.discover_prints(&fx.device.info(), "alice"),
        vec![Finger::RightThumb]
    );
}

#[tokio::test]
async fn device_delete_failure_is_low_priority() {
    let fx = Fixture::new(storage_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), true);
    device.claim(&alice, "alice".into()).await.unwrap();

    fx.driver
        .fail_next_delete(DriverError::Io("firmware glitch".into()));

    // The host delete succeeds; the device-side failure surfaces as the
    // low-priority error.
    assert!(matches!(
        device.delete_enrolled_fingers2(&alice).await,
        Err(Error::PrintsNotDeletedFromDevice(_))
    ));
    assert!(fx.store.discover_prints(&fx.device.info(), "alice").is_empty());
}

#[tokio::test]
async fn legacy_delete_works_unclaimed() {
    let fx = Fixture::new(storage_device());
    let device = Arc::clone(&fx.device);

    fx.enroll_on_host(&fx.print("alice", Finger::LeftThumb, 1), true);

    // No claim: the legacy form auto-claims and temporarily opens the
    // device.
    device
        .delete_enrolled_fingers_legacy(&caller(7), "alice")
        .await
        .unwrap();

    assert!(fx.store.discover_prints(&fx.device.info(), "alice").is_empty());
    assert!(!fx.driver.is_open());
}

// --- S6: storage reconciliation --------------------------------------------

#[tokio::test]
async fn reconciliation_prunes_stale_host_prints_once() {
    let mut fx = Fixture::new(storage_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    // P1 exists on both sides, P2 only on the host.
    let p1 = fx.print("alice", Finger::LeftThumb, 1);
    let p2 = fx.print("alice", Finger::RightThumb, 2);
    fx.enroll_on_host(&p1, true);
    fx.enroll_on_host(&p2, false);

    device.claim(&alice, "alice".into()).await.unwrap();

    // Two prints and identify support: verify "any" goes through identify;
    // the mismatch triggers the reconciliation scan.
    fx.driver.queue_identify(IdentifyStep::NoMatch);
    device.verify_start(&alice, "any").await.unwrap();

    let _ = fx.next_non_property_event().await; // finger-selected
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-no-match".to_owned(), true)
    );
    device.verify_stop(&alice).await.unwrap();

    assert_eq!(
        fx.store.discover_prints(&fx.device.info(), "alice"),
        vec![Finger::LeftThumb]
    );

    // Reconciliation is one-shot per session: a new stale print survives
    // further mismatches.
    let p3 = fx.print("alice", Finger::LeftIndexFinger, 3);
    fx.enroll_on_host(&p3, false);

    fx.driver.queue_identify(IdentifyStep::NoMatch);
    device.verify_start(&alice, "any").await.unwrap();
    let _ = fx.next_non_property_event().await; // finger-selected
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-no-match".to_owned(), true)
    );
    device.verify_stop(&alice).await.unwrap();

    let mut fingers = fx.store.discover_prints(&fx.device.info(), "alice");
    fingers.sort();
    assert_eq!(fingers, vec![Finger::LeftThumb, Finger::LeftIndexFinger]);
}

#[tokio::test]
async fn data_not_found_reconciles_only_once_per_session() {
    let mut fx = Fixture::new(storage_device());
    let device = Arc::clone(&fx.device);
    let alice = caller(1);

    // P1 exists on both sides, P2 only on the host.
    let p1 = fx.print("alice", Finger::LeftThumb, 1);
    let p2 = fx.print("alice", Finger::RightThumb, 2);
    fx.enroll_on_host(&p1, true);
    fx.enroll_on_host(&p2, false);

    device.claim(&alice, "alice".into()).await.unwrap();

    // First trigger: the device reports a passed print as unknown.
    fx.driver
        .queue_identify(IdentifyStep::Error(DriverError::DataNotFound));
    device.verify_start(&alice, "any").await.unwrap();

    let _ = fx.next_non_property_event().await; // finger-selected
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-no-match".to_owned(), true)
    );
    device.verify_stop(&alice).await.unwrap();

    // The stale host print was pruned.
    assert_eq!(
        fx.store.discover_prints(&fx.device.info(), "alice"),
        vec![Finger::LeftThumb]
    );

    // A print that turns stale after the first scan must survive a second
    // data-not-found in the same session.
    let p3 = fx.print("alice", Finger::LeftIndexFinger, 3);
    fx.enroll_on_host(&p3, false);

    fx.driver
        .queue_identify(IdentifyStep::Error(DriverError::DataNotFound));
    device.verify_start(&alice, "any").await.unwrap();

    let _ = fx.next_non_property_event().await; // finger-selected
    assert_eq!(
        fx.next_verify_status().await,
        ("verify-no-match".to_owned(), true)
    );
    device.verify_stop(&alice).await.unwrap();

    let mut fingers = fx.store.discover_prints(&fx.device.info(), "alice");
    fingers.sort();
    assert_eq!(fingers, vec![Finger::LeftThumb, Finger::LeftIndexFinger]);
}

// --- busy property -----------------------------------------------------------

#[tokio::test]
async fn warm_device_reports_busy() {
    let fx = Fixture::new(plain_device());
    assert!(!fx.device.busy());

    fx.driver
        .set_temperature(fprintd_core::driver::Temperature::Warm);
    assert!(fx.device.busy());

    fx.driver
        .set_temperature(fprintd_core::driver::Temperature::Cold);
    assert!(!fx.device.busy());
}
