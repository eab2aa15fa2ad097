//! Integration tests for the async lifecycle protocol.
//!
//! Validates:
//! 1. A superseded slow `init` never clobbers the state of a newer reload.
//! 2. The handle-triggered rerun happens once, after the first cycle, and
//!    never overlaps it.
//! 3. Construction with a handle never reruns `init`.
//! 4. Registry cleanup disposes async lifecycles and drops late completions.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use holdfast_async::{AsyncLifecycle, AsyncState};
use holdfast_core::consumer::{attach_handle, detach_handle};
use holdfast_core::{EnvHandle, InstanceRegistry, MessageError};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn stale_completion_is_discarded() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let lc = AsyncLifecycle::<&'static str>::builder().build(move |_| {
        let call = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            if call == 1 {
                sleep(Duration::from_millis(100)).await;
                Ok::<_, MessageError>("slow")
            } else {
                Ok("fast")
            }
        }
    });
    assert!(lc.is_loading());

    let state = lc.reload_and_wait().await;
    assert_eq!(state, AsyncState::Success("fast"));

    sleep(Duration::from_millis(250)).await;
    assert_eq!(lc.state(), AsyncState::Success("fast"));
    assert_eq!(lc.wait_settled().await, AsyncState::Success("fast"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(lc.generation(), 2);
}

#[tokio::test(start_paused = true)]
async fn spawned_reload_supersedes_first_cycle() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let lc = AsyncLifecycle::<u32>::builder().build(move |_| {
        let call = c.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            // The first call finishes last.
            let delay = if call == 1 { 80 } else { 10 };
            sleep(Duration::from_millis(delay)).await;
            Ok::<u32, MessageError>(call)
        }
    });

    assert!(lc.reload());
    assert_eq!(lc.wait_settled().await, AsyncState::Success(2));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(lc.data(), Some(2));
}

#[tokio::test(start_paused = true)]
async fn handle_rerun_waits_for_first_cycle_and_runs_once() {
    let active = Arc::new(AtomicU32::new(0));
    let max_active = Arc::new(AtomicU32::new(0));
    let calls = Arc::new(AtomicU32::new(0));

    let lc = {
        let (active, max_active, calls) = (
            Arc::clone(&active),
            Arc::clone(&max_active),
            Arc::clone(&calls),
        );
        AsyncLifecycle::<bool>::builder().build(move |lc| {
            calls.fetch_add(1, Ordering::SeqCst);
            let with_handle = lc.has_handle();
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_active.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<bool, MessageError>(with_handle)
            }
        })
    };

    let handle = EnvHandle::new("main-window");
    let lease = attach_handle(&lc, handle.clone());
    for _ in 0..3 {
        assert!(!lc.reinitialize_with_handle());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "rerun is queued, not started");

    // Further attach/detach cycles change nothing.
    drop(lease);
    let second = attach_handle(&lc, handle.clone());
    assert!(detach_handle(&lc, &handle));
    drop(second);
    let _lease = attach_handle(&lc, handle);

    assert_eq!(lc.wait_settled().await, AsyncState::Success(true));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn construction_with_handle_never_reruns() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&calls);
    let (lc, lease) = AsyncLifecycle::<String>::builder().build_with_handle(
        EnvHandle::with_payload("locale", String::from("en-GB")),
        move |lc| {
            c.fetch_add(1, Ordering::SeqCst);
            let locale = lc
                .require("load_locale")
                .map(|h| h.payload::<String>().map(|p| (*p).clone()).unwrap_or_default());
            async move { locale }
        },
    );
    assert_eq!(lc.wait_settled().await, AsyncState::Success(String::from("en-GB")));

    drop(lease);
    let _lease = attach_handle(&lc, EnvHandle::new("other"));
    assert!(!lc.reinitialize_with_handle());
    sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn require_without_handle_becomes_error_state() {
    let lc = AsyncLifecycle::<String>::builder().build(|lc| {
        let handle = lc.require("load_profile");
        async move { handle.map(|h| h.label().to_string()) }
    });
    let state = lc.wait_settled().await;
    let message = state.error_value().map(ToString::to_string).unwrap_or_default();
    assert_eq!(message, "handle required but unavailable for load_profile");

    // The handle-triggered rerun recovers.
    let _lease = attach_handle(&lc, EnvHandle::new("profile-view"));
    assert_eq!(
        lc.wait_settled().await,
        AsyncState::Success(String::from("profile-view"))
    );
}

#[tokio::test(start_paused = true)]
async fn registry_cleanup_disposes_async_lifecycles() {
    let registry = InstanceRegistry::default();
    let slow = || {
        AsyncLifecycle::<u32>::builder().build(|_| async {
            sleep(Duration::from_millis(50)).await;
            Ok::<u32, MessageError>(1)
        })
    };

    let a = registry.get_or_create(Some("feed"), slow);
    let b = registry.get_or_create(Some("feed"), slow);
    assert!(a.notifier().ptr_eq(b.notifier()));
    assert_eq!(registry.count_by_type::<AsyncLifecycle<u32>>(), 1);

    assert_eq!(registry.cleanup(), 1);
    assert!(a.is_disposed());
    sleep(Duration::from_millis(100)).await;
    assert!(a.is_loading(), "late completion after dispose is dropped");
    assert_eq!(registry.count_total(), 0);

    let fresh = registry.get_or_create(Some("feed"), slow);
    assert_eq!(fresh.wait_settled().await, AsyncState::Success(1));
}
