//! E2E integration test: instance registry under racing creators.
//!
//! Validates:
//! 1. Racing `get_or_create` calls for one new key run the factory once and
//!    all observe the same instance.
//! 2. Different keys created concurrently are all tracked exactly once.
//! 3. Counts stay exact while instances are disposed from other threads.
//! 4. `cleanup()` leaves the registry empty and is idempotent.
//! 5. Teardown racing a factory that is still running never yields two live
//!    instances for one key.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;

use holdfast_core::{InstanceRegistry, Notifier, RegistryConfig};

// ═════════════════════════════════════════════════════════════════════════
// Test 1: one key, many racing creators
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn e2e_racing_creators_share_one_instance() {
    let threads = 8;
    let registry = InstanceRegistry::new(RegistryConfig::default().label("race"));
    let factory_runs = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let registry = registry.clone();
            let runs = Arc::clone(&factory_runs);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                registry.get_or_create(Some("session"), || {
                    runs.fetch_add(1, Ordering::SeqCst);
                    // Widen the race window.
                    thread::yield_now();
                    Notifier::new(0u64)
                })
            })
        })
        .collect();

    let instances: Vec<Notifier<u64>> = handles
        .into_iter()
        .map(|h| h.join().expect("creator thread panicked"))
        .collect();

    assert_eq!(factory_runs.load(Ordering::SeqCst), 1);
    assert!(instances.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    assert_eq!(registry.count_total(), 1);
    assert_eq!(registry.count_by_type::<Notifier<u64>>(), 1);
}

// ═════════════════════════════════════════════════════════════════════════
// Test 2: distinct keys from many threads
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn e2e_distinct_keys_all_tracked() {
    let threads = 8;
    let per_thread = 25;
    let registry = InstanceRegistry::default();
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let registry = registry.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    let key = format!("k{}", i % 5 + t * 5);
                    let n = registry.notifier(Some(key.as_str()), || 0i32);
                    n.transform(|v| v + 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("worker panicked");
    }

    assert_eq!(registry.count_total(), threads * 5);
    let total: i32 = registry
        .keys::<Notifier<i32>>()
        .iter()
        .map(|k| registry.get::<Notifier<i32>>(k).map_or(0, |n| n.get()))
        .sum();
    assert_eq!(total, (threads * per_thread) as i32);
}

// ═════════════════════════════════════════════════════════════════════════
// Test 3: disposal from other threads keeps counts exact
// ═════════════════════════════════════════════════════════════════════════

#[test]
fn e2e_concurrent_dispose_and_cleanup() {
    let registry = InstanceRegistry::default();
    let instances: Vec<Notifier<u8>> = (0..64)
        .map(|_| registry.get_or_create(None, || Notifier::new(0u8)))
        .collect();
    let _named = registry.notifier(Some("kept"), || String::from("x"));
    assert_eq!(registry.count_total(), 65);

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = instances
        .chunks(16)
        .map(|chunk| {
            let chunk = chunk.to_vec();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for n in chunk.iter().step_by(2) {
                    n.dispose();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("disposer panicked");
    }

    assert_eq!(registry.count_by_type::<Notifier<u8>>(), 32);
    assert_eq!(registry.count_by_type::<Notifier<String>>(), 1);
    assert_eq!(registry.count_total(), 33);

    assert_eq!(registry.cleanup(), 33);
    assert!(registry.is_empty());
    assert_eq!(registry.cleanup(), 0);
    assert!(instances.iter().all(Notifier::is_disposed));
}

// ═════════════════════════════════════════════════════════════════════════
// Test 4: teardown while a factory is still running
// ═════════════════════════════════════════════════════════════════════════

/// Start `get_or_create(Some(key))` on another thread and return once its
/// factory is running. The factory finishes when the returned sender fires.
fn creator_in_factory(
    registry: &InstanceRegistry,
    key: &'static str,
    value: u32,
) -> (thread::JoinHandle<Notifier<u32>>, mpsc::Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let registry = registry.clone();
    let creator = thread::spawn(move || {
        registry.get_or_create(Some(key), || {
            entered_tx.send(()).expect("signal entry");
            release_rx.recv().expect("release");
            Notifier::new(value)
        })
    });
    entered_rx.recv().expect("factory entered");
    (creator, release_tx)
}

#[test]
fn e2e_cleanup_during_factory_keeps_one_instance_per_key() {
    let registry = InstanceRegistry::default();
    let (first, release) = creator_in_factory(&registry, "k", 1);

    assert_eq!(registry.cleanup(), 0);

    let second = {
        let registry = registry.clone();
        thread::spawn(move || registry.get_or_create(Some("k"), || Notifier::new(2u32)))
    };
    release.send(()).expect("release creator");

    let a = first.join().expect("first creator panicked");
    let b = second.join().expect("second creator panicked");
    assert!(a.ptr_eq(&b), "both lookups observe the same instance");
    assert_eq!(b.get(), 1);
    assert!(!a.is_disposed());
    assert_eq!(registry.count_total(), 1);
    assert_eq!(registry.keys::<Notifier<u32>>(), vec![String::from("k")]);
}

#[test]
fn e2e_remove_during_factory_waits_for_creator() {
    let registry = InstanceRegistry::default();
    let (first, release) = creator_in_factory(&registry, "k", 1);

    let remover = {
        let registry = registry.clone();
        thread::spawn(move || registry.remove::<Notifier<u32>>("k"))
    };
    release.send(()).expect("release creator");

    let a = first.join().expect("creator panicked");
    assert!(remover.join().expect("remover panicked"));
    assert!(a.is_disposed());
    assert_eq!(registry.count_total(), 0);

    let fresh = registry.get_or_create(Some("k"), || Notifier::new(2u32));
    assert!(!fresh.ptr_eq(&a));
    assert_eq!(fresh.get(), 2);
    assert_eq!(registry.count_total(), 1);
}
