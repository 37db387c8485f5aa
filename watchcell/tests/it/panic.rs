use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use watchcell::{Cell, PanicPolicy};

use crate::Recorder;

fn panic_on(trigger: i32) -> impl FnMut(&i32) + Send + 'static {
    move |value: &i32| {
        if *value == trigger {
            panic!("subscriber failed on {value}");
        }
    }
}

#[test]
fn propagate_stops_dispatcher() {
    let cell = Cell::new(0);
    let recorder = Recorder::new();
    let mut recording = cell.subscribe(recorder.callback());
    let _failing = cell.subscribe(panic_on(1));

    // The writer doesn't observe the subscriber's panic.
    cell.set(1);
    cell.wait();
    assert!(!cell.is_dispatching());
    assert!(!recording.is_active());

    // Writes are no longer delivered to the old subscribers.
    cell.set(2);
    cell.wait();
    assert!(!recorder.values().contains(&2));
    recording.unsubscribe();

    // A new subscription starts a fresh dispatcher.
    let restarted = Recorder::new();
    let _subscription = cell.subscribe(restarted.callback());
    assert!(cell.is_dispatching());
    cell.set(3);
    cell.wait();
    assert_eq!(restarted.values(), [2, 3]);
}

#[test]
fn propagate_on_initial_replay() {
    let cell = Cell::new(1);
    let subscription = cell.subscribe(panic_on(1));

    cell.wait();
    assert!(!subscription.is_active());
    assert!(!cell.is_dispatching());
}

#[test]
fn isolate_keeps_delivering() {
    let cell = Cell::builder(0).panic_policy(PanicPolicy::Isolate).build();
    let panics = Arc::new(AtomicUsize::new(0));
    let recorder = Recorder::new();
    let _recording = cell.subscribe(recorder.callback());
    let failing = cell.subscribe({
        let panics = panics.clone();
        move |_: &i32| {
            panics.fetch_add(1, Ordering::SeqCst);
            panic!("subscriber failed");
        }
    });

    cell.set(1);
    cell.set(2);
    cell.wait();

    assert_eq!(recorder.values(), [0, 1, 2]);
    // Replay plus two deliveries, the failing subscriber stays registered.
    assert_eq!(panics.load(Ordering::SeqCst), 3);
    assert!(failing.is_active());
    assert!(cell.is_dispatching());
}

#[test]
fn subscriptions_inactive_once_dispatcher_cleared() {
    let cell = Cell::new(0);
    let failing = cell.subscribe(panic_on(1));

    cell.set(1);
    while cell.is_dispatching() {
        std::thread::yield_now();
    }
    assert!(!failing.is_active());
}
