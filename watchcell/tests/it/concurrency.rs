use std::{
    sync::{Arc, Mutex},
    thread,
};

use watchcell::Cell;

use crate::Recorder;

#[test]
fn concurrent_updates_converge() {
    let cell = Cell::new(0);
    let last = Arc::new(Mutex::new(None));
    let calls = Arc::new(Mutex::new(0));
    let _subscription = cell.subscribe({
        let last = last.clone();
        let calls = calls.clone();
        move |value: &i32| {
            *last.lock().unwrap() = Some(*value);
            *calls.lock().unwrap() += 1;
        }
    });

    let writers: Vec<_> = (0..100)
        .map(|i| {
            let cell = cell.clone();
            thread::spawn(move || cell.update(|value| value + i))
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    cell.wait();

    assert_eq!(cell.get(), 4950);
    assert_eq!(*last.lock().unwrap(), Some(4950));
    // One call per update, plus the initial replay.
    assert_eq!(*calls.lock().unwrap(), 101);
}

#[test]
fn subscribers_see_commit_order() {
    let cell = Cell::new(0);
    let recorders: Vec<Recorder<i32>> = (0..2).map(|_| Recorder::new()).collect();
    let _subscriptions: Vec<_> =
        recorders.iter().map(|recorder| cell.subscribe(recorder.callback())).collect();

    let writers: Vec<_> = (0..4)
        .map(|_| {
            let cell = cell.clone();
            thread::spawn(move || {
                for _ in 0..250 {
                    cell.update(|value| value + 1);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    cell.wait();

    for recorder in &recorders {
        assert_eq!(recorder.values(), (0..=1000).collect::<Vec<_>>());
    }
}

#[test]
fn subscribe_and_unsubscribe_while_writing() {
    let cell = Cell::new(0_u64);

    let writer = thread::spawn({
        let cell = cell.clone();
        move || {
            for i in 1..=2000 {
                cell.set(i);
            }
        }
    });

    let subscribers: Vec<_> = (0..8)
        .map(|_| {
            let cell = cell.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    let recorder = Recorder::new();
                    let mut subscription = cell.subscribe(recorder.callback());
                    subscription.unsubscribe();

                    // Values arrive in commit order, starting with the replay.
                    let values = recorder.values();
                    assert!(!values.is_empty());
                    assert!(values.windows(2).all(|pair| pair[0] < pair[1]));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for subscriber in subscribers {
        subscriber.join().unwrap();
    }

    // Every dispatcher that was started has stopped again once the
    // remaining deliveries have drained.
    cell.wait();
    assert!(!cell.is_dispatching());
    assert_eq!(cell.get(), 2000);
}
