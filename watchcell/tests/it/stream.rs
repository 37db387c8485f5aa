use futures_util::StreamExt;
use watchcell::Cell;

use crate::Recorder;

#[tokio::test]
async fn current_value_then_updates() {
    let cell = Cell::new(1);
    let mut stream = cell.stream();

    cell.set(2);
    cell.set(3);

    assert_eq!(stream.next().await, Some(1));
    assert_eq!(stream.next().await, Some(2));
    assert_eq!(stream.next().await, Some(3));
}

#[tokio::test]
async fn stream_combinators() {
    let cell = Cell::new("a".to_owned());
    let mut lengths = cell.stream().map(|value| value.len());

    cell.set("abc".to_owned());

    assert_eq!(lengths.next().await, Some(1));
    assert_eq!(lengths.next().await, Some(3));
}

#[tokio::test]
async fn dropping_stream_unsubscribes() {
    let cell = Cell::new(0);
    let stream = cell.stream();
    assert!(cell.is_dispatching());

    drop(stream);
    cell.wait_async().await;
    assert!(!cell.is_dispatching());
}

#[tokio::test]
async fn stream_ends_when_dispatcher_stops() {
    let cell = Cell::new(0);
    let mut stream = cell.stream();
    let _failing = cell
        .subscribe_async(|value: &i32| {
            if *value == 1 {
                panic!("subscriber failed");
            }
        })
        .await;

    cell.set(1);
    cell.wait_async().await;

    let mut values = Vec::new();
    while let Some(value) = stream.next().await {
        values.push(value);
    }
    // Whether the stream got `1` depends on the unspecified order in which
    // subscribers are called.
    assert!(values == [0] || values == [0, 1], "unexpected values: {values:?}");
}

#[tokio::test]
async fn stream_created_behind_failing_delivery() {
    let cell = Cell::new(0);
    let (entered_tx, entered_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let _failing = cell
        .subscribe_async(move |value: &i32| {
            if *value == 1 {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                panic!("subscriber failed");
            }
        })
        .await;

    // The stream's registration is queued behind the delivery of `1`, which
    // stops the dispatcher.
    cell.set(1);
    entered_rx.recv().unwrap();
    let mut stream = cell.stream();
    release_tx.send(()).unwrap();

    assert_eq!(stream.next().await, Some(1));
    assert!(cell.is_dispatching());

    cell.set(2);
    assert_eq!(stream.next().await, Some(2));
}

#[tokio::test]
async fn async_subscribe_and_unsubscribe() {
    let cell = Cell::new(0);
    let recorder = Recorder::new();

    let mut subscription = cell.subscribe_async(recorder.callback()).await;
    assert_eq!(recorder.values(), [0]);

    cell.set(1);
    cell.wait_async().await;
    assert_eq!(recorder.values(), [0, 1]);

    subscription.unsubscribe_async().await;
    subscription.unsubscribe_async().await;
    assert!(!cell.is_dispatching());

    cell.set(2);
    cell.wait_async().await;
    assert_eq!(recorder.values(), [0, 1]);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_on_separate_task() {
    let cell = Cell::new(0);
    let mut stream = cell.stream();

    let handle = tokio::spawn(async move {
        let mut last = None;
        while let Some(value) = stream.next().await {
            last = Some(value);
            if value == 32 {
                break;
            }
        }
        last
    });

    for i in 1..=32 {
        cell.set(i);
        tokio::task::yield_now().await;
    }

    assert_eq!(handle.await.unwrap(), Some(32));
}
