use std::time::Duration;

use super::*;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delivers_to_all_subscribers() {
    let notifier = Notifier::new();

    let mut sub1 = notifier.subscribe(4);
    let mut sub2 = notifier.subscribe(4);

    notifier.trigger(1u32);

    assert_eq!(sub1.recv().await, Some(1));
    assert_eq!(sub2.recv().await, Some(1));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stalled_subscriber_does_not_block_trigger() {
    let notifier = Notifier::new();

    // Never read, buffer of 1
    let _stalled = notifier.subscribe(1);
    let mut live = notifier.subscribe(4);

    // Must return promptly no matter how many values the stalled
    // subscriber is behind.
    let trigger = async {
        for i in 0..100u32 {
            notifier.trigger(i);
        }
    };
    tokio::time::timeout(Duration::from_secs(1), trigger)
        .await
        .expect("trigger must not block");

    // The live subscriber saw the head of the stream, then lost the rest
    // to its buffer.
    assert_eq!(live.recv().await, Some(0));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn cancel_is_idempotent_and_stops_delivery() {
    let notifier = Notifier::new();

    let mut sub = notifier.subscribe(4);
    notifier.trigger(1u32);
    assert_eq!(sub.recv().await, Some(1));

    sub.cancel();
    sub.cancel();
    assert_eq!(notifier.subscriber_count(), 0);

    notifier.trigger(2);
    assert_eq!(sub.recv().await, None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn drop_cancels() {
    let notifier = Notifier::<u32>::new();

    let sub = notifier.subscribe(4);
    assert_eq!(notifier.subscriber_count(), 1);
    drop(sub);
    assert_eq!(notifier.subscriber_count(), 0);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn full_buffer_drops_only_for_that_subscriber() {
    let notifier = Notifier::new();

    let mut small = notifier.subscribe(1);
    let mut big = notifier.subscribe(8);

    notifier.trigger(1u32);
    notifier.trigger(2);
    notifier.trigger(3);

    assert_eq!(small.recv().await, Some(1));
    assert_eq!(small.try_recv().ok(), None);

    assert_eq!(big.recv().await, Some(1));
    assert_eq!(big.recv().await, Some(2));
    assert_eq!(big.recv().await, Some(3));
}
