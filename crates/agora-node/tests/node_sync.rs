use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agora_core::Timestamp;
use agora_core::event::{Event, VerifiedEvent};
use agora_node::{Clock, Node};
use agora_store::QueryFilter;
use agora_transport::mesh::Mesh;
use agora_transport::wire::{Frame, encode_frame};
use agora_transport::PeerId;
use agora_util_error::BoxedErrorResult;

const SETTLE: Duration = Duration::from_secs(10);

/// Deterministic cluster-wide clock: strictly increasing timestamps
/// shared by every node, so query order is reproducible.
fn counter_clock() -> Clock {
    let counter = Arc::new(AtomicU64::new(1));
    Arc::new(move || Timestamp::from(counter.fetch_add(1, Ordering::SeqCst)))
}

async fn spawn_node(
    mesh: &Mesh,
    clock: &Clock,
    id: u16,
    topics: &[&str],
) -> BoxedErrorResult<Arc<Node>> {
    let peer = PeerId(id);
    let node = Node::builder()
        .peer_id(peer)
        .transport(mesh.transport(peer))
        .clock(clock.clone())
        .build()
        .await?;
    mesh.attach(peer, node.endpoint());
    for topic in topics {
        node.join_topic(topic).await?;
        mesh.join_topic(peer, topic);
    }
    Ok(node)
}

/// Wait until every node holds `expect_len` envelopes on `topic` and
/// all of them return the identical ordered sequence.
async fn await_converged(
    nodes: &[&Arc<Node>],
    topic: &str,
    expect_len: usize,
) -> BoxedErrorResult<Vec<Event>> {
    let events = tokio::time::timeout(SETTLE, async {
        loop {
            let mut queries = Vec::with_capacity(nodes.len());
            for node in nodes {
                queries.push(
                    node.query(topic, &QueryFilter::default())
                        .await
                        .expect("Query"),
                );
            }
            if queries.iter().all(|q| q.len() == expect_len)
                && queries.windows(2).all(|w| w[0] == w[1])
            {
                return queries.pop().expect("At least one node");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(events)
}

fn payloads(events: &[Event]) -> Vec<&[u8]> {
    events.iter().map(|e| e.payload.as_slice()).collect()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn two_nodes_sync_both_ways() -> BoxedErrorResult<()> {
    let mesh = Mesh::new();
    let clock = counter_clock();
    let node_a = spawn_node(&mesh, &clock, 1, &["t"]).await?;
    let node_b = spawn_node(&mesh, &clock, 2, &["t"]).await?;

    node_a.publish("t", b"hi".to_vec()).await?;
    let events = await_converged(&[&node_a, &node_b], "t", 1).await?;
    assert_eq!(payloads(&events), vec![b"hi".as_slice()]);

    node_b.publish("t", b"hi back".to_vec()).await?;
    let events = await_converged(&[&node_a, &node_b], "t", 2).await?;
    assert_eq!(payloads(&events), vec![b"hi".as_slice(), b"hi back".as_slice()]);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn suspended_node_heals_through_sync() -> BoxedErrorResult<()> {
    let mesh = Mesh::new();
    let clock = counter_clock();
    let node_a = spawn_node(&mesh, &clock, 1, &["t"]).await?;
    let node_b = spawn_node(&mesh, &clock, 2, &["t"]).await?;
    let node_c = spawn_node(&mesh, &clock, 3, &["t"]).await?;

    // B hears nothing while partitioned
    mesh.suspend(PeerId(2), "t");

    node_c.publish("t", b"p1".to_vec()).await?;
    node_c.publish("t", b"p2".to_vec()).await?;
    node_a.publish("t", b"p3".to_vec()).await?;

    await_converged(&[&node_a, &node_c], "t", 3).await?;
    assert!(node_b.query("t", &QueryFilter::default()).await?.is_empty());

    // a single delivery after the partition names the lost envelopes as
    // ancestors, and sync repair fills in the rest
    mesh.resume(PeerId(2), "t");
    node_a.publish("t", b"p4".to_vec()).await?;

    let events = await_converged(&[&node_a, &node_b, &node_c], "t", 4).await?;
    assert_eq!(
        payloads(&events),
        vec![
            b"p1".as_slice(),
            b"p2".as_slice(),
            b"p3".as_slice(),
            b"p4".as_slice()
        ]
    );

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn duplicate_delivery_is_ingested_once() -> BoxedErrorResult<()> {
    let mesh = Mesh::new();
    let clock = counter_clock();
    let node = spawn_node(&mesh, &clock, 1, &["t"]).await?;
    let mut updates = node.subscribe("t", 16).await?;

    let event = Event::builder()
        .topic("t")
        .timestamp(Timestamp::from(1))
        .payload(b"once".to_vec())
        .build();
    let frame = encode_frame(&Frame::Event(event.clone()));

    let endpoint = node.endpoint();
    endpoint.deliver(frame.clone()).await?;
    endpoint.deliver(frame).await?;

    // exactly one emission on the subscription stream
    let first = tokio::time::timeout(SETTLE, updates.recv())
        .await?
        .expect("One emission");
    assert_eq!(first, event);
    assert!(
        tokio::time::timeout(Duration::from_millis(200), updates.recv())
            .await
            .is_err()
    );

    // and exactly one row in the query
    let events = node.query("t", &QueryFilter::default()).await?;
    assert_eq!(events, vec![event.clone()]);

    // re-verify content addressing on the way out
    let stored = VerifiedEvent::verify(events[0].clone()).expect("Valid");
    assert_eq!(stored.event_id, event.compute_id());

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn subscription_is_lossless_from_the_moment_of_subscription() -> BoxedErrorResult<()> {
    let mesh = Mesh::new();
    let clock = counter_clock();
    let node = spawn_node(&mesh, &clock, 1, &["t"]).await?;

    node.publish("t", b"before".to_vec()).await?;

    let mut updates = node.subscribe("t", 16).await?;
    for i in 0..8u8 {
        node.publish("t", vec![i]).await?;
    }

    // the pre-subscription envelope is only visible via query
    for i in 0..8u8 {
        let event = tokio::time::timeout(SETTLE, updates.recv())
            .await?
            .expect("Emission");
        assert_eq!(event.payload, vec![i]);
    }
    assert_eq!(node.query("t", &QueryFilter::default()).await?.len(), 9);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn publish_returns_the_queryable_content_id() -> BoxedErrorResult<()> {
    let mesh = Mesh::new();
    let clock = counter_clock();
    let node = spawn_node(&mesh, &clock, 1, &["t"]).await?;

    let event_id = node.publish("t", b"addressed".to_vec()).await?;

    let events = node.query("t", &QueryFilter::default()).await?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].compute_id(), event_id);

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn shutdown_makes_topics_unavailable() -> BoxedErrorResult<()> {
    let mesh = Mesh::new();
    let clock = counter_clock();
    let node = spawn_node(&mesh, &clock, 1, &["t"]).await?;

    node.publish("t", b"hello".to_vec()).await?;
    node.shutdown();

    // actors observe the signal at their next suspension point
    let unavailable = tokio::time::timeout(SETTLE, async {
        loop {
            if node.publish("t", b"rejected".to_vec()).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(unavailable.is_ok());

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn concurrent_publishes_converge_to_identical_order() -> BoxedErrorResult<()> {
    let mesh = Mesh::new();
    let clock = counter_clock();
    let node_a = spawn_node(&mesh, &clock, 1, &["t"]).await?;
    let node_b = spawn_node(&mesh, &clock, 2, &["t"]).await?;
    let node_c = spawn_node(&mesh, &clock, 3, &["t"]).await?;

    let mut publishes = tokio::task::JoinSet::new();
    for (node, tag) in [(&node_a, b'a'), (&node_b, b'b'), (&node_c, b'c')] {
        for i in 0..5u8 {
            let node = node.clone();
            publishes.spawn(async move { node.publish("t", vec![tag, i]).await });
        }
    }
    while let Some(res) = publishes.join_next().await {
        res??;
    }

    let events = await_converged(&[&node_a, &node_b, &node_c], "t", 15).await?;

    // identical on every node, and in (timestamp, payload) order
    let mut expected = events.clone();
    expected.sort_by(|x, y| {
        x.timestamp
            .cmp(&y.timestamp)
            .then_with(|| x.payload.cmp(&y.payload))
    });
    assert_eq!(events, expected);

    Ok(())
}
