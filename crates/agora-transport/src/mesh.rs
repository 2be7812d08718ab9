//! In-process reference transport
//!
//! A [`Mesh`] is a registry of peers living in one process, wired
//! directly to each other's [`PeerEndpoint`]s. It exists for tests and
//! local simulation: broadcasts can be suspended per `(peer, topic)` to
//! stage partitions, and everything still goes through the [`wire`]
//! encoding so the codec is exercised end to end.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use agora_core::ShortEventId;
use agora_core::event::{Event, VerifiedEvent};
use agora_util_error::FmtCompact as _;
use async_trait::async_trait;
use tracing::{debug, trace};

use crate::wire::{Frame, decode_frame, encode_frame};
use crate::{
    PeerEndpoint, PeerId, PeerUnavailableSnafu, TopicTransport, TransportResult,
    UnexpectedFrameSnafu, UnknownPeerSnafu,
};

const LOG_TARGET: &str = "agora::mesh";

#[derive(Default)]
struct MeshInner {
    peers: BTreeMap<PeerId, MeshPeer>,
    /// Broadcasts *to* these pairs are discarded
    suspended: HashSet<(PeerId, String)>,
}

#[derive(Default)]
struct MeshPeer {
    endpoint: Option<Arc<dyn PeerEndpoint>>,
    topics: HashSet<String>,
}

/// A registry of in-process peers
#[derive(Clone, Default)]
pub struct Mesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport handle a node uses to reach the mesh
    pub fn transport(&self, local: PeerId) -> Arc<MeshTransport> {
        self.lock().peers.entry(local).or_default();
        Arc::new(MeshTransport {
            mesh: self.clone(),
            local,
        })
    }

    /// Wire a peer's receiving side into the mesh
    pub fn attach(&self, peer: PeerId, endpoint: Arc<dyn PeerEndpoint>) {
        self.lock().peers.entry(peer).or_default().endpoint = Some(endpoint);
    }

    pub fn join_topic(&self, peer: PeerId, topic: &str) {
        self.lock()
            .peers
            .entry(peer)
            .or_default()
            .topics
            .insert(topic.to_owned());
    }

    /// Discard broadcasts addressed to `peer` on `topic` until resumed
    ///
    /// Fetches are unaffected, so sync repair keeps working; this stages
    /// exactly the partition the repair path exists to heal.
    pub fn suspend(&self, peer: PeerId, topic: &str) {
        debug!(target: LOG_TARGET, %peer, topic, "Suspending broadcast");
        self.lock().suspended.insert((peer, topic.to_owned()));
    }

    pub fn resume(&self, peer: PeerId, topic: &str) {
        debug!(target: LOG_TARGET, %peer, topic, "Resuming broadcast");
        self.lock().suspended.remove(&(peer, topic.to_owned()));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MeshInner> {
        self.inner.lock().expect("Locking failed")
    }
}

/// One peer's view of a [`Mesh`]
pub struct MeshTransport {
    mesh: Mesh,
    local: PeerId,
}

#[async_trait]
impl TopicTransport for MeshTransport {
    async fn broadcast(&self, topic: &str, event: &VerifiedEvent) -> TransportResult<()> {
        let frame = encode_frame(&Frame::Event(event.event.clone()));

        let targets: Vec<(PeerId, Arc<dyn PeerEndpoint>)> = {
            let inner = self.mesh.lock();
            inner
                .peers
                .iter()
                .filter(|(peer, state)| {
                    **peer != self.local && state.topics.contains(topic)
                })
                .filter_map(|(peer, state)| {
                    if inner.suspended.contains(&(*peer, topic.to_owned())) {
                        trace!(target: LOG_TARGET, %peer, topic, "Broadcast suspended, discarding");
                        return None;
                    }
                    state.endpoint.clone().map(|endpoint| (*peer, endpoint))
                })
                .collect()
        };

        for (peer, endpoint) in targets {
            if let Err(err) = endpoint.deliver(frame.clone()).await {
                debug!(
                    target: LOG_TARGET,
                    %peer,
                    topic,
                    event_id = %event.short_id(),
                    err = %err.fmt_compact(),
                    "Failed to deliver broadcast"
                );
            }
        }

        Ok(())
    }

    async fn fetch_events(
        &self,
        peer: PeerId,
        topic: &str,
        event_ids: &[ShortEventId],
    ) -> TransportResult<Vec<Event>> {
        let endpoint = {
            let inner = self.mesh.lock();
            let state = inner.peers.get(&peer).ok_or_else(|| {
                UnknownPeerSnafu { peer }.build()
            })?;
            state
                .endpoint
                .clone()
                .ok_or_else(|| PeerUnavailableSnafu { peer }.build())?
        };

        let request = encode_frame(&Frame::Fetch {
            topic: topic.to_owned(),
            event_ids: event_ids.to_vec(),
        });

        let response = endpoint.serve_fetch(request).await?;
        match decode_frame(&response)? {
            Frame::Events(events) => Ok(events),
            _ => UnexpectedFrameSnafu.fail(),
        }
    }

    async fn peers(&self, topic: &str) -> Vec<PeerId> {
        let inner = self.mesh.lock();
        inner
            .peers
            .iter()
            .filter(|(peer, state)| {
                **peer != self.local
                    && state.topics.contains(topic)
                    && state.endpoint.is_some()
            })
            .map(|(peer, _)| *peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use agora_core::Timestamp;
    use agora_core::event::VerifiedEvent;

    use super::*;

    /// Endpoint stub that records delivered frames and serves a canned
    /// fetch response.
    #[derive(Default)]
    struct RecordingEndpoint {
        delivered: Mutex<Vec<Frame>>,
        served: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl PeerEndpoint for RecordingEndpoint {
        async fn deliver(&self, frame: Vec<u8>) -> TransportResult<()> {
            self.delivered
                .lock()
                .expect("Locking failed")
                .push(decode_frame(&frame)?);
            Ok(())
        }

        async fn serve_fetch(&self, frame: Vec<u8>) -> TransportResult<Vec<u8>> {
            let Frame::Fetch { .. } = decode_frame(&frame)? else {
                return UnexpectedFrameSnafu.fail();
            };
            let events = self.served.lock().expect("Locking failed").clone();
            Ok(encode_frame(&Frame::Events(events)))
        }
    }

    fn test_event(payload: &[u8]) -> VerifiedEvent {
        VerifiedEvent::verify(
            Event::builder()
                .topic("t")
                .timestamp(Timestamp::from(1))
                .payload(payload.to_vec())
                .build(),
        )
        .expect("Valid event")
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn broadcast_reaches_topic_peers_only() {
        let mesh = Mesh::new();
        let transport = mesh.transport(PeerId(1));

        let on_topic = Arc::new(RecordingEndpoint::default());
        let off_topic = Arc::new(RecordingEndpoint::default());
        mesh.attach(PeerId(2), on_topic.clone());
        mesh.attach(PeerId(3), off_topic.clone());
        mesh.join_topic(PeerId(2), "t");
        mesh.join_topic(PeerId(3), "u");

        transport
            .broadcast("t", &test_event(b"hi"))
            .await
            .expect("Broadcast");

        assert_eq!(on_topic.delivered.lock().expect("Locking failed").len(), 1);
        assert!(off_topic.delivered.lock().expect("Locking failed").is_empty());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn suspended_broadcasts_are_discarded() {
        let mesh = Mesh::new();
        let transport = mesh.transport(PeerId(1));

        let endpoint = Arc::new(RecordingEndpoint::default());
        mesh.attach(PeerId(2), endpoint.clone());
        mesh.join_topic(PeerId(2), "t");

        mesh.suspend(PeerId(2), "t");
        transport
            .broadcast("t", &test_event(b"lost"))
            .await
            .expect("Broadcast");
        assert!(endpoint.delivered.lock().expect("Locking failed").is_empty());

        mesh.resume(PeerId(2), "t");
        transport
            .broadcast("t", &test_event(b"heard"))
            .await
            .expect("Broadcast");
        assert_eq!(endpoint.delivered.lock().expect("Locking failed").len(), 1);
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn fetch_roundtrips_through_the_wire_format() {
        let mesh = Mesh::new();
        let transport = mesh.transport(PeerId(1));

        let endpoint = Arc::new(RecordingEndpoint::default());
        let event = test_event(b"stored");
        endpoint
            .served
            .lock()
            .expect("Locking failed")
            .push(event.event.clone());
        mesh.attach(PeerId(2), endpoint);
        mesh.join_topic(PeerId(2), "t");

        let events = transport
            .fetch_events(PeerId(2), "t", &[event.short_id()])
            .await
            .expect("Fetch");
        assert_eq!(events, vec![event.event]);

        assert!(
            transport
                .fetch_events(PeerId(9), "t", &[])
                .await
                .is_err()
        );
    }
}
