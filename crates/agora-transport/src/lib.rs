//! Transport boundary of the replication engine
//!
//! The engine only ever talks to peers through the small capability set
//! in [`TopicTransport`]; a concrete gossip stack plugs in behind it by
//! composition. [`mesh`] provides the in-process reference
//! implementation used by tests, complete with per-`(peer, topic)`
//! broadcast suspension to exercise the sync-repair path.

pub mod mesh;
pub mod wire;

use agora_core::ShortEventId;
use agora_core::event::{Event, VerifiedEvent};
use async_trait::async_trait;
use snafu::Snafu;

/// Identity of a peer on the transport, matching its registry node id
#[derive(::serde::Serialize, ::serde::Deserialize)]
#[derive(::bincode::Encode, ::bincode::Decode)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PeerId(pub u16);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    #[snafu(display("Unknown peer {peer}"))]
    UnknownPeer { peer: PeerId },
    #[snafu(display("Peer {peer} has no endpoint attached"))]
    PeerUnavailable { peer: PeerId },
    #[snafu(display("Envelope {event_id} not found on peer"))]
    EventNotFound { event_id: ShortEventId },
    #[snafu(display("Frame of {len} bytes exceeds the limit"))]
    FrameTooLarge { len: usize },
    #[snafu(display("Malformed frame"))]
    FrameDecoding {
        source: bincode::error::DecodeError,
    },
    #[snafu(display("Unexpected frame kind"))]
    UnexpectedFrame,
    #[snafu(display("Transport closed"))]
    Closed,
}
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// What the replication engine needs from a peer-to-peer transport
///
/// Ordering across envelopes is never assumed; it is reconstructed from
/// causal parents on the receiving side.
#[async_trait]
pub trait TopicTransport: Send + Sync + 'static {
    /// Best-effort delivery of one envelope to the topic's current peers
    async fn broadcast(&self, topic: &str, event: &VerifiedEvent) -> TransportResult<()>;

    /// Fetch envelopes by id from one peer; all-or-nothing
    async fn fetch_events(
        &self,
        peer: PeerId,
        topic: &str,
        event_ids: &[ShortEventId],
    ) -> TransportResult<Vec<Event>>;

    /// Current peer set for a topic, excluding the local peer
    async fn peers(&self, topic: &str) -> Vec<PeerId>;
}

/// The receiving side a node exposes to the transport
///
/// Frames are opaque bytes at this seam; [`wire`] defines their
/// encoding.
#[async_trait]
pub trait PeerEndpoint: Send + Sync + 'static {
    /// Handle an inbound broadcast frame
    async fn deliver(&self, frame: Vec<u8>) -> TransportResult<()>;

    /// Answer a fetch request frame with a response frame
    async fn serve_fetch(&self, frame: Vec<u8>) -> TransportResult<Vec<u8>>;
}
