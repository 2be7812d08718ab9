use agora_core::TopicId;
use agora_core::event::VerifiedEvent;
use agora_transport::wire::{Frame, decode_frame, encode_frame};
use agora_transport::{
    ClosedSnafu, EventNotFoundSnafu, PeerEndpoint, TransportResult, UnexpectedFrameSnafu,
};
use agora_util_error::FmtCompact as _;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::node::Node;
use crate::{LOG_TARGET, NodeHandle};

/// The node's receiving side on the transport
///
/// Peer deliveries are routed into topic actors; fetch requests are
/// served straight from the store, pending envelopes included.
pub(crate) struct RequestHandler {
    node: NodeHandle,
}

impl RequestHandler {
    pub(crate) fn new(node: &Node) -> Self {
        debug!(target: LOG_TARGET, "Starting request handler");
        Self {
            node: node.handle(),
        }
    }
}

#[async_trait]
impl PeerEndpoint for RequestHandler {
    async fn deliver(&self, frame: Vec<u8>) -> TransportResult<()> {
        let Frame::Event(event) = decode_frame(&frame)? else {
            return UnexpectedFrameSnafu.fail();
        };

        let Some(node) = self.node.node_ref() else {
            return ClosedSnafu.fail();
        };

        match VerifiedEvent::verify(event) {
            Ok(verified) => {
                node.ingest_remote(verified).await;
                Ok(())
            }
            Err(err) => {
                // a peer sending garbage is its problem, not a reason to
                // error the transport
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    "Dropping malformed envelope from peer"
                );
                Ok(())
            }
        }
    }

    async fn serve_fetch(&self, frame: Vec<u8>) -> TransportResult<Vec<u8>> {
        let Frame::Fetch { topic, event_ids } = decode_frame(&frame)? else {
            return UnexpectedFrameSnafu.fail();
        };

        let Some(node) = self.node.node_ref() else {
            return ClosedSnafu.fail();
        };

        let topic_id = TopicId::from_name(&topic);
        let mut events = Vec::with_capacity(event_ids.len());
        for event_id in event_ids {
            match node.db().get_event(topic_id, event_id).await {
                Some(event) => events.push(event),
                None => return EventNotFoundSnafu { event_id }.fail(),
            }
        }

        Ok(encode_frame(&Frame::Events(events)))
    }
}
