use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use agora_core::event::{EventError, VerifiedEvent};
use agora_core::{ShortEventId, TopicId};
use agora_transport::{PeerId, TopicTransport, TransportError};
use agora_util_error::FmtCompact as _;
use rand::Rng as _;
use snafu::{OptionExt as _, ResultExt as _, Snafu, ensure};
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use crate::NodeHandle;
use crate::node::Node;

const LOG_TARGET: &str = "agora::fetcher";

/// Strategy for choosing which peer to ask for missing envelopes
pub trait PeerPicker: Send + Sync + 'static {
    /// Choose one of `peers`; `None` when the set is empty
    fn pick(&self, peers: &[PeerId]) -> Option<PeerId>;
}

/// Uniform random choice, the reference policy
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPeerPicker;

impl PeerPicker for RandomPeerPicker {
    fn pick(&self, peers: &[PeerId]) -> Option<PeerId> {
        if peers.is_empty() {
            return None;
        }
        Some(peers[rand::rng().random_range(0..peers.len())])
    }
}

#[derive(Debug, Snafu)]
enum FetchError {
    #[snafu(display("No peers hold the topic"))]
    NoPeers,
    #[snafu(display("Peer fetch failed"))]
    PeerFetch { source: TransportError },
    #[snafu(transparent)]
    InvalidEvent { source: EventError },
    #[snafu(display("Peer returned unrequested envelope {event_id}"))]
    Unrequested { event_id: ShortEventId },
    #[snafu(display("Peer response missing requested envelopes"))]
    Incomplete,
}
type FetchResult<T> = std::result::Result<T, FetchError>;

/// Sync repair task
///
/// Woken through the store's coalescing missing-events channel whenever
/// any topic gains a missing parent. Reads the topic's current fetch
/// plan, asks one peer for the whole batch, and feeds verified results
/// back through the topic actor. Failures requeue the topic with
/// exponential backoff; newly revealed ancestors re-wake it through the
/// store on their own.
pub(crate) struct MissingEventFetcher {
    // Notably, we want to shut down when the node goes away, so no
    // strong reference is kept here
    node: NodeHandle,
    transport: Arc<dyn TopicTransport>,
    peer_picker: Arc<dyn PeerPicker>,
    missing_rx: dedup_chan::Receiver<TopicId>,
    shutdown_rx: watch::Receiver<bool>,
}

impl MissingEventFetcher {
    pub(crate) fn new(node: &Node) -> Self {
        debug!(target: LOG_TARGET, "Starting missing event fetcher");
        Self {
            node: node.handle(),
            transport: node.transport(),
            peer_picker: node.peer_picker(),
            missing_rx: node.db().topics_with_missing_subscribe(100),
            shutdown_rx: node.shutdown_rx(),
        }
    }

    /// Run the thread
    #[instrument(name = "missing-event-fetcher", skip(self), ret)]
    pub(crate) async fn run(mut self) {
        let mut failures: HashMap<TopicId, u32> = HashMap::new();

        loop {
            let topic_id = tokio::select! {
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                res = self.missing_rx.recv() => match res {
                    Ok(topic_id) => topic_id,
                    Err(dedup_chan::RecvError::Closed) => break,
                    Err(dedup_chan::RecvError::Lagging) => {
                        warn!(target: LOG_TARGET, "Missing event fetcher missed some notifications");
                        continue;
                    }
                }
            };
            trace!(target: LOG_TARGET, "Woke up");

            let Some(node) = self.node.node_ref() else {
                break;
            };

            let missing = node.db().get_missing_events(topic_id).await;
            if missing.is_empty() {
                failures.remove(&topic_id);
                continue;
            }
            let Some(topic) = node.db().get_topic_name(topic_id).await else {
                continue;
            };

            debug!(target: LOG_TARGET, len = missing.len(), topic = %topic, "Missing events for topic");

            match self.fetch_missing(&topic, &missing).await {
                Ok(events) => {
                    failures.remove(&topic_id);
                    for event in events {
                        node.ingest_remote(event).await;
                    }
                    // ancestors revealed by these envelopes re-announce
                    // the topic through the store's pending hook
                }
                Err(err) => {
                    let count = failures.entry(topic_id).or_default();
                    *count += 1;
                    let delay = retry_delay(*count);
                    debug!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        topic = %topic,
                        delay_ms = delay.as_millis() as u64,
                        "Fetch failed, requeueing"
                    );
                    let db = node.db().clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        db.notify_missing(topic_id);
                    });
                }
            }
        }
    }

    async fn fetch_missing(
        &self,
        topic: &str,
        missing: &[ShortEventId],
    ) -> FetchResult<Vec<VerifiedEvent>> {
        let peers = self.transport.peers(topic).await;
        let peer = self.peer_picker.pick(&peers).context(NoPeersSnafu)?;

        debug!(target: LOG_TARGET, %peer, topic, len = missing.len(), "Fetching missing events from peer");

        let events = self
            .transport
            .fetch_events(peer, topic, missing)
            .await
            .context(PeerFetchSnafu)?;

        // The peer answers for the request as a whole: every envelope
        // must be one that was asked for, recompute to the id it claims,
        // and none may be absent.
        let requested: HashSet<ShortEventId> = missing.iter().copied().collect();
        let mut verified_events = Vec::with_capacity(events.len());
        let mut received = HashSet::new();
        for event in events {
            let verified = VerifiedEvent::verify(event)?;
            let event_id = verified.short_id();
            ensure!(requested.contains(&event_id), UnrequestedSnafu { event_id });
            received.insert(event_id);
            verified_events.push(verified);
        }
        ensure!(received.len() == requested.len(), IncompleteSnafu);

        Ok(verified_events)
    }
}

fn retry_delay(failures: u32) -> Duration {
    const BASE: Duration = Duration::from_millis(500);
    const CAP: Duration = Duration::from_secs(30);

    BASE.saturating_mul(1u32 << failures.min(6)).min(CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_picker_picks_from_the_set() {
        let peers = [PeerId(1), PeerId(2), PeerId(3)];
        for _ in 0..32 {
            let picked = RandomPeerPicker.pick(&peers).expect("Non-empty");
            assert!(peers.contains(&picked));
        }
        assert_eq!(RandomPeerPicker.pick(&[]), None);
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        assert!(retry_delay(1) < retry_delay(2));
        assert!(retry_delay(2) < retry_delay(4));
        assert_eq!(retry_delay(20), Duration::from_secs(30));
    }
}
