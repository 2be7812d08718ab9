use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use agora_core::event::{Event, VerifiedEvent};
use agora_core::{EventId, Timestamp, TopicId};
use agora_store::{Database, QueryFilter};
use agora_transport::{PeerEndpoint, PeerId, TopicTransport};
use agora_util_fmt::AsFmtOption as _;
use snafu::{ResultExt as _, ensure};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::request_handler::RequestHandler;
use crate::task::broadcaster::Broadcaster;
use crate::task::missing_event_fetcher::{MissingEventFetcher, PeerPicker, RandomPeerPicker};
use crate::topic_loop::{TopicInput, TopicLoop};
use crate::{
    InitResult, InitStoreSnafu, InvalidTopicSnafu, LOG_TARGET, NodeHandle, StoreSnafu,
    TopicResult, TopicUnavailableSnafu,
};

/// Source of envelope timestamps
///
/// The engine itself has no clock authority; whoever builds the node
/// decides. The default is the system clock in microseconds, tests
/// inject counters for deterministic ordering.
pub type Clock = Arc<dyn Fn() -> Timestamp + Send + Sync + 'static>;

fn system_clock() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or_default()
        .into()
}

#[derive(Clone)]
pub(crate) struct TopicHandle {
    pub(crate) inbox: mpsc::Sender<TopicInput>,
    pub(crate) faulted: Arc<AtomicBool>,
}

pub struct Node {
    /// Weak self-reference that can be given out to components
    handle: NodeHandle,

    peer_id: PeerId,
    db: Arc<Database>,
    transport: Arc<dyn TopicTransport>,

    topics: Mutex<HashMap<TopicId, TopicHandle>>,

    inbound_buffer: usize,
    broadcast_buffer: usize,
    max_broadcast_attempts: usize,
    clock: Clock,
    peer_picker: Arc<dyn PeerPicker>,

    shutdown_tx: watch::Sender<bool>,
}

#[bon::bon]
impl Node {
    #[builder(finish_fn(name = "build"))]
    pub async fn new(
        peer_id: PeerId,
        transport: Arc<dyn TopicTransport>,
        db: Option<Arc<Database>>,
        clock: Option<Clock>,
        peer_picker: Option<Arc<dyn PeerPicker>>,
        #[builder(default = 64)] inbound_buffer: usize,
        #[builder(default = 64)] broadcast_buffer: usize,
        #[builder(default = 4)] max_broadcast_attempts: usize,
        #[builder(default = true)] start_missing_event_fetcher: bool,
    ) -> InitResult<Arc<Self>> {
        let db = match db {
            Some(db) => db,
            None => Arc::new(Database::new_in_memory().await.context(InitStoreSnafu)?),
        };

        debug!(target: LOG_TARGET, peer_id = %peer_id, "Starting node");

        let (shutdown_tx, _) = watch::channel(false);

        let node = Arc::new_cyclic(|node| Self {
            handle: node.clone().into(),
            peer_id,
            db,
            transport,
            topics: Mutex::new(HashMap::new()),
            inbound_buffer,
            broadcast_buffer,
            max_broadcast_attempts,
            clock: clock.unwrap_or_else(|| Arc::new(system_clock)),
            peer_picker: peer_picker.unwrap_or_else(|| Arc::new(RandomPeerPicker)),
            shutdown_tx,
        });

        if start_missing_event_fetcher {
            node.start_missing_event_fetcher();
        }

        Ok(node)
    }
}

impl Node {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// The receiving side to hand to the transport
    pub fn endpoint(&self) -> Arc<dyn PeerEndpoint> {
        Arc::new(RequestHandler::new(self))
    }

    /// Start holding a topic: publishes, subscriptions and peer traffic
    /// for it are accepted from here on. Idempotent.
    pub async fn join_topic(&self, topic: &str) -> TopicResult<()> {
        self.topic_handle(topic).await.map(|_| ())
    }

    /// Publish a payload, returning its content id
    ///
    /// Parents are the topic's head set at commit time; the envelope is
    /// committed locally, then delivered to peers best-effort.
    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> TopicResult<EventId> {
        let handle = self.topic_handle(topic).await?;
        let (reply_tx, reply_rx) = oneshot::channel();

        handle
            .inbox
            .send(TopicInput::Publish {
                payload: payload.into(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| TopicUnavailableSnafu.build())?;

        reply_rx
            .await
            .map_err(|_| TopicUnavailableSnafu.build())?
    }

    /// Committed envelopes in `(timestamp, payload)` order
    pub async fn query(&self, topic: &str, filter: &QueryFilter) -> TopicResult<Vec<Event>> {
        ensure!(!topic.is_empty(), InvalidTopicSnafu);
        trace!(
            target: LOG_TARGET,
            topic,
            since = %filter.since.fmt_option(),
            until = %filter.until.fmt_option(),
            "Query"
        );
        Ok(self.db.query(TopicId::from_name(topic), filter).await)
    }

    /// Stream of commits, lossless from the moment of subscription
    ///
    /// Earlier envelopes are obtained via [`Node::query`]. A subscriber
    /// that stops reading eventually backpressures the whole topic, so
    /// consumers are expected to keep draining.
    pub async fn subscribe(&self, topic: &str, buffer: usize) -> TopicResult<mpsc::Receiver<Event>> {
        let handle = self.topic_handle(topic).await?;
        let (reply_tx, reply_rx) = oneshot::channel();

        handle
            .inbox
            .send(TopicInput::Subscribe {
                buffer,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TopicUnavailableSnafu.build())?;

        reply_rx.await.map_err(|_| TopicUnavailableSnafu.build())
    }

    /// Stop every topic actor, broadcaster and fetcher
    ///
    /// Cooperative and bounded: tasks observe the signal at their next
    /// suspension point; nothing waits on unreachable peers.
    pub fn shutdown(&self) {
        debug!(target: LOG_TARGET, peer_id = %self.peer_id, "Shutting down");
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub(crate) fn transport(&self) -> Arc<dyn TopicTransport> {
        self.transport.clone()
    }

    pub(crate) fn peer_picker(&self) -> Arc<dyn PeerPicker> {
        self.peer_picker.clone()
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Route an envelope received from a peer to its topic actor
    ///
    /// Envelopes for topics this node has never held are dropped; a
    /// restart is handled by lazily reviving actors for topics the store
    /// knows about.
    pub(crate) async fn ingest_remote(&self, event: VerifiedEvent) {
        let topic_id = event.topic_id();

        let known = self
            .topics
            .lock()
            .expect("Locking failed")
            .get(&topic_id)
            .cloned();

        let handle = match known {
            Some(handle) => handle,
            None => {
                if self.db.get_topic_name(topic_id).await.is_none() {
                    debug!(
                        target: LOG_TARGET,
                        topic = %event.event.topic,
                        event_id = %event.short_id(),
                        "Envelope for a topic this node does not hold, dropping"
                    );
                    return;
                }
                match self.topic_handle(&event.event.topic).await {
                    Ok(handle) => handle,
                    Err(_) => {
                        debug!(
                            target: LOG_TARGET,
                            topic = %event.event.topic,
                            "Topic unavailable, dropping envelope"
                        );
                        return;
                    }
                }
            }
        };

        if handle
            .inbox
            .send(TopicInput::Remote { event })
            .await
            .is_err()
        {
            debug!(target: LOG_TARGET, "Topic closed, dropping envelope");
        }
    }

    async fn topic_handle(&self, topic: &str) -> TopicResult<TopicHandle> {
        ensure!(!topic.is_empty(), InvalidTopicSnafu);
        let topic_id = TopicId::from_name(topic);

        if let Some(handle) = self
            .topics
            .lock()
            .expect("Locking failed")
            .get(&topic_id)
            .cloned()
        {
            ensure!(!handle.faulted.load(Ordering::SeqCst), TopicUnavailableSnafu);
            return Ok(handle);
        }

        self.db.register_topic(topic).await.context(StoreSnafu)?;

        let (inbox_tx, inbox_rx) = mpsc::channel(self.inbound_buffer.max(1));
        let (broadcast_tx, broadcast_rx) = mpsc::channel(self.broadcast_buffer.max(1));
        let faulted = Arc::new(AtomicBool::new(false));

        let handle = TopicHandle {
            inbox: inbox_tx,
            faulted: faulted.clone(),
        };

        {
            let mut topics = self.topics.lock().expect("Locking failed");
            if let Some(existing) = topics.get(&topic_id) {
                // lost a creation race; the winner's actor is already up
                return Ok(existing.clone());
            }
            topics.insert(topic_id, handle.clone());
        }

        let join = tokio::spawn(
            TopicLoop::new(
                topic,
                self.db.clone(),
                inbox_rx,
                broadcast_tx,
                self.clock.clone(),
                self.shutdown_rx(),
            )
            .run(),
        );
        tokio::spawn(supervise_topic(topic.to_owned(), join, faulted));

        tokio::spawn(
            Broadcaster::new(
                topic,
                self.transport.clone(),
                broadcast_rx,
                self.max_broadcast_attempts,
                self.shutdown_rx(),
            )
            .run(),
        );

        Ok(handle)
    }

    fn start_missing_event_fetcher(&self) {
        tokio::spawn(MissingEventFetcher::new(self).run());
    }
}

/// Contain a topic actor's death: other topics keep running, the dead
/// one rejects work until the process restarts.
async fn supervise_topic(topic: String, join: JoinHandle<()>, faulted: Arc<AtomicBool>) {
    match join.await {
        Ok(()) => {}
        Err(err) if err.is_panic() => {
            faulted.store(true, Ordering::SeqCst);
            error!(
                target: LOG_TARGET,
                topic = %topic,
                "Topic actor panicked; topic faulted until restart"
            );
        }
        Err(_) => {}
    }
}
