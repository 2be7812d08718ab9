use std::sync::Arc;

use agora_core::event::{Event, VerifiedEvent};
use agora_core::{EventId, TopicId};
use agora_store::{Database, InsertEventOutcome};
use agora_util_error::FmtCompact as _;
use snafu::ResultExt as _;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, instrument, trace, warn};

use crate::node::Clock;
use crate::{StoreSnafu, TopicResult};

const LOG_TARGET: &str = "agora::topic";

pub(crate) enum TopicInput {
    Publish {
        payload: Vec<u8>,
        reply: oneshot::Sender<TopicResult<EventId>>,
    },
    Remote {
        event: VerifiedEvent,
    },
    Subscribe {
        buffer: usize,
        reply: oneshot::Sender<mpsc::Receiver<Event>>,
    },
}

/// The single consumer owning one topic
///
/// Every mutation of the topic — local publish, peer delivery, fetched
/// repair — passes through this task's inbox, which serializes them
/// without any lock on the hot path. The inbox is bounded, so producers
/// feel backpressure instead of the node buffering without limit.
pub(crate) struct TopicLoop {
    topic: String,
    topic_id: TopicId,
    db: Arc<Database>,
    inbox: mpsc::Receiver<TopicInput>,
    broadcast_tx: mpsc::Sender<VerifiedEvent>,
    subscribers: Vec<mpsc::Sender<Event>>,
    clock: Clock,
    shutdown_rx: watch::Receiver<bool>,
}

impl TopicLoop {
    pub(crate) fn new(
        topic: &str,
        db: Arc<Database>,
        inbox: mpsc::Receiver<TopicInput>,
        broadcast_tx: mpsc::Sender<VerifiedEvent>,
        clock: Clock,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        debug!(target: LOG_TARGET, topic, "Starting topic actor");
        Self {
            topic: topic.to_owned(),
            topic_id: TopicId::from_name(topic),
            db,
            inbox,
            broadcast_tx,
            subscribers: vec![],
            clock,
            shutdown_rx,
        }
    }

    /// Run the thread
    #[instrument(name = "topic-loop", skip(self), fields(topic = %self.topic))]
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                input = self.inbox.recv() => {
                    let Some(input) = input else {
                        break;
                    };
                    self.handle_input(input).await;
                }
            }
        }
        debug!(target: LOG_TARGET, "Topic actor stopped");
    }

    async fn handle_input(&mut self, input: TopicInput) {
        match input {
            TopicInput::Publish { payload, reply } => {
                let result = self.publish(payload).await;
                let _ = reply.send(result);
            }
            TopicInput::Remote { event } => self.handle_remote(event).await,
            TopicInput::Subscribe { buffer, reply } => {
                let (tx, rx) = mpsc::channel(buffer.max(1));
                self.subscribers.push(tx);
                let _ = reply.send(rx);
            }
        }
    }

    async fn publish(&mut self, payload: Vec<u8>) -> TopicResult<EventId> {
        let heads = self.db.get_heads(self.topic_id).await;

        let event = Event::builder()
            .topic(self.topic.clone())
            .parents(heads.into_iter().collect())
            .timestamp((self.clock)())
            .payload(payload)
            .build();
        let verified =
            VerifiedEvent::verify(event).expect("Locally built envelopes are well-formed");

        let outcome = self.db.insert_event(&verified).await.context(StoreSnafu)?;
        match outcome {
            InsertEventOutcome::Committed { cascade } => {
                // enqueue for delivery before emitting; drop on overflow,
                // peers will re-learn the envelope via sync
                if self.broadcast_tx.try_send(verified.clone()).is_err() {
                    warn!(
                        target: LOG_TARGET,
                        event_id = %verified.short_id(),
                        "Broadcast queue full, dropping; peers will sync it later"
                    );
                }
                self.emit(cascade).await;
            }
            InsertEventOutcome::AlreadyPresent => {
                // identical content, parents and timestamp republished
                trace!(target: LOG_TARGET, event_id = %verified.short_id(), "Duplicate publish");
            }
            InsertEventOutcome::Pending { .. } => {
                // parents were the committed head set, so this cannot pend
                warn!(
                    target: LOG_TARGET,
                    event_id = %verified.short_id(),
                    "Local publish unexpectedly pending"
                );
            }
        }

        Ok(verified.event_id)
    }

    async fn handle_remote(&mut self, event: VerifiedEvent) {
        match self.db.insert_event(&event).await {
            Ok(InsertEventOutcome::Committed { cascade }) => self.emit(cascade).await,
            Ok(InsertEventOutcome::Pending { missing }) => {
                // the store already woke the fetcher
                debug!(
                    target: LOG_TARGET,
                    event_id = %event.short_id(),
                    missing_len = missing.len(),
                    "Remote envelope pending on missing parents"
                );
            }
            Ok(InsertEventOutcome::AlreadyPresent) => {
                trace!(target: LOG_TARGET, event_id = %event.short_id(), "Already known");
            }
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    event_id = %event.short_id(),
                    err = %err.fmt_compact(),
                    "Failed to store remote envelope"
                );
            }
        }
    }

    /// Deliver freshly committed envelopes to subscribers, in commit
    /// order, waiting out full buffers; subscribers that went away are
    /// pruned.
    async fn emit(&mut self, cascade: Vec<Event>) {
        for event in cascade {
            let mut gone = vec![];
            for (idx, subscriber) in self.subscribers.iter().enumerate() {
                if subscriber.send(event.clone()).await.is_err() {
                    gone.push(idx);
                }
            }
            for idx in gone.into_iter().rev() {
                self.subscribers.swap_remove(idx);
            }
        }
    }
}
