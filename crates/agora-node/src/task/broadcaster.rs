use std::sync::Arc;

use agora_core::event::VerifiedEvent;
use agora_transport::TopicTransport;
use agora_util_error::FmtCompact as _;
use backon::Retryable as _;
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument, trace, warn};

const LOG_TARGET: &str = "agora::broadcaster";

/// Per-topic delivery task
///
/// Drains the topic actor's outbound queue and hands envelopes to the
/// transport, retrying transient failures a bounded number of times.
/// Losing an envelope here is survivable: any peer that later sees a
/// successor will fetch the lost one by id.
pub(crate) struct Broadcaster {
    topic: String,
    transport: Arc<dyn TopicTransport>,
    events_rx: mpsc::Receiver<VerifiedEvent>,
    max_attempts: usize,
    shutdown_rx: watch::Receiver<bool>,
}

impl Broadcaster {
    pub(crate) fn new(
        topic: &str,
        transport: Arc<dyn TopicTransport>,
        events_rx: mpsc::Receiver<VerifiedEvent>,
        max_attempts: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        debug!(target: LOG_TARGET, topic, "Starting broadcaster task");
        Self {
            topic: topic.to_owned(),
            transport,
            events_rx,
            max_attempts,
            shutdown_rx,
        }
    }

    /// Run the thread
    #[instrument(name = "broadcaster", skip(self), fields(topic = %self.topic))]
    pub(crate) async fn run(mut self) {
        loop {
            let event = tokio::select! {
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    event
                }
            };
            trace!(target: LOG_TARGET, event_id = %event.short_id(), "Woke up");

            let deliver = || async { self.transport.broadcast(&self.topic, &event).await };

            if let Err(err) = deliver
                .retry(
                    backon::ExponentialBuilder::default()
                        .with_jitter()
                        .with_max_times(self.max_attempts),
                )
                .notify(|err, dur| {
                    debug!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        delay_ms = dur.as_millis() as u64,
                        "Broadcast attempt failed"
                    );
                })
                .await
            {
                warn!(
                    target: LOG_TARGET,
                    err = %err.fmt_compact(),
                    event_id = %event.short_id(),
                    "Giving up on broadcast; peers will recover via sync"
                );
            }
        }
        debug!(target: LOG_TARGET, "Broadcaster stopped");
    }
}
