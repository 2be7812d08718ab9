use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use agora_util_error::FmtCompact as _;
use agora_util_notify::{Notifier, NotifySub};
use snafu::{ResultExt as _, ensure};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, trace, warn};

use crate::{
    InvalidRefreshIntervalSnafu, LOG_TARGET, NodeEntry, RawNodeEntry, RosterSource,
    StartupFetchSnafu, StartupTimeoutSnafu, WatcherStartResult,
};

/// Tracks the authoritative registry and notifies subscribers of roster
/// growth and change.
///
/// The roster is append-only from this watcher's point of view: the
/// source never removes ids in practice, so ids absent from a fresh
/// snapshot stay in memory. Subscribers get new ids as one batch per
/// refresh and changed entries through per-id notifiers; both streams
/// are lossy, so consumers re-read [`RegistryWatcher::get_nodes`] on
/// wake rather than reconstruct state from deltas.
pub struct RegistryWatcher {
    /// Weak self-reference handed to the poller task
    handle: Weak<RegistryWatcher>,

    source: Arc<dyn RosterSource>,
    refresh_interval: Duration,
    call_timeout: Duration,

    roster: RwLock<BTreeMap<u16, NodeEntry>>,
    new_nodes: Notifier<Vec<NodeEntry>>,
    /// Created lazily on first subscription; an id nobody watches costs
    /// nothing on change.
    changed: Mutex<HashMap<u16, Notifier<NodeEntry>>>,

    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

#[bon::bon]
impl RegistryWatcher {
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        source: Arc<dyn RosterSource>,
        refresh_interval: Duration,
        #[builder(default = Duration::from_secs(10))] contract_call_timeout: Duration,
    ) -> WatcherStartResult<Arc<Self>> {
        ensure!(!refresh_interval.is_zero(), InvalidRefreshIntervalSnafu);

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new_cyclic(|handle| Self {
            handle: handle.clone(),
            source,
            refresh_interval,
            call_timeout: contract_call_timeout,
            roster: RwLock::new(BTreeMap::new()),
            new_nodes: Notifier::new(),
            changed: Mutex::new(HashMap::new()),
            shutdown_tx,
            started: AtomicBool::new(false),
        }))
    }
}

impl RegistryWatcher {
    /// Load the initial roster, then start the refresh loop
    ///
    /// A failed or timed-out initial load is a startup error: the
    /// watcher refuses to run on a stale-zero roster and no background
    /// loop is spawned.
    pub async fn start(&self) -> WatcherStartResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = match tokio::time::timeout(self.call_timeout, self.source.fetch_roster())
            .await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(err)) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err).context(StartupFetchSnafu);
            }
            Err(_elapsed) => {
                self.started.store(false, Ordering::SeqCst);
                return StartupTimeoutSnafu.fail();
            }
        };
        self.apply_snapshot(snapshot);

        tokio::spawn(RosterPoller::new(self).run());
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Snapshot of the roster, ascending by id
    pub fn get_nodes(&self) -> Vec<NodeEntry> {
        self.roster
            .read()
            .expect("Locking failed")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_node(&self, id: u16) -> Option<NodeEntry> {
        self.roster.read().expect("Locking failed").get(&id).cloned()
    }

    /// Batches of ids never seen before, one batch per refresh. Lossy.
    pub fn new_nodes_subscribe(&self, buffer: usize) -> NotifySub<Vec<NodeEntry>> {
        self.new_nodes.subscribe(buffer)
    }

    /// Changes to one id's entry. Lossy.
    ///
    /// An id can only change after it has been announced as new, so a
    /// subscriber that also watches [`Self::new_nodes_subscribe`] sees
    /// new-before-change for any given id.
    pub fn changed_node_subscribe(&self, id: u16, buffer: usize) -> NotifySub<NodeEntry> {
        self.changed
            .lock()
            .expect("Locking failed")
            .entry(id)
            .or_default()
            .subscribe(buffer)
    }

    fn apply_snapshot(&self, snapshot: Vec<RawNodeEntry>) {
        let mut news = vec![];
        let mut changes = vec![];

        {
            let mut roster = self.roster.write().expect("Locking failed");
            for raw in snapshot {
                let node = NodeEntry::from_raw(raw);
                match roster.get(&node.id).cloned() {
                    None => {
                        news.push(node.clone());
                        roster.insert(node.id, node);
                    }
                    Some(prev) if prev != node => {
                        changes.push(node.clone());
                        roster.insert(node.id, node);
                    }
                    Some(_) => {}
                }
            }
        }

        if !news.is_empty() {
            debug!(target: LOG_TARGET, count = news.len(), "New registry nodes");
            self.new_nodes.trigger(news);
        }
        for node in changes {
            debug!(target: LOG_TARGET, id = node.id, healthy = node.healthy, "Registry node changed");
            let notifier = self
                .changed
                .lock()
                .expect("Locking failed")
                .get(&node.id)
                .cloned();
            if let Some(notifier) = notifier {
                notifier.trigger(node);
            }
        }
    }
}

/// The background refresh loop
struct RosterPoller {
    watcher: Weak<RegistryWatcher>,
    refresh_interval: Duration,
    call_timeout: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl RosterPoller {
    fn new(watcher: &RegistryWatcher) -> Self {
        debug!(target: LOG_TARGET, interval_ms = watcher.refresh_interval.as_millis() as u64, "Starting roster refresh task");
        Self {
            watcher: watcher.handle.clone(),
            refresh_interval: watcher.refresh_interval,
            call_timeout: watcher.call_timeout,
            shutdown_rx: watcher.shutdown_tx.subscribe(),
        }
    }

    /// Run the thread
    #[instrument(name = "roster-poller", skip(self), ret)]
    async fn run(mut self) {
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + self.refresh_interval,
            self.refresh_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => (),
                res = self.shutdown_rx.changed() => {
                    if res.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }
            trace!(target: LOG_TARGET, "Woke up");

            let Some(watcher) = self.watcher.upgrade() else {
                debug!(target: LOG_TARGET, "Watcher gone, quitting");
                break;
            };

            match tokio::time::timeout(self.call_timeout, watcher.source.fetch_roster()).await {
                Ok(Ok(snapshot)) => watcher.apply_snapshot(snapshot),
                Ok(Err(err)) => {
                    warn!(
                        target: LOG_TARGET,
                        err = %err.fmt_compact(),
                        "Roster refresh failed, retaining previous roster"
                    );
                }
                Err(_elapsed) => {
                    warn!(
                        target: LOG_TARGET,
                        "Roster refresh timed out, retaining previous roster"
                    );
                }
            }
        }
    }
}
