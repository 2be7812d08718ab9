mod insert_ops;
mod tables;
mod tx_ops;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{ops, result};

use agora_core::event::{Event, VerifiedEvent};
use agora_core::{ShortEventId, Timestamp, TopicId};
use agora_util_error::BoxedError;
use redb_bincode::ReadTransaction;
pub use redb_bincode::WriteTransaction;
use snafu::{Location, ResultExt as _, Snafu};
use tokio::sync::broadcast;
use tokio::task::JoinError;
use tracing::debug;

pub use self::tables::*;

const LOG_TARGET: &str = "agora::store";

/// A write transaction that can schedule side effects to run after the
/// transaction actually lands.
///
/// Channel notifications must not fire for transactions that later fail
/// to commit, so anything observable from outside the store goes through
/// [`WriteTransactionCtx::on_commit`].
pub struct WriteTransactionCtx {
    dbtx: WriteTransaction,
    on_commit: std::sync::Mutex<Vec<Box<dyn FnOnce() + 'static>>>,
}

impl From<WriteTransaction> for WriteTransactionCtx {
    fn from(dbtx: WriteTransaction) -> Self {
        Self {
            dbtx,
            on_commit: std::sync::Mutex::new(vec![]),
        }
    }
}

impl ops::Deref for WriteTransactionCtx {
    type Target = WriteTransaction;

    fn deref(&self) -> &Self::Target {
        &self.dbtx
    }
}

impl ops::DerefMut for WriteTransactionCtx {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.dbtx
    }
}

impl WriteTransactionCtx {
    pub fn on_commit(&self, f: impl FnOnce() + 'static) {
        self.on_commit
            .lock()
            .expect("Locking failed")
            .push(Box::new(f));
    }

    fn commit(self) -> result::Result<(), redb::CommitError> {
        let Self { dbtx, on_commit } = self;

        dbtx.commit()?;

        for hook in on_commit.lock().expect("Locking failed").drain(..) {
            hook();
        }
        Ok(())
    }
}

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    DbVersionTooHigh {
        db_ver: u64,
        code_ver: u64,
        #[snafu(implicit)]
        location: Location,
    },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    DbTxLogic {
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
}
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Result of feeding one envelope into the store
#[derive(Debug, Clone)]
pub enum InsertEventOutcome {
    /// Same id seen before (committed or pending); nothing changed
    AlreadyPresent,
    /// The envelope committed, possibly unblocking formerly-pending
    /// envelopes; `cascade` lists everything committed by this insert,
    /// in commit order, the inserted envelope first.
    Committed { cascade: Vec<Event> },
    /// Recorded, but waiting for the listed parents
    Pending {
        missing: std::collections::BTreeSet<ShortEventId>,
    },
}

/// Filter for ordered topic queries
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Inclusive lower timestamp bound
    pub since: Option<Timestamp>,
    /// Inclusive upper timestamp bound
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
}

/// The topic store: every committed and pending envelope of every topic
/// this node holds, plus the indices that drive heads, queries and sync
/// repair.
///
/// One database spans all topics; per-topic write serialization is the
/// topic actor's job (and redb only admits a single writer anyway).
pub struct Database {
    inner: redb_bincode::Database,

    /// Monotonically increasing counter for ordering received envelopes.
    /// Used to pick the eviction victim when a topic's pending set is
    /// full.
    reception_order_counter: AtomicU64,

    new_commits_tx: broadcast::Sender<(TopicId, Event)>,
    topics_with_missing_tx: dedup_chan::Sender<TopicId>,
}

impl Database {
    const DB_VER: u64 = 0;

    /// Cap on the per-topic pending set; above it the oldest pending
    /// envelope is dropped and becomes a future sync candidate again.
    pub const MAX_PENDING_PER_TOPIC: usize = 4096;

    pub fn next_reception_order(&self) -> u64 {
        self.reception_order_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn new_in_memory() -> DbResult<Database> {
        debug!(target: LOG_TARGET, "Opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    pub async fn open(path: impl Into<PathBuf>) -> DbResult<Database> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> DbResult<Database> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Self::verify_db_ver_tx(tx)?;
            Ok(())
        })
        .await?;

        // Resume the reception order above anything already recorded, so
        // pre-existing pending envelopes keep their eviction priority.
        let max_pending_order = Self::read_with_inner(&inner, |tx| {
            let events_pending_table = tx.open_table(&events_pending::TABLE)?;
            Self::max_pending_order_tx(&events_pending_table)
        })
        .await?;

        let (new_commits_tx, _) = broadcast::channel(100);

        Ok(Self {
            inner,
            reception_order_counter: AtomicU64::new(
                max_pending_order.map(|o| o + 1).unwrap_or_default(),
            ),
            new_commits_tx,
            topics_with_missing_tx: dedup_chan::Sender::new(),
        })
    }

    fn init_tables_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        tx.open_table(&db_version::TABLE)?;
        tx.open_table(&topics::TABLE)?;
        tx.open_table(&events::TABLE)?;
        tx.open_table(&events_pending::TABLE)?;
        tx.open_table(&events_missing::TABLE)?;
        tx.open_table(&events_heads::TABLE)?;
        tx.open_table(&events_by_time::TABLE)?;
        Ok(())
    }

    fn verify_db_ver_tx(tx: &WriteTransactionCtx) -> DbResult<()> {
        let mut db_version_table = tx.open_table(&db_version::TABLE)?;
        let db_ver = db_version_table
            .get(&())?
            .map(|g| g.value())
            .unwrap_or(Self::DB_VER);
        if Self::DB_VER < db_ver {
            return DbVersionTooHighSnafu {
                db_ver,
                code_ver: Self::DB_VER,
            }
            .fail();
        }
        db_version_table.insert(&(), &Self::DB_VER)?;
        Ok(())
    }

    /// Stream of committed envelopes across all topics, in commit order
    ///
    /// Backed by a broadcast channel: a consumer that lags past the
    /// buffer observes `Lagged` and should re-read via query. The
    /// lossless per-subscription stream lives a level up, in the topic
    /// actor.
    pub fn commits_subscribe(&self) -> broadcast::Receiver<(TopicId, Event)> {
        self.new_commits_tx.subscribe()
    }

    /// Coalescing wake-up stream for topics that have missing parents
    pub fn topics_with_missing_subscribe(&self, capacity: usize) -> dedup_chan::Receiver<TopicId> {
        self.topics_with_missing_tx.subscribe(capacity)
    }

    /// Re-announce a topic on the missing-events channel
    ///
    /// The fetcher uses this to requeue a topic whose fetch failed.
    pub fn notify_missing(&self, topic: TopicId) {
        self.topics_with_missing_tx.send(topic);
    }

    pub async fn insert_event(&self, event: &VerifiedEvent) -> DbResult<InsertEventOutcome> {
        self.write_with(|tx| self.insert_event_notifying_tx(event, tx))
            .await
    }

    pub async fn has_event(&self, topic: TopicId, event_id: impl Into<ShortEventId>) -> bool {
        let event_id = event_id.into();
        self.read_with(|tx| {
            let events_table = tx.open_table(&events::TABLE)?;
            let events_pending_table = tx.open_table(&events_pending::TABLE)?;
            Ok(Self::has_event_tx(
                topic,
                event_id,
                &events_table,
                &events_pending_table,
            )?)
        })
        .await
        .expect("Database panic")
    }

    /// Get an envelope by id, committed or pending
    ///
    /// Pending envelopes are retrievable so peers can fetch them during
    /// sync; queries exclude them.
    pub async fn get_event(
        &self,
        topic: TopicId,
        event_id: impl Into<ShortEventId>,
    ) -> Option<Event> {
        let event_id = event_id.into();
        self.read_with(|tx| {
            let events_table = tx.open_table(&events::TABLE)?;
            let events_pending_table = tx.open_table(&events_pending::TABLE)?;
            Self::get_event_tx(topic, event_id, &events_table, &events_pending_table)
        })
        .await
        .expect("Database panic")
    }

    /// Snapshot of the current head set, sorted by id
    pub async fn get_heads(&self, topic: TopicId) -> Vec<ShortEventId> {
        self.read_with(|tx| {
            let events_heads_table = tx.open_table(&events_heads::TABLE)?;
            Self::get_heads_tx(topic, &events_heads_table)
        })
        .await
        .expect("Database panic")
    }

    /// Ids referenced as parents but absent from the store entirely —
    /// the fetch plan for sync repair.
    ///
    /// Parents that are present but pending are excluded: their bytes are
    /// already here, only their own ancestors are wanted.
    pub async fn get_missing_events(&self, topic: TopicId) -> Vec<ShortEventId> {
        self.read_with(|tx| {
            let events_missing_table = tx.open_table(&events_missing::TABLE)?;
            let events_pending_table = tx.open_table(&events_pending::TABLE)?;
            Self::get_missing_events_tx(topic, &events_missing_table, &events_pending_table)
        })
        .await
        .expect("Database panic")
    }

    /// Committed envelopes in `(timestamp, payload)` order
    ///
    /// The order is derived from envelope content alone, so two replicas
    /// holding the same committed set return byte-identical sequences.
    pub async fn query(&self, topic: TopicId, filter: &QueryFilter) -> Vec<Event> {
        let filter = filter.clone();
        self.read_with(|tx| {
            let events_by_time_table = tx.open_table(&events_by_time::TABLE)?;
            let events_table = tx.open_table(&events::TABLE)?;
            Self::query_events_tx(topic, &filter, &events_by_time_table, &events_table)
        })
        .await
        .expect("Database panic")
    }

    pub async fn get_topic_name(&self, topic: TopicId) -> Option<String> {
        self.read_with(|tx| {
            let topics_table = tx.open_table(&topics::TABLE)?;
            Ok(topics_table.get(&topic)?.map(|g| g.value()))
        })
        .await
        .expect("Database panic")
    }

    /// Record a topic name so sync and fetch can resolve the fixed-size
    /// key back to it. Idempotent.
    pub async fn register_topic(&self, name: &str) -> DbResult<TopicId> {
        let topic = TopicId::from_name(name);
        let name = name.to_owned();
        self.write_with(|tx| {
            let mut topics_table = tx.open_table(&topics::TABLE)?;
            topics_table.insert(&topic, &name)?;
            Ok(())
        })
        .await?;
        Ok(topic)
    }

    pub async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = WriteTransactionCtx::from(inner.begin_write().context(TransactionSnafu)?);
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransactionCtx) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    pub async fn read_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::read_with_inner(&self.inner, f).await
    }
}
