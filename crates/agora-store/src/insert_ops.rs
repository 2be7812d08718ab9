use std::collections::{BTreeSet, VecDeque};

use agora_core::event::VerifiedEvent;
use agora_core::{ShortEventId, TopicId};
use tracing::{debug, info, warn};

use crate::{
    Database, DbResult, EventRecord, EventsHeadsTableRecord, InsertEventOutcome, LOG_TARGET,
    PendingEventRecord, WriteTransactionCtx, events, events_by_time, events_heads, events_missing,
    events_pending, topics,
};

impl Database {
    /// Insert an envelope and schedule the observable side effects
    /// (commit stream, missing-topic wakeups) to fire once the
    /// transaction lands.
    pub(crate) fn insert_event_notifying_tx(
        &self,
        event: &VerifiedEvent,
        tx: &WriteTransactionCtx,
    ) -> DbResult<InsertEventOutcome> {
        let mut topics_table = tx.open_table(&topics::TABLE)?;
        let mut events_table = tx.open_table(&events::TABLE)?;
        let mut events_pending_table = tx.open_table(&events_pending::TABLE)?;
        let mut events_missing_table = tx.open_table(&events_missing::TABLE)?;
        let mut events_heads_table = tx.open_table(&events_heads::TABLE)?;
        let mut events_by_time_table = tx.open_table(&events_by_time::TABLE)?;

        let outcome = Database::insert_event_tx(
            event,
            self.next_reception_order(),
            &mut topics_table,
            &mut events_table,
            &mut events_pending_table,
            &mut events_missing_table,
            &mut events_heads_table,
            &mut events_by_time_table,
        )?;

        let topic = event.topic_id();
        match &outcome {
            InsertEventOutcome::AlreadyPresent => {}
            InsertEventOutcome::Committed { cascade } => {
                info!(target: LOG_TARGET,
                    event_id = %event.short_id(),
                    topic = %event.event.topic,
                    cascade_len = cascade.len(),
                    "New event committed"
                );
                let sender = self.new_commits_tx.clone();
                let cascade = cascade.clone();
                tx.on_commit(move || {
                    for committed in cascade {
                        let _ = sender.send((topic, committed));
                    }
                });
            }
            InsertEventOutcome::Pending { missing } => {
                debug!(target: LOG_TARGET,
                    event_id = %event.short_id(),
                    topic = %event.event.topic,
                    missing_len = missing.len(),
                    "Event pending on missing parents"
                );
                let missing_tx = self.topics_with_missing_tx.clone();
                tx.on_commit(move || {
                    missing_tx.send(topic);
                });
            }
        }

        Ok(outcome)
    }

    /// Insert an envelope and perform all DAG accounting.
    ///
    /// If every parent is committed, the envelope commits: it lands in
    /// `events` and the time index, the heads set is adjusted (named
    /// parents out, the new envelope in), and the missing-link index is
    /// walked to commit, iteratively, every formerly-pending envelope
    /// whose missing set just became empty.
    ///
    /// Otherwise the envelope is recorded as pending together with its
    /// missing parent set.
    ///
    /// Idempotent: an id that is already committed or pending is a no-op
    /// returning [`InsertEventOutcome::AlreadyPresent`].
    #[allow(clippy::too_many_arguments)]
    pub fn insert_event_tx(
        event: &VerifiedEvent,
        reception_order: u64,
        topics_table: &mut topics::Table,
        events_table: &mut events::Table,
        events_pending_table: &mut events_pending::Table,
        events_missing_table: &mut events_missing::Table,
        events_heads_table: &mut events_heads::Table,
        events_by_time_table: &mut events_by_time::Table,
    ) -> DbResult<InsertEventOutcome> {
        let topic = event.topic_id();
        let event_id = event.short_id();

        if events_table.get(&(topic, event_id))?.is_some()
            || events_pending_table.get(&(topic, event_id))?.is_some()
        {
            return Ok(InsertEventOutcome::AlreadyPresent);
        }

        topics_table.insert(&topic, &event.event.topic)?;

        let mut missing = BTreeSet::new();
        for parent in &event.event.parents {
            if events_table.get(&(topic, *parent))?.is_none() {
                missing.insert(*parent);
            }
        }

        if !missing.is_empty() {
            Self::evict_pending_overflow_tx(topic, events_pending_table, events_missing_table)?;

            for missing_parent in &missing {
                events_missing_table.insert(&(topic, *missing_parent, event_id), &())?;
            }
            events_pending_table.insert(
                &(topic, event_id),
                &PendingEventRecord {
                    event: event.event.clone(),
                    missing: missing.clone(),
                    order: reception_order,
                },
            )?;
            return Ok(InsertEventOutcome::Pending { missing });
        }

        // Commit, then keep committing every waiter the new envelope (or a
        // cascaded one) unblocks. Iterative on purpose: the cascade depth
        // is bounded by the pending set, not the stack.
        let mut cascade = vec![];
        let mut queue = VecDeque::from([(event_id, event.event.clone())]);

        while let Some((id, ev)) = queue.pop_front() {
            events_table.insert(&(topic, id), &EventRecord { event: ev.clone() })?;
            events_by_time_table.insert(&(topic, ev.timestamp, id), &())?;

            for parent in &ev.parents {
                events_heads_table.remove(&(topic, *parent))?;
            }
            events_heads_table.insert(&(topic, id), &EventsHeadsTableRecord)?;

            let waiters: Vec<ShortEventId> = events_missing_table
                .range((topic, id, ShortEventId::ZERO)..=(topic, id, ShortEventId::MAX))?
                .map(|res| res.map(|(k, _)| k.value().2))
                .collect::<Result<_, _>>()?;

            for waiter in waiters {
                events_missing_table.remove(&(topic, id, waiter))?;

                let Some(mut pending) = events_pending_table
                    .get(&(topic, waiter))?
                    .map(|g| g.value())
                else {
                    continue;
                };
                pending.missing.remove(&id);

                if pending.missing.is_empty() {
                    events_pending_table.remove(&(topic, waiter))?;
                    queue.push_back((waiter, pending.event));
                } else {
                    events_pending_table.insert(&(topic, waiter), &pending)?;
                }
            }

            cascade.push(ev);
        }

        Ok(InsertEventOutcome::Committed { cascade })
    }

    /// Keep the pending set under [`Database::MAX_PENDING_PER_TOPIC`] by
    /// dropping the oldest entry. A dropped envelope is re-fetchable the
    /// next time a successor names it.
    fn evict_pending_overflow_tx(
        topic: TopicId,
        events_pending_table: &mut events_pending::Table,
        events_missing_table: &mut events_missing::Table,
    ) -> DbResult<()> {
        let mut count = 0;
        let mut oldest: Option<(u64, ShortEventId, BTreeSet<ShortEventId>)> = None;

        for res in events_pending_table
            .range((topic, ShortEventId::ZERO)..=(topic, ShortEventId::MAX))?
        {
            let (k, v) = res?;
            let id = k.value().1;
            let record = v.value();
            count += 1;
            if oldest
                .as_ref()
                .is_none_or(|(order, _, _)| record.order < *order)
            {
                oldest = Some((record.order, id, record.missing));
            }
        }

        if Self::MAX_PENDING_PER_TOPIC <= count {
            if let Some((_, id, missing)) = oldest {
                warn!(target: LOG_TARGET,
                    event_id = %id,
                    topic = %topic,
                    "Pending set full, evicting oldest entry"
                );
                events_pending_table.remove(&(topic, id))?;
                for missing_parent in missing {
                    events_missing_table.remove(&(topic, missing_parent, id))?;
                }
            }
        }

        Ok(())
    }
}
