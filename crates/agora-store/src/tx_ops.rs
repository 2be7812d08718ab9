use agora_core::event::Event;
use agora_core::{ShortEventId, Timestamp, TopicId};
use itertools::Itertools as _;

use crate::{
    Database, DbResult, QueryFilter, events, events_by_time, events_heads, events_missing,
    events_pending,
};

impl Database {
    pub fn has_event_tx(
        topic: TopicId,
        event_id: ShortEventId,
        events_table: &impl events::ReadableTable,
        events_pending_table: &impl events_pending::ReadableTable,
    ) -> DbResult<bool> {
        Ok(events_table.get(&(topic, event_id))?.is_some()
            || events_pending_table.get(&(topic, event_id))?.is_some())
    }

    pub fn get_event_tx(
        topic: TopicId,
        event_id: ShortEventId,
        events_table: &impl events::ReadableTable,
        events_pending_table: &impl events_pending::ReadableTable,
    ) -> DbResult<Option<Event>> {
        if let Some(record) = events_table.get(&(topic, event_id))? {
            return Ok(Some(record.value().event));
        }
        Ok(events_pending_table
            .get(&(topic, event_id))?
            .map(|g| g.value().event))
    }

    pub fn get_heads_tx(
        topic: TopicId,
        events_heads_table: &impl events_heads::ReadableTable,
    ) -> DbResult<Vec<ShortEventId>> {
        Ok(events_heads_table
            .range((topic, ShortEventId::ZERO)..=(topic, ShortEventId::MAX))?
            .map_ok(|(k, _)| k.value().1)
            .collect::<Result<_, _>>()?)
    }

    pub fn get_missing_events_tx(
        topic: TopicId,
        events_missing_table: &impl events_missing::ReadableTable,
        events_pending_table: &impl events_pending::ReadableTable,
    ) -> DbResult<Vec<ShortEventId>> {
        let referenced: Vec<ShortEventId> = events_missing_table
            .range(
                (topic, ShortEventId::ZERO, ShortEventId::ZERO)
                    ..=(topic, ShortEventId::MAX, ShortEventId::MAX),
            )?
            .map_ok(|(k, _)| k.value().1)
            .collect::<Result<_, _>>()?;

        // The index also lists parents whose bytes are already here but
        // pending themselves; those need no fetch of their own.
        let mut missing = Vec::with_capacity(referenced.len());
        for id in referenced.into_iter().dedup() {
            if events_pending_table.get(&(topic, id))?.is_none() {
                missing.push(id);
            }
        }
        Ok(missing)
    }

    /// Ordered query over committed envelopes.
    ///
    /// The `events_by_time` index yields timestamp order; runs of equal
    /// timestamps are sorted by `(payload, id)` so the result is a total
    /// order derived from envelope content alone.
    pub fn query_events_tx(
        topic: TopicId,
        filter: &QueryFilter,
        events_by_time_table: &impl events_by_time::ReadableTable,
        events_table: &impl events::ReadableTable,
    ) -> DbResult<Vec<Event>> {
        let since = filter.since.unwrap_or(Timestamp::ZERO);
        let until = filter.until.unwrap_or(Timestamp::MAX);

        let mut ordered: Vec<(ShortEventId, Event)> = vec![];
        let mut run_start = 0;
        let mut run_ts: Option<Timestamp> = None;

        for res in events_by_time_table
            .range((topic, since, ShortEventId::ZERO)..=(topic, until, ShortEventId::MAX))?
        {
            let (k, _) = res?;
            let (_, timestamp, event_id) = k.value();

            let Some(record) = events_table.get(&(topic, event_id))? else {
                // Index entries are written in the same transaction as the
                // event record, so this cannot happen.
                continue;
            };

            if run_ts != Some(timestamp) {
                Self::sort_equal_timestamp_run(&mut ordered[run_start..]);
                run_start = ordered.len();
                run_ts = Some(timestamp);
            }
            ordered.push((event_id, record.value().event));
        }
        Self::sort_equal_timestamp_run(&mut ordered[run_start..]);

        if let Some(limit) = filter.limit {
            ordered.truncate(limit);
        }

        Ok(ordered.into_iter().map(|(_, event)| event).collect())
    }

    fn sort_equal_timestamp_run(run: &mut [(ShortEventId, Event)]) {
        run.sort_unstable_by(|(a_id, a), (b_id, b)| {
            a.payload.cmp(&b.payload).then(a_id.cmp(b_id))
        });
    }

    pub(crate) fn max_pending_order_tx(
        events_pending_table: &impl events_pending::ReadableTable,
    ) -> DbResult<Option<u64>> {
        Ok(events_pending_table
            .range(
                (TopicId::ZERO, ShortEventId::ZERO)..=(TopicId::MAX, ShortEventId::MAX),
            )?
            .map_ok(|(_, v)| v.value().order)
            .process_results(|iter| iter.max())?)
    }
}
