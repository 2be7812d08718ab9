//! Database table definitions for the topic store.
//!
//! # Data Model Overview
//!
//! The store holds the local view of each topic's envelope DAG. An
//! envelope references its causal parents by [`ShortEventId`]; an
//! envelope whose parents are all committed is itself committed and
//! visible to queries, otherwise it sits in [`events_pending`] until the
//! last missing parent arrives.
//!
//! ## Key Concepts
//!
//! - **Committed event**: present in [`events`], indexed in
//!   [`events_by_time`], participates in [`events_heads`].
//! - **Pending event**: present in [`events_pending`] with its
//!   still-missing parent set. Retrievable by id (peers may fetch it),
//!   excluded from queries and heads.
//! - **Missing link**: a `(topic, missing_parent, waiter)` entry in
//!   [`events_missing`]; the fetch planner walks these to decide what to
//!   ask peers for, and the commit cascade walks them to resolve waiters
//!   when a parent lands.
//! - **Head**: a committed event no other committed event names as a
//!   parent; the parent set of the next local publish.

use agora_core::event::Event;
use agora_core::{ShortEventId, Timestamp, TopicId};
use bincode::{Decode, Encode};

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// Tracks database/schema version for migrations.
    db_version: () => u64
}

def_table! {
    /// Reverse lookup from the fixed-size topic key to the topic name.
    topics: TopicId => String
}

def_table! {
    /// All committed envelopes, the authoritative event set per topic.
    events: (TopicId, ShortEventId) => EventRecord
}

def_table! {
    /// Envelopes whose parent closure is not complete yet.
    events_pending: (TopicId, ShortEventId) => PendingEventRecord
}

def_table! {
    /// `(topic, missing_parent, waiter)` multimap driving sync repair.
    events_missing: (TopicId, ShortEventId, ShortEventId) => ()
}

def_table! {
    /// Current head set per topic.
    events_heads: (TopicId, ShortEventId) => EventsHeadsTableRecord
}

def_table! {
    /// Query index: committed envelopes by timestamp.
    events_by_time: (TopicId, Timestamp, ShortEventId) => ()
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct EventRecord {
    pub event: Event,
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct PendingEventRecord {
    pub event: Event,
    /// Parents still absent from [`events`]
    pub missing: std::collections::BTreeSet<ShortEventId>,
    /// Reception order, used to evict the oldest entry when the pending
    /// set hits its cap.
    pub order: u64,
}

#[derive(Debug, Encode, Decode, Clone, Copy)]
pub struct EventsHeadsTableRecord;
