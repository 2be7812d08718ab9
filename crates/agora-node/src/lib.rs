//! A replicating message-mesh node
//!
//! One [`Node`] holds any number of topics. Each topic is an independent
//! conflict-free replicated set of envelopes: publishes link to the
//! current head set, peers exchange envelopes over the transport, and
//! missing causal parents are repaired by fetching them by id. All
//! mutation of one topic flows through a single actor task, which is the
//! topic's entire concurrency story.

mod node;
mod request_handler;
mod task;
mod topic_loop;

use std::marker::PhantomData;
use std::ops;
use std::sync::{Arc, Weak};

use agora_store::DbError;
use snafu::Snafu;

pub use self::node::{Clock, Node};
pub use self::task::missing_event_fetcher::{PeerPicker, RandomPeerPicker};

const LOG_TARGET: &str = "agora::node";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
    #[snafu(display("Store initialization error"))]
    InitStore { source: DbError },
}
pub type InitResult<T> = std::result::Result<T, InitError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TopicError {
    #[snafu(display("Empty topic name"))]
    InvalidTopic,
    #[snafu(display("Topic is shut down or faulted"))]
    TopicUnavailable,
    #[snafu(display("Store error"))]
    Store { source: DbError },
}
pub type TopicResult<T> = std::result::Result<T, TopicError>;

/// Weak handle to [`Node`]
///
/// Long-lived tasks hold one of these instead of a strong reference, so
/// that dropping the node shuts them down.
#[derive(Debug, Clone)]
pub struct NodeHandle(Weak<Node>);

impl NodeHandle {
    pub fn node_ref(&self) -> Option<NodeRef<'_>> {
        let node = self.0.upgrade()?;
        Some(NodeRef {
            node,
            r: PhantomData,
        })
    }
}

impl From<Weak<Node>> for NodeHandle {
    fn from(value: Weak<Node>) -> Self {
        Self(value)
    }
}

/// A strong reference to [`Node`]
///
/// It contains a phantom reference, to avoid attempts of
/// storing it anywhere.
pub struct NodeRef<'r> {
    pub(crate) node: Arc<Node>,
    pub(crate) r: PhantomData<&'r ()>,
}

impl ops::Deref for NodeRef<'_> {
    type Target = Node;

    fn deref(&self) -> &Self::Target {
        &self.node
    }
}
