use std::collections::BTreeSet;

use snafu::{Snafu, ensure};

use crate::bincode::STD_BINCODE_CONFIG;
use crate::{EventId, ShortEventId, Timestamp, TopicId};

/// An envelope published to a topic
///
/// Envelopes are immutable after construction and content-addressed:
/// [`Event::compute_id`] hashes the canonical encoding of every field,
/// so the same envelope ingested twice is indistinguishable, and any
/// tampering changes the id.
///
/// `parents` are the publisher's head set at publish time, which links
/// envelopes into a per-topic DAG. An empty parent set marks a genesis
/// envelope.
#[derive(::serde::Serialize, ::serde::Deserialize)]
#[derive(::bincode::Encode, ::bincode::Decode)]
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Event {
    /// Simple version counter to allow upgrades of the [`Event`] format
    /// in the future.
    ///
    /// For now should always be `0`. Any newer version should be rejected.
    pub version: u8,

    /// Topic this envelope belongs to; non-empty
    pub topic: String,

    /// Causal parents, sorted by construction
    ///
    /// `BTreeSet` keeps the encoding canonical without a separate
    /// normalization pass.
    pub parents: BTreeSet<ShortEventId>,

    /// Publisher-supplied ordering timestamp
    pub timestamp: Timestamp,

    /// Opaque to the engine
    pub payload: Vec<u8>,
}

#[bon::bon]
impl Event {
    #[builder]
    pub fn new(
        topic: impl Into<String>,
        parents: Option<BTreeSet<ShortEventId>>,
        timestamp: Timestamp,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 0,
            topic: topic.into(),
            parents: parents.unwrap_or_default(),
            timestamp,
            payload,
        }
    }

    pub fn compute_id(&self) -> EventId {
        let encoded =
            bincode::encode_to_vec(self, STD_BINCODE_CONFIG).expect("Can't fail encoding");
        blake3::hash(&encoded).into()
    }

    pub fn topic_id(&self) -> TopicId {
        TopicId::from_name(&self.topic)
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum EventError {
    #[snafu(display("Empty topic"))]
    EmptyTopic,
    #[snafu(display("Unsupported envelope version {version}"))]
    UnsupportedVersion { version: u8 },
    #[snafu(display("Envelope id mismatch: expected {expected}, got {actual}"))]
    IdMismatch {
        expected: ShortEventId,
        actual: ShortEventId,
    },
}
pub type EventResult<T> = std::result::Result<T, EventError>;

/// An [`Event`] together with its verified content id
///
/// The only way to construct one is through verification, so holding a
/// `VerifiedEvent` is proof the id matches the envelope and the envelope
/// passed local sanity checks.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct VerifiedEvent {
    pub event_id: EventId,
    pub event: Event,
}

impl VerifiedEvent {
    /// Verify a locally built or broadcast-received envelope
    pub fn verify(event: Event) -> EventResult<Self> {
        ensure!(!event.topic.is_empty(), EmptyTopicSnafu);
        ensure!(
            event.version == 0,
            UnsupportedVersionSnafu {
                version: event.version
            }
        );

        let event_id = event.compute_id();
        Ok(Self { event_id, event })
    }

    /// Verify an envelope fetched by id from a peer
    ///
    /// A response whose recomputed id differs from the id that was asked
    /// for is rejected wholesale.
    pub fn verify_response(expected: ShortEventId, event: Event) -> EventResult<Self> {
        let verified = Self::verify(event)?;
        let actual = verified.short_id();
        ensure!(actual == expected, IdMismatchSnafu { expected, actual });
        Ok(verified)
    }

    pub fn short_id(&self) -> ShortEventId {
        self.event_id.into()
    }

    pub fn topic_id(&self) -> TopicId {
        self.event.topic_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(topic: &str, payload: &[u8]) -> Event {
        Event::builder()
            .topic(topic)
            .timestamp(Timestamp::from(1))
            .payload(payload.to_vec())
            .build()
    }

    #[test]
    fn id_is_a_pure_function_of_content() {
        let a = event("t", b"hi");
        let b = event("t", b"hi");
        assert_eq!(a.compute_id(), b.compute_id());

        let c = event("t", b"hi!");
        assert_ne!(a.compute_id(), c.compute_id());

        let mut d = event("t", b"hi");
        d.timestamp = Timestamp::from(2);
        assert_ne!(a.compute_id(), d.compute_id());

        let mut e = event("t", b"hi");
        e.parents.insert(a.compute_id().into());
        assert_ne!(a.compute_id(), e.compute_id());
    }

    #[test]
    fn verify_rejects_empty_topic() {
        assert_eq!(
            VerifiedEvent::verify(event("", b"x")),
            Err(EventError::EmptyTopic)
        );
    }

    #[test]
    fn verify_rejects_unknown_version() {
        let mut ev = event("t", b"x");
        ev.version = 1;
        assert_eq!(
            VerifiedEvent::verify(ev),
            Err(EventError::UnsupportedVersion { version: 1 })
        );
    }

    #[test]
    fn verify_response_rejects_wrong_event() {
        let wanted = event("t", b"a").compute_id().into();
        let other = event("t", b"b");

        assert!(matches!(
            VerifiedEvent::verify_response(wanted, other),
            Err(EventError::IdMismatch { .. })
        ));

        let matching = event("t", b"a");
        assert!(VerifiedEvent::verify_response(wanted, matching).is_ok());
    }
}
