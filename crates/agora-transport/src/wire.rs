use agora_core::ShortEventId;
use agora_core::bincode::STD_BINCODE_CONFIG;
use agora_core::event::Event;
use bincode::{Decode, Encode};
use convi::CastInto as _;
use snafu::{ResultExt as _, ensure};

use crate::{FrameDecodingSnafu, FrameTooLargeSnafu, TransportResult};

/// Max frame size
///
/// Frames carry whole envelopes, so the cap is generous; anything larger
/// is rejected before decoding is attempted.
pub const MAX_FRAME_SIZE: u32 = 32 * 1024 * 1024;

#[derive(Encode, Decode, Debug, Clone)]
pub enum Frame {
    /// Push of a committed envelope to a topic's peers
    Event(Event),
    /// Request for envelopes by id
    Fetch {
        topic: String,
        event_ids: Vec<ShortEventId>,
    },
    /// Response to [`Frame::Fetch`]
    Events(Vec<Event>),
}

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    bincode::encode_to_vec(frame, STD_BINCODE_CONFIG).expect("Can't fail encoding")
}

pub fn decode_frame(bytes: &[u8]) -> TransportResult<Frame> {
    let max: usize = MAX_FRAME_SIZE.cast_into();
    ensure!(bytes.len() <= max, FrameTooLargeSnafu { len: bytes.len() });

    Ok(bincode::decode_from_slice(bytes, STD_BINCODE_CONFIG)
        .context(FrameDecodingSnafu)?
        .0)
}

#[cfg(test)]
mod tests {
    use agora_core::Timestamp;

    use super::*;

    #[test]
    fn frame_roundtrip() {
        let event = Event::builder()
            .topic("t")
            .timestamp(Timestamp::from(1))
            .payload(b"hello".to_vec())
            .build();

        let frame = Frame::Fetch {
            topic: "t".into(),
            event_ids: vec![event.compute_id().into()],
        };

        let decoded = decode_frame(&encode_frame(&frame)).expect("Valid frame");
        let Frame::Fetch { topic, event_ids } = decoded else {
            panic!("Wrong frame kind");
        };
        assert_eq!(topic, "t");
        assert_eq!(event_ids, vec![event.compute_id().into()]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_frame(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
