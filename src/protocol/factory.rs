//! Frame detection and typed message construction.
//!
//! [`is_new_message_available`] must confirm that a full frame is buffered before
//! [`create`] is called. Partial frames are never parsed.
use thiserror::Error;

use super::{
    message::{HEADER_SIZE, ProtocolId, ProtocolMessage},
    stream::{MessageStream, StreamError},
};

/// Default upper bound for a single frame payload.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 32 * 1024 * 1024;

/// Framing failures. All of them leave the stream desynchronized, so the
/// connection that produced the bytes can no longer be trusted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("no complete frame is buffered")]
    Incomplete,

    #[error("unknown message id {0}")]
    UnknownMessage(ProtocolId),

    #[error("frame payload of {len} bytes exceeds the maximum of {max}")]
    TooLarge { len: u32, max: u32 },

    #[error("malformed payload for message id {id}: {source}")]
    Malformed {
        id: ProtocolId,
        #[source]
        source: StreamError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub id: ProtocolId,
}

impl FrameHeader {
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize
    }
}

/// Reads the frame header at the cursor without consuming it.
pub fn peek_header(stream: &MessageStream) -> Option<FrameHeader> {
    Some(FrameHeader {
        payload_len: stream.peek_u32(0)?,
        id: stream.peek_u8(4)?,
    })
}

/// Whether one complete frame (header + payload) is buffered at the cursor.
pub fn is_new_message_available(stream: &MessageStream) -> bool {
    match peek_header(stream) {
        Some(header) => stream.len() >= header.frame_len(),
        None => false,
    }
}

/// Like [`is_new_message_available`], but rejects a frame as soon as its header
/// announces a payload over `max_payload`, before the payload is buffered.
pub fn check_frame(stream: &MessageStream, max_payload: u32) -> Result<bool, FrameError> {
    let Some(header) = peek_header(stream) else {
        return Ok(false);
    };
    if header.payload_len > max_payload {
        return Err(FrameError::TooLarge {
            len: header.payload_len,
            max: max_payload,
        });
    }
    Ok(stream.len() >= header.frame_len())
}

/// Consumes exactly one frame from `stream` and builds the typed message.
///
/// Payload bytes the decoder does not understand are skipped so the stream stays
/// aligned on the next frame.
pub fn create(stream: &mut MessageStream) -> Result<ProtocolMessage, FrameError> {
    if !is_new_message_available(stream) {
        return Err(FrameError::Incomplete);
    }
    let header = peek_header(stream).ok_or(FrameError::Incomplete)?;
    stream.skip(HEADER_SIZE);

    let bytes = stream
        .read_bytes(header.payload_len as usize)
        .map_err(|source| FrameError::Malformed {
            id: header.id,
            source,
        })?;
    let mut payload = MessageStream::from(bytes);

    match ProtocolMessage::decode(header.id, &mut payload) {
        Ok(Some(msg)) => {
            if !payload.is_empty() {
                log::trace!(
                    "ignoring {} trailing bytes of message {}",
                    payload.len(),
                    msg.name()
                );
            }
            Ok(msg)
        }
        Ok(None) => Err(FrameError::UnknownMessage(header.id)),
        Err(source) => Err(FrameError::Malformed {
            id: header.id,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{InitSession, PROTOCOL_VERSION, ids};

    fn init_session() -> ProtocolMessage {
        ProtocolMessage::InitSession(InitSession {
            protocol_version: PROTOCOL_VERSION,
            app_version: "0.1.0".to_string(),
            username: "alice".to_string(),
            password: "secret".to_string(),
        })
    }

    #[test]
    fn availability_boundary_is_exact_frame_size() {
        let frame = init_session().encode().unwrap();
        let bytes = frame.as_slice();

        for cut in 0..bytes.len() {
            let stream = MessageStream::from(&bytes[..cut]);
            assert!(!is_new_message_available(&stream), "cut at {cut}");
        }

        let stream = MessageStream::from(bytes);
        assert!(is_new_message_available(&stream));
    }

    #[test]
    fn frame_split_after_length_prefix() {
        let frame = init_session().encode().unwrap();
        let bytes = frame.as_slice();
        let mut stream = MessageStream::new();

        stream.write_bytes(&bytes[..4]);
        assert!(!is_new_message_available(&stream));

        stream.write_bytes(&bytes[4..]);
        assert!(is_new_message_available(&stream));
        assert_eq!(create(&mut stream).unwrap(), init_session());
        assert!(stream.is_empty());
    }

    #[test]
    fn create_consumes_one_frame_at_a_time() {
        let mut stream = MessageStream::new();
        ProtocolMessage::Ping.write_back(&mut stream).unwrap();
        init_session().write_back(&mut stream).unwrap();

        assert_eq!(create(&mut stream).unwrap(), ProtocolMessage::Ping);
        assert!(is_new_message_available(&stream));
        assert_eq!(create(&mut stream).unwrap(), init_session());
        assert!(!is_new_message_available(&stream));
    }

    #[test]
    fn unknown_id_is_rejected() {
        let mut stream = MessageStream::new();
        stream.write_u32(2);
        stream.write_u8(0xEE);
        stream.write_bytes(&[1, 2]);

        assert_eq!(create(&mut stream), Err(FrameError::UnknownMessage(0xEE)));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut stream = MessageStream::new();
        stream.write_u32(3);
        stream.write_u8(ids::NODE_REMOVED);
        stream.write_u16(40);
        stream.write_u8(b'x');

        assert!(matches!(
            create(&mut stream),
            Err(FrameError::Malformed {
                id: ids::NODE_REMOVED,
                ..
            })
        ));
        assert!(stream.is_empty());
    }

    #[test]
    fn trailing_payload_bytes_are_skipped() {
        let mut stream = MessageStream::new();
        stream.write_u32(3);
        stream.write_u8(ids::PING);
        stream.write_bytes(&[7, 7, 7]);
        ProtocolMessage::SceneStateRequest
            .write_back(&mut stream)
            .unwrap();

        assert_eq!(create(&mut stream).unwrap(), ProtocolMessage::Ping);
        assert_eq!(
            create(&mut stream).unwrap(),
            ProtocolMessage::SceneStateRequest
        );
    }

    #[test]
    fn incomplete_create_fails_without_consuming() {
        let mut stream = MessageStream::from(vec![10, 0, 0, 0, ids::PING]);

        assert_eq!(create(&mut stream), Err(FrameError::Incomplete));
        assert_eq!(stream.len(), 5);
    }

    #[test]
    fn oversized_header_rejected_before_payload() {
        let mut stream = MessageStream::new();
        stream.write_u32(1024);
        stream.write_u8(ids::SCENE_STATE);

        assert_eq!(check_frame(&stream, 4096), Ok(false));
        assert_eq!(
            check_frame(&stream, 512),
            Err(FrameError::TooLarge {
                len: 1024,
                max: 512
            })
        );
    }
}
