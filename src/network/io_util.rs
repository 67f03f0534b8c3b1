//! Non-blocking read/write helpers over any `Read`/`Write`.
//!
//! Sockets are edge-triggered, so a readable socket is drained until it reports
//! `WouldBlock`, and a write keeps going until the stream is empty or the socket
//! stops accepting bytes.
use std::io::{self, Read, Write};

use crate::protocol::{self, FrameError, MessageStream, ProtocolMessage};

/// Size of the stack buffer each `read` call fills.
pub const RECV_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The socket reported `WouldBlock`; wait for the next readable event.
    Drained,
    /// The per-call limit was hit; more bytes may be waiting.
    Pending,
    /// The peer closed its side.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub received: usize,
    pub status: ReadStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub sent: usize,
    /// The writer returned `WouldBlock` with bytes still queued.
    pub blocked: bool,
}

/// Appends everything `reader` has to offer to `stream`, up to roughly `limit` bytes.
pub fn fill_from<R: Read>(
    stream: &mut MessageStream,
    reader: &mut R,
    limit: usize,
) -> io::Result<ReadOutcome> {
    let mut buf = [0u8; RECV_BUFFER_SIZE];
    let mut received = 0;

    loop {
        if received >= limit {
            return Ok(ReadOutcome {
                received,
                status: ReadStatus::Pending,
            });
        }
        match reader.read(&mut buf) {
            Ok(0) => {
                return Ok(ReadOutcome {
                    received,
                    status: ReadStatus::Closed,
                });
            }
            Ok(n) => {
                stream.write_bytes(&buf[..n]);
                received += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadOutcome {
                    received,
                    status: ReadStatus::Drained,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Writes as much of `stream` as `writer` accepts. Sent bytes are skipped and
/// trimmed, the rest stays queued.
pub fn drain_into<W: Write>(
    stream: &mut MessageStream,
    writer: &mut W,
) -> io::Result<WriteOutcome> {
    let mut sent = 0;
    let result = loop {
        if stream.is_empty() {
            break Ok(false);
        }
        match writer.write(stream.as_slice()) {
            Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                stream.skip(n);
                sent += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(true),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };
    stream.trim();
    result.map(|blocked| WriteOutcome { sent, blocked })
}

/// Extracts every complete frame buffered in `stream`.
///
/// Stops at the first framing error; frames decoded before it are still
/// returned.
pub fn read_frames(
    stream: &mut MessageStream,
    max_payload: u32,
) -> (Vec<ProtocolMessage>, Option<FrameError>) {
    let mut messages = Vec::new();
    let mut failure = None;

    loop {
        match protocol::check_frame(stream, max_payload) {
            Ok(true) => match protocol::create(stream) {
                Ok(msg) => messages.push(msg),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            },
            Ok(false) => break,
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }
    stream.trim();
    (messages, failure)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::protocol::{InitSession, PROTOCOL_VERSION};

    /// Hands out one chunk per `read`, then `WouldBlock`.
    struct ChunkedReader {
        chunks: VecDeque<Vec<u8>>,
        closed: bool,
    }

    impl Read for ChunkedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.closed => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    /// Accepts at most `budget` bytes, then `WouldBlock`.
    struct PartialWriter {
        written: Vec<u8>,
        budget: usize,
    }

    impl Write for PartialWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            self.written.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn init_frame() -> Vec<u8> {
        ProtocolMessage::InitSession(InitSession {
            protocol_version: PROTOCOL_VERSION,
            app_version: "0.1.0".to_string(),
            username: "bob".to_string(),
            password: String::new(),
        })
        .encode()
        .unwrap()
        .as_slice()
        .to_vec()
    }

    #[test]
    fn frame_split_across_two_reads() {
        let frame = init_frame();
        let mut reader = ChunkedReader {
            chunks: VecDeque::from(vec![frame[..4].to_vec()]),
            closed: false,
        };
        let mut stream = MessageStream::new();

        let outcome = fill_from(&mut stream, &mut reader, usize::MAX).unwrap();
        assert_eq!(outcome.status, ReadStatus::Drained);
        assert_eq!(outcome.received, 4);
        assert!(!protocol::is_new_message_available(&stream));
        let (messages, failure) = read_frames(&mut stream, u32::MAX);
        assert!(messages.is_empty());
        assert!(failure.is_none());

        reader.chunks.push_back(frame[4..].to_vec());
        fill_from(&mut stream, &mut reader, usize::MAX).unwrap();
        assert!(protocol::is_new_message_available(&stream));
        let (messages, failure) = read_frames(&mut stream, u32::MAX);
        assert_eq!(messages.len(), 1);
        assert!(failure.is_none());
        assert!(stream.is_empty());
    }

    #[test]
    fn read_reports_peer_close() {
        let mut reader = ChunkedReader {
            chunks: VecDeque::from(vec![vec![1, 2, 3]]),
            closed: true,
        };
        let mut stream = MessageStream::new();

        let outcome = fill_from(&mut stream, &mut reader, usize::MAX).unwrap();

        assert_eq!(outcome.status, ReadStatus::Closed);
        assert_eq!(stream.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn read_limit_leaves_rest_pending() {
        let mut reader = ChunkedReader {
            chunks: VecDeque::from(vec![vec![0; 8], vec![0; 8]]),
            closed: false,
        };
        let mut stream = MessageStream::new();

        let outcome = fill_from(&mut stream, &mut reader, 8).unwrap();

        assert_eq!(outcome.status, ReadStatus::Pending);
        assert_eq!(stream.len(), 8);
    }

    #[test]
    fn partial_send_keeps_remainder() {
        let frame = init_frame();
        let mut stream = MessageStream::from(frame.clone());
        let mut writer = PartialWriter {
            written: Vec::new(),
            budget: 7,
        };

        let outcome = drain_into(&mut stream, &mut writer).unwrap();
        assert_eq!(outcome, WriteOutcome { sent: 7, blocked: true });
        assert_eq!(stream.as_slice(), &frame[7..]);
        assert_eq!(stream.pos(), 0);

        writer.budget = usize::MAX;
        let outcome = drain_into(&mut stream, &mut writer).unwrap();
        assert_eq!(outcome.sent, frame.len() - 7);
        assert!(!outcome.blocked);
        assert!(stream.is_empty());
        assert_eq!(writer.written, frame);
    }

    #[test]
    fn frames_before_garbage_are_kept() {
        let mut stream = MessageStream::new();
        ProtocolMessage::Ping.write_back(&mut stream).unwrap();
        stream.write_u32(0);
        stream.write_u8(0xFE);
        ProtocolMessage::Ping.write_back(&mut stream).unwrap();

        let (messages, failure) = read_frames(&mut stream, u32::MAX);

        assert_eq!(messages, vec![ProtocolMessage::Ping]);
        assert_eq!(failure, Some(FrameError::UnknownMessage(0xFE)));
    }

    #[test]
    fn oversized_frame_fails_early() {
        let mut stream = MessageStream::new();
        stream.write_u32(1 << 20);
        stream.write_u8(protocol::ids::SCENE_STATE);

        let (messages, failure) = read_frames(&mut stream, 1024);

        assert!(messages.is_empty());
        assert!(matches!(failure, Some(FrameError::TooLarge { .. })));
    }
}
