use std::net::SocketAddr;

use mio::{Token, net::TcpStream};
use slotmap::new_key_type;

use super::{
    DisconnectReason,
    io_util::{self, ReadStatus},
};
use crate::protocol::{MessageStream, ProtocolMessage};

/// Upper bound of bytes pulled from one socket per tick, so a single busy
/// connection cannot starve the others.
const READ_LIMIT_PER_TICK: usize = 4 * 1024 * 1024;

new_key_type! {
    /// Handle of a connected peer. A handle is never reused: once the peer is
    /// gone, lookups with its old id fail.
    pub struct ClientId;
}

/// Frames decoded during one receive pass.
#[derive(Debug, Default)]
pub(crate) struct Inbound {
    pub messages: Vec<ProtocolMessage>,
    pub failure: Option<DisconnectReason>,
}

impl Inbound {
    fn fail(&mut self, reason: DisconnectReason) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }
}

/// One live connection: the socket plus its inbound and outbound byte streams.
#[derive(Debug)]
pub struct RemoteClient {
    pub(crate) socket: TcpStream,
    pub(crate) token: Token,
    addr: SocketAddr,
    inbound: MessageStream,
    outbound: MessageStream,
    bytes_in: u64,
    bytes_out: u64,
    last_activity: f64,
    pub(crate) last_ping_time: f64,
    readable: bool,
    write_blocked: bool,
}

impl RemoteClient {
    pub(crate) fn new(socket: TcpStream, token: Token, addr: SocketAddr, now_seconds: f64) -> Self {
        Self {
            socket,
            token,
            addr,
            inbound: MessageStream::new(),
            outbound: MessageStream::new(),
            bytes_in: 0,
            bytes_out: 0,
            last_activity: now_seconds,
            last_ping_time: now_seconds,
            // Data may already be waiting before the first readiness event.
            readable: true,
            write_blocked: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Time (in the caller's clock) of the last received byte.
    pub fn last_activity(&self) -> f64 {
        self.last_activity
    }

    pub fn last_ping_time(&self) -> f64 {
        self.last_ping_time
    }

    /// Received bytes that do not form a complete frame yet.
    pub fn inbound(&self) -> &MessageStream {
        &self.inbound
    }

    /// Encoded frames waiting to be written to the socket.
    pub fn outbound(&self) -> &MessageStream {
        &self.outbound
    }

    pub(crate) fn enqueue(&mut self, frame: &MessageStream) {
        self.outbound.write_stream(frame);
    }

    pub(crate) fn set_readiness(&mut self, readable: bool, writable: bool) {
        if readable {
            self.readable = true;
        }
        if writable {
            self.write_blocked = false;
        }
    }

    /// Pulls pending bytes off the socket and decodes every complete frame.
    pub(crate) fn receive(&mut self, now_seconds: f64, max_payload: u32) -> Inbound {
        let mut inbound = Inbound::default();

        if self.readable {
            match io_util::fill_from(&mut self.inbound, &mut self.socket, READ_LIMIT_PER_TICK) {
                Ok(outcome) => {
                    if outcome.received > 0 {
                        self.bytes_in += outcome.received as u64;
                        self.last_activity = now_seconds;
                    }
                    match outcome.status {
                        ReadStatus::Drained => self.readable = false,
                        ReadStatus::Pending => {}
                        ReadStatus::Closed => inbound.fail(DisconnectReason::PeerClosed),
                    }
                }
                Err(err) => inbound.fail(DisconnectReason::Io(err)),
            }
        }

        let (messages, failure) = io_util::read_frames(&mut self.inbound, max_payload);
        inbound.messages = messages;
        if let Some(err) = failure {
            inbound.fail(DisconnectReason::Frame(err));
        }
        inbound
    }

    /// Writes queued bytes until the socket would block.
    pub(crate) fn flush(&mut self) -> Result<usize, DisconnectReason> {
        if self.write_blocked || self.outbound.is_empty() {
            return Ok(0);
        }
        let outcome = io_util::drain_into(&mut self.outbound, &mut self.socket)?;
        self.bytes_out += outcome.sent as u64;
        self.write_blocked = outcome.blocked;
        Ok(outcome.sent)
    }
}
