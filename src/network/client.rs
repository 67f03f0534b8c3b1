//! Client side event loop: one connection to a server.
//!
//! The connection is opened without blocking. Until the socket reports
//! writable the state is [`ConnectionState::Connecting`]; messages sent in the
//! meantime are queued and go out once the connection is established.
use std::{
    io,
    net::{Shutdown, ToSocketAddrs},
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use mio::{Events, Interest, Poll, Token, net::TcpStream};

use super::{ClientId, DisconnectReason, NetworkError, NetworkListener, RemoteClient};
use crate::{
    config::ClientConfig,
    protocol::{ProtocolHandlerRegistry, ProtocolMessage},
};

const SERVER: Token = Token(0);
const EVENTS_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

enum ConnectProgress {
    Pending,
    Established,
    Failed(io::Error),
}

pub struct ClientNetwork {
    ping_interval: f64,
    max_frame_size: u32,
    poll: Poll,
    events: Events,
    server: Option<RemoteClient>,
    state: ConnectionState,
    pending_disconnect: bool,
    listeners: Vec<Box<dyn NetworkListener>>,
    last_update: Option<f64>,
    now: f64,
    ping_seconds: f64,
}

impl ClientNetwork {
    pub fn new(config: &ClientConfig) -> Result<Self, NetworkError> {
        Ok(Self {
            ping_interval: config.ping_interval,
            max_frame_size: config.max_frame_size,
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            server: None,
            state: ConnectionState::Disconnected,
            pending_disconnect: false,
            listeners: Vec::new(),
            last_update: None,
            now: 0.0,
            ping_seconds: 0.0,
        })
    }

    /// Starts connecting to `host:port`. An existing connection is closed first.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), NetworkError> {
        self.close(DisconnectReason::Requested);

        let target = format!("{host}:{port}");
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| NetworkError::Resolve(target.clone()))?
            .next()
            .ok_or(NetworkError::Resolve(target))?;

        let mut socket = TcpStream::connect(addr)?;
        self.poll
            .registry()
            .register(&mut socket, SERVER, Interest::READABLE | Interest::WRITABLE)?;
        self.server = Some(RemoteClient::new(socket, SERVER, addr, self.now));
        self.state = ConnectionState::Connecting;
        self.ping_seconds = 0.0;
        info!("connecting to {addr}");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// The server connection, while connecting or connected.
    pub fn server(&self) -> Option<&RemoteClient> {
        self.server.as_ref()
    }

    pub fn add_listener(&mut self, listener: Box<dyn NetworkListener>) {
        self.listeners.push(listener);
    }

    /// Queues `msg` for the server. Returns `false` without a connection.
    pub fn send(&mut self, msg: &ProtocolMessage) -> bool {
        let Some(server) = self.server.as_mut() else {
            debug!("not connected, dropping {}", msg.name());
            return false;
        };
        match msg.encode_within(self.max_frame_size) {
            Ok(frame) => {
                server.enqueue(&frame);
                self.ping_seconds = 0.0;
                true
            }
            Err(err) => {
                error!("failed to encode {}: {err}", msg.name());
                false
            }
        }
    }

    /// Requests a disconnect. It is applied at the start of the next update.
    pub fn disconnect(&mut self) {
        if self.server.is_some() {
            self.pending_disconnect = true;
        }
    }

    /// Runs one tick. See [`ServerNetwork::update`](super::ServerNetwork::update);
    /// handlers receive `ClientId::default()` as the sender.
    pub fn update<C>(ctx: &mut C, registry: &ProtocolHandlerRegistry<C>, now_seconds: f64)
    where
        C: AsMut<ClientNetwork>,
    {
        let inbound = {
            let network = ctx.as_mut();
            network.advance_clock(now_seconds);
            if network.pending_disconnect {
                network.close(DisconnectReason::Requested);
            }
            network.poll_readiness();
            if network.state != ConnectionState::Connected {
                return;
            }
            network.keep_alive();
            let max_payload = network.max_frame_size;
            match network.server.as_mut() {
                Some(server) => server.receive(now_seconds, max_payload),
                None => return,
            }
        };

        for msg in &inbound.messages {
            debug!("received {} from server", msg.name());
            registry.dispatch(ctx, ClientId::default(), msg);
        }

        let network = ctx.as_mut();
        if let Some(reason) = inbound.failure {
            network.close(reason);
            return;
        }
        network.flush();
    }

    fn advance_clock(&mut self, now_seconds: f64) {
        let delta = self
            .last_update
            .map_or(0.0, |last| (now_seconds - last).max(0.0));
        self.last_update = Some(now_seconds);
        self.now = now_seconds;
        self.ping_seconds += delta;
    }

    fn poll_readiness(&mut self) {
        if self.server.is_none() {
            return;
        }
        if let Err(err) = self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("failed to poll socket: {err}");
            }
            return;
        }

        let mut readable = false;
        let mut writable = false;
        for event in self.events.iter() {
            if event.token() != SERVER {
                continue;
            }
            readable |= event.is_readable() || event.is_read_closed() || event.is_error();
            writable |= event.is_writable() || event.is_write_closed();
        }
        if let Some(server) = self.server.as_mut() {
            server.set_readiness(readable, writable);
        }

        if self.state == ConnectionState::Connecting && (readable || writable) {
            match self.connect_progress() {
                ConnectProgress::Pending => {}
                ConnectProgress::Established => self.established(),
                ConnectProgress::Failed(err) => self.close(DisconnectReason::Io(err)),
            }
        }
    }

    fn connect_progress(&self) -> ConnectProgress {
        let Some(server) = self.server.as_ref() else {
            return ConnectProgress::Pending;
        };
        match server.socket.take_error() {
            Ok(Some(err)) | Err(err) => return ConnectProgress::Failed(err),
            Ok(None) => {}
        }
        match server.socket.peer_addr() {
            Ok(_) => ConnectProgress::Established,
            Err(err) if err.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
            Err(err) => ConnectProgress::Failed(err),
        }
    }

    fn established(&mut self) {
        let Some(server) = self.server.as_ref() else {
            return;
        };
        self.state = ConnectionState::Connected;
        if let Err(err) = server.socket.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY: {err}");
        }
        info!("connected to {}", server.addr());
        for listener in &mut self.listeners {
            listener.on_connect(ClientId::default(), server);
        }
    }

    fn keep_alive(&mut self) {
        if self.ping_interval <= 0.0 || self.ping_seconds < self.ping_interval {
            return;
        }
        self.send(&ProtocolMessage::Ping);
        let now = self.now;
        if let Some(server) = self.server.as_mut() {
            server.last_ping_time = now;
        }
    }

    fn flush(&mut self) {
        let Some(server) = self.server.as_mut() else {
            return;
        };
        match server.flush() {
            Ok(0) => {}
            Ok(sent) => trace!("sent {sent} bytes to server"),
            Err(reason) => self.close(reason),
        }
    }

    fn close(&mut self, reason: DisconnectReason) {
        self.pending_disconnect = false;
        let Some(mut server) = self.server.take() else {
            return;
        };
        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Disconnected;
        if let Err(err) = self.poll.registry().deregister(&mut server.socket) {
            debug!("failed to deregister server socket: {err}");
        }
        if let Err(err) = server.socket.shutdown(Shutdown::Both) {
            trace!("shutdown failed: {err}");
        }
        if was_connected {
            info!("disconnected from {}: {reason}", server.addr());
        } else {
            warn!("could not connect to {}: {reason}", server.addr());
        }
        for listener in &mut self.listeners {
            listener.on_disconnect(ClientId::default(), &server, &reason);
        }
    }
}

impl AsMut<ClientNetwork> for ClientNetwork {
    fn as_mut(&mut self) -> &mut ClientNetwork {
        self
    }
}

impl Drop for ClientNetwork {
    fn drop(&mut self) {
        self.close(DisconnectReason::Shutdown);
    }
}
