//! Server side event loop.
//!
//! Every tick runs the same phases in order:
//!
//! 1. disconnects requested by handlers during the previous tick are applied,
//! 2. idle clients are expired and the keep-alive ping goes out if due,
//! 3. readiness is polled and pending connections are accepted,
//! 4. each client's socket is drained and its complete frames are dispatched,
//! 5. queued output is flushed,
//! 6. clients that failed in this tick are removed.
//!
//! Clients are never removed while the client set is being iterated.
use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use mio::{Events, Interest, Poll, Token, net::TcpListener};
use slotmap::SlotMap;

use super::{ClientId, DisconnectReason, NetworkError, NetworkListener, RemoteClient};
use crate::{
    config::ServerConfig,
    protocol::{MessageStream, ProtocolHandlerRegistry, ProtocolMessage},
};

const LISTENER: Token = Token(0);
const EVENTS_CAPACITY: usize = 256;

/// Handle returned by [`ServerNetwork::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

pub struct ServerNetwork {
    config: ServerConfig,
    poll: Poll,
    events: Events,
    listener: Option<TcpListener>,
    clients: SlotMap<ClientId, RemoteClient>,
    tokens: HashMap<Token, ClientId>,
    next_token: usize,
    pending_disconnects: Vec<ClientId>,
    listeners: Vec<(ListenerId, Box<dyn NetworkListener>)>,
    next_listener: usize,
    last_update: Option<f64>,
    now: f64,
    ping_seconds: f64,
}

impl ServerNetwork {
    pub fn new(config: ServerConfig) -> Result<Self, NetworkError> {
        Ok(Self {
            config,
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener: None,
            clients: SlotMap::with_key(),
            tokens: HashMap::new(),
            next_token: LISTENER.0 + 1,
            pending_disconnects: Vec::new(),
            listeners: Vec::new(),
            next_listener: 0,
            last_update: None,
            now: 0.0,
            ping_seconds: 0.0,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the listening socket. Calling `start` on a running server is a no-op.
    pub fn start(&mut self) -> Result<(), NetworkError> {
        if self.listener.is_some() {
            warn!("server is already running");
            return Ok(());
        }
        let addr = SocketAddr::new(bind_ip(&self.config.interface)?, self.config.port);
        let mut listener = TcpListener::bind(addr)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        info!("listening on {}", listener.local_addr()?);
        self.listener = Some(listener);
        self.ping_seconds = 0.0;
        Ok(())
    }

    /// Disconnects every client and closes the listening socket.
    pub fn stop(&mut self) {
        let Some(mut listener) = self.listener.take() else {
            return;
        };
        let ids: Vec<ClientId> = self.clients.keys().collect();
        for client_id in ids {
            self.close(client_id, DisconnectReason::Shutdown);
        }
        self.pending_disconnects.clear();
        if let Err(err) = self.poll.registry().deregister(&mut listener) {
            debug!("failed to deregister listener: {err}");
        }
        info!("server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.listener.is_some()
    }

    /// Address the listener is bound to, useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn client(&self, client_id: ClientId) -> Option<&RemoteClient> {
        self.clients.get(client_id)
    }

    pub fn clients(&self) -> impl Iterator<Item = (ClientId, &RemoteClient)> {
        self.clients.iter()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn add_listener(&mut self, listener: Box<dyn NetworkListener>) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    /// Queues `msg` for every client except `except`. The message is encoded
    /// once. Returns the number of clients it was queued for.
    pub fn broadcast(&mut self, msg: &ProtocolMessage, except: Option<ClientId>) -> usize {
        let frame = match msg.encode_within(self.config.max_frame_size) {
            Ok(frame) => frame,
            Err(err) => {
                error!("failed to encode {}: {err}", msg.name());
                return 0;
            }
        };
        self.ping_seconds = 0.0;

        let mut count = 0;
        for (client_id, client) in self.clients.iter_mut() {
            if Some(client_id) == except {
                continue;
            }
            trace!("broadcast {} to client {client_id:?}", msg.name());
            client.enqueue(&frame);
            count += 1;
        }
        count
    }

    /// Queues `msg` for one client. Returns `false` if the id is unknown.
    pub fn send_to(&mut self, client_id: ClientId, msg: &ProtocolMessage) -> bool {
        if !self.clients.contains_key(client_id) {
            return false;
        }
        match msg.encode_within(self.config.max_frame_size) {
            Ok(frame) => self.send_frame(client_id, &frame),
            Err(err) => {
                error!("failed to encode {}: {err}", msg.name());
                false
            }
        }
    }

    /// Queues an already encoded frame for one client.
    pub fn send_frame(&mut self, client_id: ClientId, frame: &MessageStream) -> bool {
        match self.clients.get_mut(client_id) {
            Some(client) => {
                client.enqueue(frame);
                true
            }
            None => false,
        }
    }

    /// Requests a disconnect. It is applied at the start of the next update.
    pub fn disconnect(&mut self, client_id: ClientId) -> bool {
        if !self.clients.contains_key(client_id) {
            return false;
        }
        if !self.pending_disconnects.contains(&client_id) {
            self.pending_disconnects.push(client_id);
        }
        true
    }

    /// Runs one tick.
    ///
    /// `ctx` is whatever the handlers in `registry` operate on; it only has to
    /// expose the network. Handlers run after a client's bytes have been read,
    /// so they are free to send, broadcast or request disconnects.
    pub fn update<C>(ctx: &mut C, registry: &ProtocolHandlerRegistry<C>, now_seconds: f64)
    where
        C: AsMut<ServerNetwork>,
    {
        let (client_ids, max_payload) = {
            let network = ctx.as_mut();
            network.advance_clock(now_seconds);
            network.apply_pending_disconnects();
            if !network.is_running() {
                return;
            }
            network.expire_idle_clients();
            network.keep_alive();
            network.poll_readiness();
            let ids: Vec<ClientId> = network.clients.keys().collect();
            (ids, network.config.max_frame_size)
        };

        let mut failed = Vec::new();
        for client_id in client_ids {
            let inbound = match ctx.as_mut().clients.get_mut(client_id) {
                Some(client) => client.receive(now_seconds, max_payload),
                None => continue,
            };
            for msg in &inbound.messages {
                debug!("received {} from client {client_id:?}", msg.name());
                registry.dispatch(ctx, client_id, msg);
            }
            if let Some(reason) = inbound.failure {
                failed.push((client_id, reason));
            }
        }

        let network = ctx.as_mut();
        network.flush_all(&mut failed);
        for (client_id, reason) in failed {
            network.close(client_id, reason);
        }
    }

    fn advance_clock(&mut self, now_seconds: f64) {
        let delta = self
            .last_update
            .map_or(0.0, |last| (now_seconds - last).max(0.0));
        self.last_update = Some(now_seconds);
        self.now = now_seconds;
        self.ping_seconds += delta;
    }

    fn apply_pending_disconnects(&mut self) {
        let pending = std::mem::take(&mut self.pending_disconnects);
        for client_id in pending {
            self.close(client_id, DisconnectReason::Requested);
        }
    }

    fn expire_idle_clients(&mut self) {
        let timeout = self.config.idle_timeout;
        if timeout <= 0.0 {
            return;
        }
        let now = self.now;
        let expired: Vec<(ClientId, f64)> = self
            .clients
            .iter()
            .map(|(client_id, client)| (client_id, now - client.last_activity()))
            .filter(|(_, idle)| *idle > timeout)
            .collect();
        for (client_id, idle) in expired {
            self.close(client_id, DisconnectReason::IdleTimeout(idle));
        }
    }

    fn keep_alive(&mut self) {
        let interval = self.config.ping_interval;
        if interval <= 0.0 || self.ping_seconds < interval {
            return;
        }
        self.broadcast(&ProtocolMessage::Ping, None);
        let now = self.now;
        for client in self.clients.values_mut() {
            client.last_ping_time = now;
        }
    }

    fn poll_readiness(&mut self) {
        if let Err(err) = self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("failed to poll sockets: {err}");
            }
            return;
        }

        let mut accept = false;
        for event in self.events.iter() {
            if event.token() == LISTENER {
                accept = true;
                continue;
            }
            let Some(client_id) = self.tokens.get(&event.token()) else {
                continue;
            };
            if let Some(client) = self.clients.get_mut(*client_id) {
                client.set_readiness(
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable(),
                );
            }
        }

        if accept {
            self.accept_clients();
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            let (mut socket, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("failed to accept connection: {err}");
                    return;
                }
            };

            if self.clients.len() >= self.config.max_connections {
                info!(
                    "rejecting connection from {addr}: maximum of {} clients reached",
                    self.config.max_connections
                );
                continue;
            }

            let token = Token(self.next_token);
            self.next_token += 1;
            if let Err(err) =
                self.poll
                    .registry()
                    .register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)
            {
                warn!("failed to register connection from {addr}: {err}");
                continue;
            }
            if let Err(err) = socket.set_nodelay(true) {
                debug!("failed to set TCP_NODELAY for {addr}: {err}");
            }

            let client_id = self
                .clients
                .insert(RemoteClient::new(socket, token, addr, self.now));
            self.tokens.insert(token, client_id);
            info!("client {client_id:?} connected from {addr}");

            if let Some(client) = self.clients.get(client_id) {
                for (_, listener) in &mut self.listeners {
                    listener.on_connect(client_id, client);
                }
            }
        }
    }

    fn flush_all(&mut self, failed: &mut Vec<(ClientId, DisconnectReason)>) {
        for (client_id, client) in self.clients.iter_mut() {
            if failed.iter().any(|(id, _)| *id == client_id) {
                continue;
            }
            match client.flush() {
                Ok(0) => {}
                Ok(sent) => trace!("sent {sent} bytes to client {client_id:?}"),
                Err(reason) => failed.push((client_id, reason)),
            }
        }
    }

    fn close(&mut self, client_id: ClientId, reason: DisconnectReason) {
        let Some(mut client) = self.clients.remove(client_id) else {
            return;
        };
        self.tokens.remove(&client.token);
        if let Err(err) = self.poll.registry().deregister(&mut client.socket) {
            debug!("failed to deregister client {client_id:?}: {err}");
        }
        match reason {
            DisconnectReason::Io(_) | DisconnectReason::Frame(_) => {
                warn!("client {client_id:?} ({}) dropped: {reason}", client.addr())
            }
            _ => info!("client {client_id:?} ({}) disconnected: {reason}", client.addr()),
        }
        for (_, listener) in &mut self.listeners {
            listener.on_disconnect(client_id, &client, &reason);
        }
    }
}

impl AsMut<ServerNetwork> for ServerNetwork {
    fn as_mut(&mut self) -> &mut ServerNetwork {
        self
    }
}

impl Drop for ServerNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_ip(interface: &str) -> Result<IpAddr, NetworkError> {
    let interface = interface.trim();
    if interface.is_empty() {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    interface
        .parse()
        .map_err(|_| NetworkError::InvalidInterface(interface.to_string()))
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        io::{Read, Write},
        net::TcpStream,
        rc::Rc,
        thread,
    };

    use super::*;
    use crate::protocol::{self, ids};

    fn local_config() -> ServerConfig {
        ServerConfig {
            interface: "127.0.0.1".to_string(),
            port: 0,
            ping_interval: 0.0,
            ..ServerConfig::default()
        }
    }

    fn started(config: ServerConfig) -> ServerNetwork {
        let mut network = ServerNetwork::new(config).unwrap();
        network.start().unwrap();
        network
    }

    /// Ticks until `done` holds, with a generous wall clock limit.
    fn tick_until<C: AsMut<ServerNetwork>>(
        ctx: &mut C,
        registry: &ProtocolHandlerRegistry<C>,
        mut done: impl FnMut(&mut C) -> bool,
    ) -> bool {
        for _ in 0..500 {
            ServerNetwork::update(ctx, registry, 0.0);
            if done(ctx) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[derive(Default)]
    struct Lifecycle {
        connected: Vec<ClientId>,
        disconnected: Vec<(ClientId, String)>,
    }

    struct Recorder(Rc<RefCell<Lifecycle>>);

    impl NetworkListener for Recorder {
        fn on_connect(&mut self, client_id: ClientId, _client: &RemoteClient) {
            self.0.borrow_mut().connected.push(client_id);
        }

        fn on_disconnect(
            &mut self,
            client_id: ClientId,
            _client: &RemoteClient,
            reason: &DisconnectReason,
        ) {
            self.0
                .borrow_mut()
                .disconnected
                .push((client_id, reason.to_string()));
        }
    }

    #[test]
    fn bind_ip_parsing() {
        assert_eq!(
            bind_ip("").unwrap(),
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        );
        assert_eq!(bind_ip("127.0.0.1").unwrap(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(matches!(
            bind_ip("not-an-ip"),
            Err(NetworkError::InvalidInterface(_))
        ));
    }

    #[test]
    fn update_before_start_is_noop() {
        let mut network = ServerNetwork::new(local_config()).unwrap();
        let registry = ProtocolHandlerRegistry::new();

        ServerNetwork::update(&mut network, &registry, 0.0);

        assert!(!network.is_running());
        assert_eq!(network.client_count(), 0);
    }

    #[test]
    fn accepts_and_reports_connections() {
        let mut network = started(local_config());
        let events = Rc::new(RefCell::new(Lifecycle::default()));
        network.add_listener(Box::new(Recorder(Rc::clone(&events))));
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let peer = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));
        assert_eq!(events.borrow().connected.len(), 1);

        drop(peer);
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 0));
        let events = events.borrow();
        assert_eq!(events.disconnected.len(), 1);
        assert_eq!(events.disconnected[0].0, events.connected[0]);
    }

    #[test]
    fn max_connections_refuses_extra_peer() {
        let mut network = started(ServerConfig {
            max_connections: 1,
            ..local_config()
        });
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let _first = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));

        let mut second = TcpStream::connect(addr).unwrap();
        second
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for _ in 0..20 {
            ServerNetwork::update(&mut network, &registry, 0.0);
            thread::sleep(Duration::from_millis(5));
        }

        let mut buf = [0u8; 1];
        let read = second.read(&mut buf);
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(network.client_count(), 1);
    }

    #[test]
    fn handlers_see_every_frame_in_order() {
        let mut network = started(local_config());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut registry = ProtocolHandlerRegistry::<ServerNetwork>::new();
        let sink = Rc::clone(&seen);
        registry
            .register_all(
                &[ids::PING, ids::SCENE_STATE_REQUEST],
                Rc::new(move |_: &mut ServerNetwork, _: ClientId, msg: &ProtocolMessage| {
                    sink.borrow_mut().push(msg.id())
                }),
            )
            .unwrap();
        let addr = network.local_addr().unwrap();

        let mut peer = TcpStream::connect(addr).unwrap();
        let mut bytes = protocol::MessageStream::new();
        ProtocolMessage::Ping.write_back(&mut bytes).unwrap();
        ProtocolMessage::SceneStateRequest
            .write_back(&mut bytes)
            .unwrap();
        ProtocolMessage::Ping.write_back(&mut bytes).unwrap();
        peer.write_all(bytes.as_slice()).unwrap();

        assert!(tick_until(&mut network, &registry, |_| seen.borrow().len() == 3));
        assert_eq!(
            *seen.borrow(),
            vec![ids::PING, ids::SCENE_STATE_REQUEST, ids::PING]
        );
    }

    #[test]
    fn unknown_message_drops_only_the_sender() {
        let mut network = started(local_config());
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let mut bad = TcpStream::connect(addr).unwrap();
        let _good = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 2));

        bad.write_all(&[0, 0, 0, 0, 0xEE]).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));
    }

    #[test]
    fn requested_disconnect_applies_next_tick() {
        let mut network = started(local_config());
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let _peer = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));
        let (client_id, _) = network.clients().next().unwrap();

        assert!(network.disconnect(client_id));
        assert!(network.contains(client_id));
        ServerNetwork::update(&mut network, &registry, 0.0);

        assert!(!network.contains(client_id));
        assert!(!network.send_to(client_id, &ProtocolMessage::Ping));
        assert!(!network.disconnect(client_id));
    }

    #[test]
    fn idle_clients_expire() {
        let mut network = started(ServerConfig {
            idle_timeout: 10.0,
            ..local_config()
        });
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let _peer = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));

        ServerNetwork::update(&mut network, &registry, 5.0);
        assert_eq!(network.client_count(), 1);
        ServerNetwork::update(&mut network, &registry, 20.0);
        assert_eq!(network.client_count(), 0);
    }

    #[test]
    fn broadcast_skips_excluded_client() {
        let mut network = started(local_config());
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 2));
        let ids: Vec<ClientId> = network.clients().map(|(id, _)| id).collect();

        let queued = network.broadcast(&ProtocolMessage::Ping, Some(ids[0]));

        assert_eq!(queued, 1);
        assert!(network.client(ids[0]).unwrap().outbound().is_empty());
        assert_eq!(network.client(ids[1]).unwrap().outbound().len(), 5);
    }

    #[test]
    fn broadcast_with_only_client_excluded_queues_nothing() {
        let mut network = started(local_config());
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let _only = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));
        let (only_id, _) = network.clients().next().unwrap();

        let queued = network.broadcast(&ProtocolMessage::Ping, Some(only_id));

        assert_eq!(queued, 0);
        assert!(network.client(only_id).unwrap().outbound().is_empty());
    }

    #[test]
    fn frames_over_the_size_cap_are_not_queued() {
        let mut network = started(ServerConfig {
            max_frame_size: 8,
            ..local_config()
        });
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let _peer = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));
        let (peer_id, _) = network.clients().next().unwrap();

        assert!(!network.send_to(peer_id, &ProtocolMessage::SceneState(vec![0; 16])));
        assert_eq!(network.broadcast(&ProtocolMessage::SceneState(vec![0; 16]), None), 0);
        assert!(network.client(peer_id).unwrap().outbound().is_empty());
        assert!(network.send_to(peer_id, &ProtocolMessage::SceneState(vec![0; 4])));
    }

    #[test]
    fn keep_alive_ping_after_quiet_interval() {
        let mut network = started(ServerConfig {
            ping_interval: 5.0,
            ..local_config()
        });
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let mut peer = TcpStream::connect(addr).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));

        ServerNetwork::update(&mut network, &registry, 6.0);

        let mut header = [0u8; 5];
        peer.read_exact(&mut header).unwrap();
        assert_eq!(header, [0, 0, 0, 0, ids::PING]);
    }

    #[test]
    fn stop_disconnects_everyone() {
        let mut network = started(local_config());
        let registry = ProtocolHandlerRegistry::new();
        let addr = network.local_addr().unwrap();

        let _peer = TcpStream::connect(addr).unwrap();
        assert!(tick_until(&mut network, &registry, |n| n.client_count() == 1));

        network.stop();

        assert!(!network.is_running());
        assert_eq!(network.client_count(), 0);
        assert!(network.local_addr().is_none());
    }
}
