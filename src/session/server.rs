//! Server side session: handshake, state seeding and fan-out.
use std::rc::Rc;

use log::{Level, debug, info, log, warn};
use slotmap::SecondaryMap;

use super::host::SceneHost;
use crate::{
    config::ServerConfig,
    network::{ClientId, NetworkError, ServerNetwork},
    protocol::{
        LogLevel, LogMessage, NopHandler, PROTOCOL_VERSION, ProtocolHandler,
        ProtocolHandlerRegistry, ProtocolMessage, RegistryError, ids,
    },
};

/// What the session knows about one connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Peer {
    pub username: String,
    pub app_version: String,
    pub authenticated: bool,
    pub rejected: bool,
    /// Joined while no snapshot was available and still waits for one.
    pub awaiting_state: bool,
}

/// Handler context: the network, the scene host and per-peer session state.
pub struct ServerSession<H> {
    network: ServerNetwork,
    host: H,
    password: String,
    rcon_password: String,
    peers: SecondaryMap<ClientId, Peer>,
    seeder: Option<ClientId>,
    state_requested: bool,
}

impl<H> AsMut<ServerNetwork> for ServerSession<H> {
    fn as_mut(&mut self) -> &mut ServerNetwork {
        &mut self.network
    }
}

impl<H: SceneHost> ServerSession<H> {
    pub fn network(&self) -> &ServerNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut ServerNetwork {
        &mut self.network
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn peer(&self, client_id: ClientId) -> Option<&Peer> {
        self.peers.get(client_id)
    }

    pub fn is_authenticated(&self, client_id: ClientId) -> bool {
        self.peers
            .get(client_id)
            .is_some_and(|peer| peer.authenticated)
    }

    /// A rejected peer stays connected until its error reply is flushed. Nothing
    /// it sends in the meantime is handled.
    pub fn is_rejected(&self, client_id: ClientId) -> bool {
        self.peers.get(client_id).is_some_and(|peer| peer.rejected)
    }

    pub fn authenticated_count(&self) -> usize {
        self.peers.values().filter(|peer| peer.authenticated).count()
    }

    /// The peer the session asked (or will ask) for the initial snapshot.
    pub fn seeder(&self) -> Option<ClientId> {
        self.seeder
    }

    /// Sends `msg` to every authenticated peer except `except`. Encodes once.
    pub fn broadcast_to_peers(
        &mut self,
        msg: &ProtocolMessage,
        except: Option<ClientId>,
    ) -> usize {
        let frame = match msg.encode_within(self.network.config().max_frame_size) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to encode {}: {err}", msg.name());
                return 0;
            }
        };
        let targets: Vec<ClientId> = self
            .peers
            .iter()
            .filter(|(client_id, peer)| peer.authenticated && Some(*client_id) != except)
            .map(|(client_id, _)| client_id)
            .collect();

        targets
            .into_iter()
            .filter(|client_id| self.network.send_frame(*client_id, &frame))
            .count()
    }

    fn send_log(&mut self, client_id: ClientId, level: LogLevel, message: String) {
        self.network
            .send_to(client_id, &ProtocolMessage::Log(LogMessage { level, message }));
    }

    fn reject(&mut self, client_id: ClientId, mut peer: Peer, reason: String) {
        warn!("rejecting client {client_id:?} ({}): {reason}", peer.username);
        peer.rejected = true;
        self.peers.insert(client_id, peer);
        self.send_log(client_id, LogLevel::Error, reason);
        self.network.disconnect(client_id);
    }

    /// Makes sure some authenticated peer has been asked for a snapshot.
    fn request_state(&mut self) {
        if self.state_requested {
            return;
        }
        let seeder = match self.seeder.filter(|id| self.is_authenticated(*id)) {
            Some(seeder) => seeder,
            None => {
                let candidate = self
                    .peers
                    .iter()
                    .filter(|(_, peer)| peer.authenticated)
                    .min_by_key(|(_, peer)| peer.awaiting_state)
                    .map(|(client_id, _)| client_id);
                let Some(candidate) = candidate else {
                    self.seeder = None;
                    return;
                };
                candidate
            }
        };
        if let Some(peer) = self.peers.get_mut(seeder) {
            peer.awaiting_state = false;
        }
        info!("requesting scene state from client {seeder:?}");
        self.seeder = Some(seeder);
        self.state_requested = self
            .network
            .send_to(seeder, &ProtocolMessage::SceneStateRequest);
    }

    /// Forgets peers whose connection is gone and re-seeds if needed.
    fn prune(&mut self) {
        let gone: Vec<ClientId> = self
            .peers
            .keys()
            .filter(|client_id| !self.network.contains(*client_id))
            .collect();
        if gone.is_empty() {
            return;
        }
        for client_id in gone {
            if let Some(peer) = self.peers.remove(client_id) {
                debug!("client {client_id:?} ({}) left the session", peer.username);
            }
        }
        if let Some(seeder) = self.seeder.filter(|seeder| !self.peers.contains_key(*seeder)) {
            info!("seeding client {seeder:?} left");
            self.seeder = None;
            self.state_requested = false;
        }
        if self.peers.values().any(|peer| peer.awaiting_state) {
            self.request_state();
        }
    }
}

/// Drops messages from peers that have not completed the handshake.
pub struct Authenticated<T>(pub T);

impl<H, T> ProtocolHandler<ServerSession<H>> for Authenticated<T>
where
    H: SceneHost,
    T: ProtocolHandler<ServerSession<H>>,
{
    fn execute(&self, session: &mut ServerSession<H>, client_id: ClientId, msg: &ProtocolMessage) {
        if session.is_rejected(client_id) {
            debug!("dropping {} from rejected client {client_id:?}", msg.name());
            return;
        }
        if !session.is_authenticated(client_id) {
            warn!(
                "dropping {} from unauthenticated client {client_id:?}",
                msg.name()
            );
            return;
        }
        self.0.execute(session, client_id, msg);
    }
}

fn init_session<H: SceneHost>(
    session: &mut ServerSession<H>,
    client_id: ClientId,
    msg: &ProtocolMessage,
) {
    let ProtocolMessage::InitSession(init) = msg else {
        return;
    };
    if session.is_rejected(client_id) {
        debug!("ignoring session init from rejected client {client_id:?}");
        return;
    }
    if session.is_authenticated(client_id) {
        warn!("client {client_id:?} sent a second session init");
        return;
    }

    let mut peer = Peer {
        username: init.username.clone(),
        app_version: init.app_version.clone(),
        ..Peer::default()
    };
    if init.protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "protocol version mismatch: server {PROTOCOL_VERSION}, client {}",
            init.protocol_version
        );
        session.reject(client_id, peer, reason);
        return;
    }
    if init.password != session.password {
        session.reject(client_id, peer, "invalid session password".to_string());
        return;
    }

    info!(
        "client {client_id:?} joined as '{}' (version {})",
        init.username, init.app_version
    );
    peer.authenticated = true;
    let others = session.authenticated_count();

    if let Some(state) = session.host.scene_state() {
        session.peers.insert(client_id, peer);
        session
            .network
            .send_to(client_id, &ProtocolMessage::SceneState(state));
        let changes = session.host.changes_since_snapshot();
        if !changes.is_empty() {
            debug!(
                "replaying {} changes to client {client_id:?}",
                changes.len()
            );
        }
        for change in &changes {
            session.network.send_to(client_id, change);
        }
    } else if others == 0 {
        session.peers.insert(client_id, peer);
        session.seeder = Some(client_id);
        session.state_requested = false;
        session.request_state();
    } else {
        peer.awaiting_state = true;
        session.peers.insert(client_id, peer);
        session.request_state();
    }
}

fn scene_state<H: SceneHost>(
    session: &mut ServerSession<H>,
    client_id: ClientId,
    msg: &ProtocolMessage,
) {
    let ProtocolMessage::SceneState(data) = msg else {
        return;
    };
    info!(
        "client {client_id:?} sent a {} byte scene snapshot",
        data.len()
    );
    session.host.apply_scene_state(data);
    session.state_requested = false;
    let forwarded = session.broadcast_to_peers(msg, Some(client_id));
    for peer in session.peers.values_mut() {
        peer.awaiting_state = false;
    }
    debug!("forwarded scene state to {forwarded} peers");
}

fn scene_change<H: SceneHost>(
    session: &mut ServerSession<H>,
    client_id: ClientId,
    msg: &ProtocolMessage,
) {
    session.host.apply_change(msg);
    let forwarded = session.broadcast_to_peers(msg, Some(client_id));
    debug!(
        "forwarded {} from {client_id:?} to {forwarded} peers",
        msg.name()
    );
}

fn command<H: SceneHost>(
    session: &mut ServerSession<H>,
    client_id: ClientId,
    msg: &ProtocolMessage,
) {
    let ProtocolMessage::Command(cmd) = msg else {
        return;
    };
    if session.is_rejected(client_id) {
        debug!("ignoring command from rejected client {client_id:?}");
        return;
    }
    if cmd.rcon_password != session.rcon_password {
        warn!("client {client_id:?} sent a command with an invalid rcon password");
        return;
    }
    info!("client {client_id:?} executes '{}'", cmd.command);
    if let Some(output) = session.host.execute_command(&cmd.command) {
        session.send_log(client_id, LogLevel::Info, output);
    }
}

fn scripts<H: SceneHost>(
    session: &mut ServerSession<H>,
    client_id: ClientId,
    msg: &ProtocolMessage,
) {
    match msg {
        ProtocolMessage::ScriptListRequest => {
            let names = session.host.scripts();
            session
                .network
                .send_to(client_id, &ProtocolMessage::ScriptList(names));
        }
        ProtocolMessage::ScriptCreate(script) => {
            if !session.host.create_script(&script.name, &script.source) {
                session.send_log(
                    client_id,
                    LogLevel::Warn,
                    format!("script '{}' was not created", script.name),
                );
            }
        }
        _ => {}
    }
}

fn remote_log<C>(_ctx: &mut C, client_id: ClientId, msg: &ProtocolMessage) {
    if let ProtocolMessage::Log(entry) = msg {
        log!(Level::from(entry.level), "client {client_id:?}: {}", entry.message);
    }
}

fn register_handlers<H: SceneHost + 'static>(
    registry: &mut ProtocolHandlerRegistry<ServerSession<H>>,
) -> Result<(), RegistryError> {
    registry.register(ids::INIT_SESSION, Rc::new(init_session::<H>))?;
    registry.register(ids::PING, Rc::new(NopHandler))?;
    registry.register(ids::COMMAND, Rc::new(command::<H>))?;
    registry.register(ids::SCENE_STATE, Rc::new(Authenticated(scene_state::<H>)))?;
    let relay: Rc<dyn ProtocolHandler<ServerSession<H>>> =
        Rc::new(Authenticated(scene_change::<H>));
    registry.register(ids::SCENE_STATE_REQUEST, Rc::clone(&relay))?;
    registry.register_all(&ids::SCENE_CHANGES, relay)?;
    registry.register_all(
        &[ids::SCRIPT_LIST_REQUEST, ids::SCRIPT_CREATE],
        Rc::new(Authenticated(scripts::<H>)),
    )?;
    registry.register(
        ids::LOG_MESSAGE,
        Rc::new(Authenticated(remote_log::<ServerSession<H>>)),
    )?;
    Ok(())
}

/// A relay server: network loop, session state and the handler table.
pub struct Server<H: SceneHost> {
    session: ServerSession<H>,
    registry: ProtocolHandlerRegistry<ServerSession<H>>,
}

impl<H: SceneHost + 'static> Server<H> {
    pub fn new(config: ServerConfig, host: H) -> Result<Self, NetworkError> {
        let password = config.password.clone();
        let rcon_password = config.rcon_password.clone();
        let session = ServerSession {
            network: ServerNetwork::new(config)?,
            host,
            password,
            rcon_password,
            peers: SecondaryMap::new(),
            seeder: None,
            state_requested: false,
        };
        let mut registry = ProtocolHandlerRegistry::new();
        register_handlers(&mut registry)?;
        Ok(Self { session, registry })
    }

    pub fn start(&mut self) -> Result<(), NetworkError> {
        self.session.network.start()
    }

    pub fn stop(&mut self) {
        self.session.network.stop();
        self.session.peers.clear();
        self.session.seeder = None;
        self.session.state_requested = false;
    }

    pub fn is_running(&self) -> bool {
        self.session.network.is_running()
    }

    /// Runs one tick of the network loop, then drops state of departed peers.
    pub fn update(&mut self, now_seconds: f64) {
        ServerNetwork::update(&mut self.session, &self.registry, now_seconds);
        self.session.prune();
    }

    pub fn session(&self) -> &ServerSession<H> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ServerSession<H> {
        &mut self.session
    }

    /// Handler table, for hosts that want to add or override handlers.
    pub fn registry_mut(&mut self) -> &mut ProtocolHandlerRegistry<ServerSession<H>> {
        &mut self.registry
    }
}
