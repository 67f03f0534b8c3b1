//! Client side session: joins a server and mirrors its scene into a host.
use std::rc::Rc;

use log::{Level, debug, info, log};

use super::host::SceneHost;
use crate::{
    config::ClientConfig,
    network::{ClientId, ClientNetwork, ConnectionState, NetworkError},
    protocol::{
        InitSession, NopHandler, ProtocolHandlerRegistry, ProtocolMessage, RegistryError,
        RemoteCommand, ScriptCreate, ids,
    },
};

/// Handler context for the client role.
pub struct ClientSession<H> {
    network: ClientNetwork,
    host: H,
}

impl<H> AsMut<ClientNetwork> for ClientSession<H> {
    fn as_mut(&mut self) -> &mut ClientNetwork {
        &mut self.network
    }
}

impl<H: SceneHost> ClientSession<H> {
    pub fn network(&self) -> &ClientNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut ClientNetwork {
        &mut self.network
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }
}

fn send_scene_state<H: SceneHost>(
    session: &mut ClientSession<H>,
    _: ClientId,
    _: &ProtocolMessage,
) {
    let state = session.host.scene_state().unwrap_or_default();
    info!("server requested the scene, sending {} bytes", state.len());
    session.network.send(&ProtocolMessage::SceneState(state));
}

fn receive_scene_state<H: SceneHost>(
    session: &mut ClientSession<H>,
    _: ClientId,
    msg: &ProtocolMessage,
) {
    if let ProtocolMessage::SceneState(data) = msg {
        info!("received {} byte scene snapshot", data.len());
        session.host.apply_scene_state(data);
    }
}

fn scene_change<H: SceneHost>(session: &mut ClientSession<H>, _: ClientId, msg: &ProtocolMessage) {
    debug!("applying {}", msg.name());
    session.host.apply_change(msg);
}

fn script_list<H: SceneHost>(session: &mut ClientSession<H>, _: ClientId, msg: &ProtocolMessage) {
    if let ProtocolMessage::ScriptList(names) = msg {
        session.host.script_list(names);
    }
}

fn server_log<C>(_ctx: &mut C, _: ClientId, msg: &ProtocolMessage) {
    if let ProtocolMessage::Log(entry) = msg {
        log!(Level::from(entry.level), "server: {}", entry.message);
    }
}

fn register_handlers<H: SceneHost + 'static>(
    registry: &mut ProtocolHandlerRegistry<ClientSession<H>>,
) -> Result<(), RegistryError> {
    registry.register(ids::SCENE_STATE_REQUEST, Rc::new(send_scene_state::<H>))?;
    registry.register(ids::SCENE_STATE, Rc::new(receive_scene_state::<H>))?;
    registry.register_all(&ids::SCENE_CHANGES, Rc::new(scene_change::<H>))?;
    registry.register_all(&[ids::PING, ids::COMMAND], Rc::new(NopHandler))?;
    registry.register(ids::SCRIPT_LIST, Rc::new(script_list::<H>))?;
    registry.register(ids::LOG_MESSAGE, Rc::new(server_log::<ClientSession<H>>))?;
    Ok(())
}

/// A session participant: one server connection, a scene host and the handler table.
pub struct Client<H: SceneHost> {
    config: ClientConfig,
    session: ClientSession<H>,
    registry: ProtocolHandlerRegistry<ClientSession<H>>,
}

impl<H: SceneHost + 'static> Client<H> {
    pub fn new(config: ClientConfig, host: H) -> Result<Self, NetworkError> {
        let session = ClientSession {
            network: ClientNetwork::new(&config)?,
            host,
        };
        let mut registry = ProtocolHandlerRegistry::new();
        register_handlers(&mut registry)?;
        Ok(Self {
            config,
            session,
            registry,
        })
    }

    /// Connects to the configured server and queues the session init.
    pub fn connect(&mut self) -> Result<(), NetworkError> {
        self.session
            .network
            .connect(&self.config.host, self.config.port)?;
        let init = ProtocolMessage::InitSession(InitSession {
            protocol_version: self.config.protocol_version,
            app_version: self.config.app_version.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        });
        self.session.network.send(&init);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.session.network.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.session.network.state()
    }

    pub fn is_connected(&self) -> bool {
        self.session.network.is_connected()
    }

    pub fn update(&mut self, now_seconds: f64) {
        ClientNetwork::update(&mut self.session, &self.registry, now_seconds);
    }

    /// Sends a scene change or any other message to the server.
    pub fn send(&mut self, msg: &ProtocolMessage) -> bool {
        self.session.network.send(msg)
    }

    pub fn execute_command(&mut self, rcon_password: &str, command: &str) -> bool {
        self.send(&ProtocolMessage::Command(RemoteCommand {
            rcon_password: rcon_password.to_string(),
            command: command.to_string(),
        }))
    }

    pub fn request_scripts(&mut self) -> bool {
        self.send(&ProtocolMessage::ScriptListRequest)
    }

    pub fn create_script(&mut self, name: &str, source: &str) -> bool {
        self.send(&ProtocolMessage::ScriptCreate(ScriptCreate {
            name: name.to_string(),
            source: source.to_string(),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> &ClientSession<H> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ClientSession<H> {
        &mut self.session
    }

    pub fn registry_mut(&mut self) -> &mut ProtocolHandlerRegistry<ClientSession<H>> {
        &mut self.registry
    }
}
