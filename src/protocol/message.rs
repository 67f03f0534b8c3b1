//! Typed protocol messages.
//!
//! Every frame on the wire is laid out as
//!
//! ```text
//! [u32 payload length][u8 message id][payload]
//! ```
//!
//! The length counts only the payload bytes, not the five header bytes. Scene
//! data (voxels, palettes, key frames, ...) travels as opaque byte spans that
//! this crate never interprets.
use super::stream::{MessageStream, StreamError, to_u32};

pub type ProtocolId = u8;

/// Version sent in [`InitSession`]. Peers with a different version are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Length field plus message id.
pub const HEADER_SIZE: usize = 5;

/// Stable message ids.
pub mod ids {
    use super::ProtocolId;

    pub const PING: ProtocolId = 0;
    pub const SCENE_STATE_REQUEST: ProtocolId = 1;
    pub const SCENE_STATE: ProtocolId = 2;
    pub const VOXEL_MODIFICATION: ProtocolId = 3;
    pub const NODE_ADDED: ProtocolId = 4;
    pub const NODE_REMOVED: ProtocolId = 5;
    pub const NODE_MOVED: ProtocolId = 6;
    pub const NODE_RENAMED: ProtocolId = 7;
    pub const NODE_PALETTE_CHANGED: ProtocolId = 8;
    pub const NODE_PROPERTIES: ProtocolId = 9;
    pub const NODE_KEYFRAMES: ProtocolId = 10;
    pub const INIT_SESSION: ProtocolId = 11;
    pub const COMMAND: ProtocolId = 12;
    pub const NODE_NORMAL_PALETTE_CHANGED: ProtocolId = 13;
    pub const NODE_IK_CONSTRAINT: ProtocolId = 14;
    pub const SCENE_GRAPH_ANIMATIONS: ProtocolId = 15;
    pub const SCRIPT_LIST_REQUEST: ProtocolId = 16;
    pub const SCRIPT_LIST: ProtocolId = 17;
    pub const SCRIPT_CREATE: ProtocolId = 18;
    pub const LOG_MESSAGE: ProtocolId = 19;

    /// Message types that change the shared scene and are fanned out to every
    /// other peer.
    pub const SCENE_CHANGES: [ProtocolId; 11] = [
        VOXEL_MODIFICATION,
        NODE_ADDED,
        NODE_REMOVED,
        NODE_MOVED,
        NODE_RENAMED,
        NODE_PALETTE_CHANGED,
        NODE_PROPERTIES,
        NODE_KEYFRAMES,
        NODE_NORMAL_PALETTE_CHANGED,
        NODE_IK_CONSTRAINT,
        SCENE_GRAPH_ANIMATIONS,
    ];
}

/// Axis aligned voxel region, both corners inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub mins: [i32; 3],
    pub maxs: [i32; 3],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSession {
    pub protocol_version: u32,
    pub app_version: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub rcon_password: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoxelModification {
    pub node_uuid: String,
    pub region: Region,
    pub compressed: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAdded {
    pub parent_uuid: String,
    pub node_uuid: String,
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMoved {
    pub node_uuid: String,
    pub parent_uuid: String,
    pub reference_uuid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRenamed {
    pub node_uuid: String,
    pub name: String,
}

/// A node change whose body is owned by the scene layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePayload {
    pub node_uuid: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeProperties {
    pub node_uuid: String,
    pub properties: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCreate {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error = 1,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Ping,
    SceneStateRequest,
    SceneState(Vec<u8>),
    VoxelModification(VoxelModification),
    NodeAdded(NodeAdded),
    NodeRemoved { node_uuid: String },
    NodeMoved(NodeMoved),
    NodeRenamed(NodeRenamed),
    NodePaletteChanged(NodePayload),
    NodeProperties(NodeProperties),
    NodeKeyFrames(NodePayload),
    InitSession(InitSession),
    Command(RemoteCommand),
    NodeNormalPaletteChanged(NodePayload),
    NodeIkConstraint(NodePayload),
    SceneGraphAnimations(Vec<String>),
    ScriptListRequest,
    ScriptList(Vec<String>),
    ScriptCreate(ScriptCreate),
    Log(LogMessage),
}

impl ProtocolMessage {
    pub fn id(&self) -> ProtocolId {
        match self {
            ProtocolMessage::Ping => ids::PING,
            ProtocolMessage::SceneStateRequest => ids::SCENE_STATE_REQUEST,
            ProtocolMessage::SceneState(_) => ids::SCENE_STATE,
            ProtocolMessage::VoxelModification(_) => ids::VOXEL_MODIFICATION,
            ProtocolMessage::NodeAdded(_) => ids::NODE_ADDED,
            ProtocolMessage::NodeRemoved { .. } => ids::NODE_REMOVED,
            ProtocolMessage::NodeMoved(_) => ids::NODE_MOVED,
            ProtocolMessage::NodeRenamed(_) => ids::NODE_RENAMED,
            ProtocolMessage::NodePaletteChanged(_) => ids::NODE_PALETTE_CHANGED,
            ProtocolMessage::NodeProperties(_) => ids::NODE_PROPERTIES,
            ProtocolMessage::NodeKeyFrames(_) => ids::NODE_KEYFRAMES,
            ProtocolMessage::InitSession(_) => ids::INIT_SESSION,
            ProtocolMessage::Command(_) => ids::COMMAND,
            ProtocolMessage::NodeNormalPaletteChanged(_) => ids::NODE_NORMAL_PALETTE_CHANGED,
            ProtocolMessage::NodeIkConstraint(_) => ids::NODE_IK_CONSTRAINT,
            ProtocolMessage::SceneGraphAnimations(_) => ids::SCENE_GRAPH_ANIMATIONS,
            ProtocolMessage::ScriptListRequest => ids::SCRIPT_LIST_REQUEST,
            ProtocolMessage::ScriptList(_) => ids::SCRIPT_LIST,
            ProtocolMessage::ScriptCreate(_) => ids::SCRIPT_CREATE,
            ProtocolMessage::Log(_) => ids::LOG_MESSAGE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolMessage::Ping => "ping",
            ProtocolMessage::SceneStateRequest => "scene-state-request",
            ProtocolMessage::SceneState(_) => "scene-state",
            ProtocolMessage::VoxelModification(_) => "voxel-modification",
            ProtocolMessage::NodeAdded(_) => "node-added",
            ProtocolMessage::NodeRemoved { .. } => "node-removed",
            ProtocolMessage::NodeMoved(_) => "node-moved",
            ProtocolMessage::NodeRenamed(_) => "node-renamed",
            ProtocolMessage::NodePaletteChanged(_) => "node-palette-changed",
            ProtocolMessage::NodeProperties(_) => "node-properties",
            ProtocolMessage::NodeKeyFrames(_) => "node-keyframes",
            ProtocolMessage::InitSession(_) => "init-session",
            ProtocolMessage::Command(_) => "command",
            ProtocolMessage::NodeNormalPaletteChanged(_) => "node-normal-palette-changed",
            ProtocolMessage::NodeIkConstraint(_) => "node-ik-constraint",
            ProtocolMessage::SceneGraphAnimations(_) => "scene-graph-animations",
            ProtocolMessage::ScriptListRequest => "script-list-request",
            ProtocolMessage::ScriptList(_) => "script-list",
            ProtocolMessage::ScriptCreate(_) => "script-create",
            ProtocolMessage::Log(_) => "log",
        }
    }

    /// Whether this message mutates the shared scene.
    pub fn is_scene_change(&self) -> bool {
        ids::SCENE_CHANGES.contains(&self.id())
    }

    /// Serializes the message into a fresh stream holding exactly one frame.
    pub fn encode(&self) -> Result<MessageStream, StreamError> {
        self.encode_within(u32::MAX)
    }

    /// Like [`encode`](Self::encode), but refuses payloads larger than
    /// `max_payload` bytes, so a peer enforcing the same cap never sees them.
    pub fn encode_within(&self, max_payload: u32) -> Result<MessageStream, StreamError> {
        let mut out = MessageStream::new();
        self.write_frame(&mut out, max_payload)?;
        Ok(out)
    }

    /// Appends this message as one complete frame to `out`.
    ///
    /// On error nothing is appended.
    pub fn write_back(&self, out: &mut MessageStream) -> Result<(), StreamError> {
        self.write_frame(out, u32::MAX)
    }

    fn write_frame(&self, out: &mut MessageStream, max_payload: u32) -> Result<(), StreamError> {
        let mut frame = MessageStream::new();
        frame.write_u32(0);
        frame.write_u8(self.id());
        self.write_payload(&mut frame)?;
        write_size(&mut frame, max_payload)?;
        out.write_stream(&frame);
        Ok(())
    }

    fn write_payload(&self, out: &mut MessageStream) -> Result<(), StreamError> {
        match self {
            ProtocolMessage::Ping
            | ProtocolMessage::SceneStateRequest
            | ProtocolMessage::ScriptListRequest => {}
            ProtocolMessage::SceneState(data) => out.write_blob(data)?,
            ProtocolMessage::VoxelModification(msg) => {
                out.write_pascal_string_u16(&msg.node_uuid)?;
                for value in msg.region.mins.iter().chain(msg.region.maxs.iter()) {
                    out.write_i32(*value);
                }
                out.write_blob(&msg.compressed)?;
            }
            ProtocolMessage::NodeAdded(msg) => {
                out.write_pascal_string_u16(&msg.parent_uuid)?;
                out.write_pascal_string_u16(&msg.node_uuid)?;
                out.write_pascal_string_u16(&msg.name)?;
                out.write_blob(&msg.data)?;
            }
            ProtocolMessage::NodeRemoved { node_uuid } => {
                out.write_pascal_string_u16(node_uuid)?;
            }
            ProtocolMessage::NodeMoved(msg) => {
                out.write_pascal_string_u16(&msg.node_uuid)?;
                out.write_pascal_string_u16(&msg.parent_uuid)?;
                out.write_pascal_string_u16(&msg.reference_uuid)?;
            }
            ProtocolMessage::NodeRenamed(msg) => {
                out.write_pascal_string_u16(&msg.node_uuid)?;
                out.write_pascal_string_u16(&msg.name)?;
            }
            ProtocolMessage::NodePaletteChanged(payload)
            | ProtocolMessage::NodeKeyFrames(payload)
            | ProtocolMessage::NodeNormalPaletteChanged(payload)
            | ProtocolMessage::NodeIkConstraint(payload) => {
                out.write_pascal_string_u16(&payload.node_uuid)?;
                out.write_blob(&payload.data)?;
            }
            ProtocolMessage::NodeProperties(msg) => {
                out.write_pascal_string_u16(&msg.node_uuid)?;
                out.write_u32(to_u32(msg.properties.len())?);
                for (key, value) in &msg.properties {
                    out.write_pascal_string_u16(key)?;
                    out.write_pascal_string_u32(value)?;
                }
            }
            ProtocolMessage::InitSession(msg) => {
                out.write_u32(msg.protocol_version);
                out.write_pascal_string_u16(&msg.app_version)?;
                out.write_pascal_string_u16(&msg.username)?;
                out.write_pascal_string_u16(&msg.password)?;
            }
            ProtocolMessage::Command(msg) => {
                out.write_pascal_string_u16(&msg.rcon_password)?;
                out.write_pascal_string_u32(&msg.command)?;
            }
            ProtocolMessage::SceneGraphAnimations(names)
            | ProtocolMessage::ScriptList(names) => {
                out.write_u32(to_u32(names.len())?);
                for name in names {
                    out.write_pascal_string_u16(name)?;
                }
            }
            ProtocolMessage::ScriptCreate(msg) => {
                out.write_pascal_string_u16(&msg.name)?;
                out.write_pascal_string_u32(&msg.source)?;
            }
            ProtocolMessage::Log(msg) => {
                out.write_u8(msg.level as u8);
                out.write_pascal_string_u32(&msg.message)?;
            }
        }
        Ok(())
    }

    /// Rebuilds a message from its payload bytes.
    ///
    /// Returns `Ok(None)` for an id outside the type table.
    pub fn decode(
        id: ProtocolId,
        payload: &mut MessageStream,
    ) -> Result<Option<Self>, StreamError> {
        let msg = match id {
            ids::PING => ProtocolMessage::Ping,
            ids::SCENE_STATE_REQUEST => ProtocolMessage::SceneStateRequest,
            ids::SCENE_STATE => ProtocolMessage::SceneState(payload.read_blob()?),
            ids::VOXEL_MODIFICATION => {
                let node_uuid = payload.read_pascal_string_u16()?;
                let mut region = Region::default();
                for value in region.mins.iter_mut().chain(region.maxs.iter_mut()) {
                    *value = payload.read_i32()?;
                }
                ProtocolMessage::VoxelModification(VoxelModification {
                    node_uuid,
                    region,
                    compressed: payload.read_blob()?,
                })
            }
            ids::NODE_ADDED => ProtocolMessage::NodeAdded(NodeAdded {
                parent_uuid: payload.read_pascal_string_u16()?,
                node_uuid: payload.read_pascal_string_u16()?,
                name: payload.read_pascal_string_u16()?,
                data: payload.read_blob()?,
            }),
            ids::NODE_REMOVED => ProtocolMessage::NodeRemoved {
                node_uuid: payload.read_pascal_string_u16()?,
            },
            ids::NODE_MOVED => ProtocolMessage::NodeMoved(NodeMoved {
                node_uuid: payload.read_pascal_string_u16()?,
                parent_uuid: payload.read_pascal_string_u16()?,
                reference_uuid: payload.read_pascal_string_u16()?,
            }),
            ids::NODE_RENAMED => ProtocolMessage::NodeRenamed(NodeRenamed {
                node_uuid: payload.read_pascal_string_u16()?,
                name: payload.read_pascal_string_u16()?,
            }),
            ids::NODE_PALETTE_CHANGED => {
                ProtocolMessage::NodePaletteChanged(read_node_payload(payload)?)
            }
            ids::NODE_KEYFRAMES => ProtocolMessage::NodeKeyFrames(read_node_payload(payload)?),
            ids::NODE_NORMAL_PALETTE_CHANGED => {
                ProtocolMessage::NodeNormalPaletteChanged(read_node_payload(payload)?)
            }
            ids::NODE_IK_CONSTRAINT => {
                ProtocolMessage::NodeIkConstraint(read_node_payload(payload)?)
            }
            ids::NODE_PROPERTIES => {
                let node_uuid = payload.read_pascal_string_u16()?;
                let count = payload.read_u32()?;
                let mut properties = Vec::new();
                for _ in 0..count {
                    let key = payload.read_pascal_string_u16()?;
                    let value = payload.read_pascal_string_u32()?;
                    properties.push((key, value));
                }
                ProtocolMessage::NodeProperties(NodeProperties {
                    node_uuid,
                    properties,
                })
            }
            ids::INIT_SESSION => ProtocolMessage::InitSession(InitSession {
                protocol_version: payload.read_u32()?,
                app_version: payload.read_pascal_string_u16()?,
                username: payload.read_pascal_string_u16()?,
                password: payload.read_pascal_string_u16()?,
            }),
            ids::COMMAND => ProtocolMessage::Command(RemoteCommand {
                rcon_password: payload.read_pascal_string_u16()?,
                command: payload.read_pascal_string_u32()?,
            }),
            ids::SCENE_GRAPH_ANIMATIONS => {
                ProtocolMessage::SceneGraphAnimations(read_names(payload)?)
            }
            ids::SCRIPT_LIST_REQUEST => ProtocolMessage::ScriptListRequest,
            ids::SCRIPT_LIST => ProtocolMessage::ScriptList(read_names(payload)?),
            ids::SCRIPT_CREATE => ProtocolMessage::ScriptCreate(ScriptCreate {
                name: payload.read_pascal_string_u16()?,
                source: payload.read_pascal_string_u32()?,
            }),
            ids::LOG_MESSAGE => ProtocolMessage::Log(LogMessage {
                level: LogLevel::from_u8(payload.read_u8()?),
                message: payload.read_pascal_string_u32()?,
            }),
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

// Backpatches the length field of a frame that starts at offset 0.
fn write_size(frame: &mut MessageStream, max_payload: u32) -> Result<(), StreamError> {
    let payload = frame.size() - HEADER_SIZE;
    let len = to_u32(payload)?;
    if len > max_payload {
        return Err(StreamError::FrameTooLarge {
            len: payload,
            max: max_payload,
        });
    }
    frame.patch_u32(0, len);
    Ok(())
}

fn read_node_payload(payload: &mut MessageStream) -> Result<NodePayload, StreamError> {
    Ok(NodePayload {
        node_uuid: payload.read_pascal_string_u16()?,
        data: payload.read_blob()?,
    })
}

fn read_names(payload: &mut MessageStream) -> Result<Vec<String>, StreamError> {
    let count = payload.read_u32()?;
    let mut names = Vec::new();
    for _ in 0..count {
        names.push(payload.read_pascal_string_u16()?);
    }
    Ok(names)
}
