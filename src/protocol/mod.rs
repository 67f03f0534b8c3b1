//! Session wire protocol.
//!
//! This module defines the binary protocol spoken between a voxlink server and its
//! editor or headless clients: message framing, typed message definitions and the
//! dispatch table that routes decoded messages to their handlers.
//!
//! # Overview
//!
//! The protocol layer knows how bytes become messages and back. It does not know
//! what a scene node or a voxel is: scene data is carried as opaque byte spans and
//! interpreted by whatever sits behind the [`SceneHost`](crate::session::SceneHost).
//!
//! # Key Components
//!
//! - [`MessageStream`]: cursor-addressed byte buffer with typed read/write helpers.
//! - [`ProtocolMessage`]: the closed set of messages, each able to encode itself
//!   into a frame and to be rebuilt from one.
//! - [`factory`]: decides whether a complete frame is buffered and builds it.
//! - [`ProtocolHandlerRegistry`]: message id to handler table.
//!
//! # Binary Format
//!
//! - Each frame begins with a 4 byte payload length followed by a 1 byte message id.
//! - The payload follows, encoded according to message-specific rules.
//! - Strings are "pascal" strings with a 16 or 32 bit length prefix and no terminator.
//! - All integers are little-endian.
//!
//! # Extensibility
//!
//! - Message ids are stable within a [`PROTOCOL_VERSION`].
//! - Peers with a different protocol version are rejected during session init.
//! - A frame with an unknown id is consumed, but the connection that sent it is
//!   treated as desynchronized and dropped.
//!
//! # See Also
//!
//! - [`network`](crate::network): event loops that move frames over sockets.
pub mod factory;
mod handler;
mod message;
mod stream;

pub use factory::{FrameError, FrameHeader, check_frame, create, is_new_message_available};
pub use handler::{NopHandler, ProtocolHandler, ProtocolHandlerRegistry, RegistryError};
pub use message::{
    HEADER_SIZE, InitSession, LogLevel, LogMessage, NodeAdded, NodeMoved, NodePayload,
    NodeProperties, NodeRenamed, PROTOCOL_VERSION, ProtocolId, ProtocolMessage, Region,
    RemoteCommand, ScriptCreate, VoxelModification, ids,
};
pub use stream::{MessageStream, StreamError};
