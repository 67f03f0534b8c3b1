pub mod cli;
pub mod config;
pub mod network;
pub mod protocol;
pub mod session;

pub use config::{ClientConfig, ServerConfig};
pub use network::{ClientId, ClientNetwork, ServerNetwork};
pub use protocol::{MessageStream, ProtocolMessage};
pub use session::{Client, MemorySceneHost, SceneHost, Server};
