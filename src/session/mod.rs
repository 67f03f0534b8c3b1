//! Session layer on top of the network loops.
//!
//! # Overview
//!
//! A session is a set of authenticated peers sharing one scene. The server
//! checks each joining peer's protocol version and password, makes sure the
//! peer receives a snapshot of the scene and relays every scene change to all
//! other authenticated peers. Remote console commands are authorized by a
//! separate rcon password.
//!
//! # Seeding
//!
//! When the server's [`SceneHost`] has a snapshot, a joining peer gets it
//! directly. Otherwise the first authenticated peer is asked for its scene, and
//! peers that join before the answer arrives wait for it. If the asked peer
//! leaves first, the next waiting peer is asked instead.
//!
//! # Key Components
//!
//! - [`SceneHost`]: the seam to the scene graph and scripting layers.
//! - [`Server`] / [`ServerSession`]: relay server and its handler context.
//! - [`Client`] / [`ClientSession`]: a participant and its handler context.
mod client;
mod host;
mod server;

pub use client::{Client, ClientSession};
pub use host::{MemorySceneHost, SceneHost};
pub use server::{Authenticated, Peer, Server, ServerSession};
