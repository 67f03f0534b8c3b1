//! Readiness-driven socket plumbing.
//!
//! Both event loops are strictly single-threaded and tick driven: the host
//! application calls `update(now_seconds)` once per frame. Sockets are
//! non-blocking and readiness is polled with a zero timeout through `mio`, so
//! "waiting for I/O" means doing nothing this tick and looking again on the next.
//!
//! - [`ServerNetwork`]: listening socket plus every connected [`RemoteClient`].
//! - [`ClientNetwork`]: one outgoing connection to a server.
//!
//! Socket errors never leave `update`. Their only visible effects are
//! [`NetworkListener`] callbacks and log output.
use std::io;

use thiserror::Error;

use crate::protocol::{FrameError, RegistryError};

mod client;
pub mod io_util;
mod remote;
mod server;

pub use client::{ClientNetwork, ConnectionState};
pub use remote::{ClientId, RemoteClient};
pub use server::{ListenerId, ServerNetwork};

/// Failures of the outer surface (starting, connecting, setting up handlers).
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid interface address '{0}'")]
    InvalidInterface(String),

    #[error("could not resolve '{0}'")]
    Resolve(String),

    #[error("network io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Why a connection was closed.
#[derive(Debug, Error)]
pub enum DisconnectReason {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("idle for {0:.1} seconds")]
    IdleTimeout(f64),

    #[error("disconnect requested")]
    Requested,

    #[error("network shut down")]
    Shutdown,
}

/// Connection lifecycle callbacks.
///
/// On the client side the server connection is reported with
/// `ClientId::default()`.
pub trait NetworkListener {
    fn on_connect(&mut self, _client_id: ClientId, _client: &RemoteClient) {}

    fn on_disconnect(
        &mut self,
        _client_id: ClientId,
        _client: &RemoteClient,
        _reason: &DisconnectReason,
    ) {
    }
}
