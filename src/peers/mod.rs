use std::net::SocketAddrV4;

pub mod registry;

pub use registry::{ConnectionHandle, ConnectionId, PeerRegistry, RegistryError};

pub type PeerAddr = SocketAddrV4;

/// hard ceiling on tracked peers, the configured capacity can only lower it.
pub const MAX_PEERS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}
