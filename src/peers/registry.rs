use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::{PeerAddr, PeerState, MAX_PEERS};

pub type ConnectionId = u64;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("peer table is full ({0} peers)")]
    CapacityExceeded(usize),

    #[error("unknown peer {0}, not connected")]
    PeerNotFound(PeerAddr),

    #[error("peer {0} is already connected")]
    AlreadyConnected(PeerAddr),
}

/// live connection of a registered peer. the socket itself stays with the worker that owns it,
/// the handle can only ask that worker to wind the connection down.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    close_token: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, close_token: CancellationToken) -> Self {
        Self { id, close_token }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// the owning worker sends a disconnect notice and drops the socket.
    pub fn close(&self) {
        self.close_token.cancel();
    }
}

#[derive(Debug)]
struct PeerEntry {
    state: PeerState,
    connection: Option<ConnectionHandle>,
}

#[derive(Debug)]
struct Peers {
    entries: HashMap<PeerAddr, PeerEntry>,
    capacity: usize,
}

/// bounded table of known peers.
///
/// an outbound connection reserves its slot in the `Connecting` state before any network I/O, so
/// concurrent connects can never overshoot the capacity or race on the same address. the lock is
/// only ever held while the map is touched.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    peers: Arc<Mutex<Peers>>,
    next_connection_id: Arc<AtomicU64>,
}

impl PeerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: Arc::new(Mutex::new(Peers {
                entries: HashMap::new(),
                capacity: capacity.min(MAX_PEERS),
            })),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Peers> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    fn admit(peers: &Peers, addr: PeerAddr) -> Result<(), RegistryError> {
        if peers.entries.contains_key(&addr) {
            return Err(RegistryError::AlreadyConnected(addr));
        }
        if peers.entries.len() >= peers.capacity {
            return Err(RegistryError::CapacityExceeded(peers.capacity));
        }
        Ok(())
    }

    /// claims a slot for an outbound connection attempt.
    pub fn reserve(&self, addr: PeerAddr) -> Result<(), RegistryError> {
        let mut peers = self.lock();
        Self::admit(&peers, addr)?;
        peers.entries.insert(
            addr,
            PeerEntry {
                state: PeerState::Connecting,
                connection: None,
            },
        );
        Ok(())
    }

    /// completes a reservation once the peer acknowledged the announce.
    pub fn promote(&self, addr: PeerAddr, connection: ConnectionHandle) {
        let mut peers = self.lock();
        peers.entries.insert(
            addr,
            PeerEntry {
                state: PeerState::Connected,
                connection: Some(connection),
            },
        );
    }

    /// drops a reservation whose handshake failed. connected entries are left alone.
    pub fn discard(&self, addr: PeerAddr) {
        let mut peers = self.lock();
        if peers
            .entries
            .get(&addr)
            .is_some_and(|entry| entry.state == PeerState::Connecting)
        {
            peers.entries.remove(&addr);
        }
    }

    /// registers a peer that announced itself on an inbound connection.
    pub fn register_inbound(
        &self,
        addr: PeerAddr,
        connection: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        let mut peers = self.lock();
        Self::admit(&peers, addr)?;
        peers.entries.insert(
            addr,
            PeerEntry {
                state: PeerState::Connected,
                connection: Some(connection),
            },
        );
        Ok(())
    }

    /// takes a connected peer out of the table, handing back its connection so the caller can
    /// close it outside the lock.
    pub fn remove(&self, addr: PeerAddr) -> Result<ConnectionHandle, RegistryError> {
        let mut peers = self.lock();
        match peers.entries.get(&addr) {
            Some(PeerEntry {
                state: PeerState::Connected,
                connection: Some(_),
            }) => {}
            _ => return Err(RegistryError::PeerNotFound(addr)),
        }
        peers
            .entries
            .remove(&addr)
            .and_then(|entry| entry.connection)
            .ok_or(RegistryError::PeerNotFound(addr))
    }

    /// called by a worker on its way out. only removes the entry if it still belongs to that
    /// worker's connection, a newer connection to the same address is left alone.
    pub fn release(&self, addr: PeerAddr, id: ConnectionId) -> bool {
        let mut peers = self.lock();
        let owned = peers
            .entries
            .get(&addr)
            .and_then(|entry| entry.connection.as_ref())
            .is_some_and(|connection| connection.id() == id);
        if owned {
            peers.entries.remove(&addr);
        }
        owned
    }

    pub fn state(&self, addr: PeerAddr) -> PeerState {
        self.lock()
            .entries
            .get(&addr)
            .map_or(PeerState::Disconnected, |entry| entry.state)
    }

    pub fn is_connected(&self, addr: PeerAddr) -> bool {
        self.state(addr) == PeerState::Connected
    }

    /// snapshot of the connected peers, ordered by address.
    pub fn list(&self) -> Vec<PeerAddr> {
        let mut connected: Vec<_> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == PeerState::Connected)
            .map(|(addr, _)| *addr)
            .collect();
        connected.sort();
        connected
    }

    /// connected and connecting peers, i.e. the slots in use.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }
}
