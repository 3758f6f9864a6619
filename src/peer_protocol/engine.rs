use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use super::codec::{
    upgrade_stream, ChunkRequest, ChunkResponse, CodecError, Packet, PeerFrames, PeerStream,
    MAX_DATA_LEN,
};
use crate::hash::HashEngine;
use crate::package::{FileStatus, PackageError, PackageTable};
use crate::peers::{ConnectionHandle, ConnectionId, PeerAddr, PeerRegistry, RegistryError};
use crate::prelude::*;

/// bound on connect + announce/acknowledge for outbound peers. chunk responses have no bound.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("peer {0} is not in the peer list")]
    PeerNotConnected(PeerAddr),

    #[error("package `{0}` is not managed")]
    PackageNotManaged(String),

    #[error("chunk {0} does not belong to the package")]
    ChunkNotOwned(String),

    #[error("chunk {hash} is {len} bytes, more than a single response can carry")]
    ChunkTooLarge { hash: String, len: u32 },

    #[error("peer {0} did not acknowledge the announce")]
    HandshakeRejected(PeerAddr),

    #[error("peer {0} did not answer the announce in time")]
    HandshakeTimeout(PeerAddr),

    #[error("peer {0} did not accept the connection in time")]
    ConnectTimeout(PeerAddr),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// accepted by the listener, becomes a peer once it announces itself.
    Inbound,
    /// opened by [`ProtocolEngine::connect`], already acknowledged.
    Outbound,
    /// short lived connection carrying a single chunk request, only waits for the response.
    Fetch,
}

/// owns the peer and package tables and every connection worker.
///
/// each connection is served by its own worker task on the engine's [`TaskTracker`]. workers get
/// a child of the engine's shutdown token, so [`ProtocolEngine::shutdown`] winds all of them down
/// and waits for them, while a single peer can be closed through its [`ConnectionHandle`].
#[derive(Debug, Clone)]
pub struct ProtocolEngine {
    registry: PeerRegistry,
    packages: PackageTable,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

fn to_peer_addr(addr: SocketAddr) -> Option<PeerAddr> {
    match addr {
        SocketAddr::V4(addr) => Some(addr),
        SocketAddr::V6(addr) => addr
            .ip()
            .to_ipv4_mapped()
            .map(|ip| PeerAddr::new(ip, addr.port())),
    }
}

impl ProtocolEngine {
    pub fn new(
        registry: PeerRegistry,
        packages: PackageTable,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            registry,
            packages,
            tracker: TaskTracker::new(),
            shutdown_token,
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn packages(&self) -> &PackageTable {
        &self.packages
    }

    pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
    }

    /// accept loop. every accepted connection gets its own worker, a slow or stalled peer only
    /// ever blocks that worker.
    #[instrument(level = "info", name = "listener", skip_all, fields(addr = ?listener.local_addr().ok()))]
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("listening for peers");
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    info!("shutdown signal received, closing listener");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "failed to accept connection");
                            continue;
                        }
                    };

                    let Some(peer_addr) = to_peer_addr(addr) else {
                        warn!(%addr, "dropping connection from non ipv4 address");
                        continue;
                    };

                    info!(peer = %peer_addr, "new connection");
                    let worker = self.worker(peer_addr, Role::Inbound, ConnectionState::AwaitingHandshake);
                    self.tracker.spawn(worker.run(upgrade_stream(stream)));
                }
            }
        }
    }

    fn worker(&self, peer_addr: PeerAddr, role: Role, state: ConnectionState) -> ConnectionWorker {
        ConnectionWorker {
            engine: self.clone(),
            peer_addr,
            connection_id: self.registry.next_connection_id(),
            close_token: self.shutdown_token.child_token(),
            role,
            state,
            registered: false,
        }
    }

    /// opens a connection, announces this node and waits for the acknowledgement. the peer only
    /// shows up as connected once acknowledged, a failed or timed out attempt leaves no trace.
    #[instrument(level = "info", name = "connect", skip_all, fields(peer = %peer_addr))]
    pub async fn connect(&self, peer_addr: PeerAddr) -> Result<(), ProtocolError> {
        self.registry.reserve(peer_addr)?;

        let frames = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(peer_addr))
            .await
            .unwrap_or(Err(ProtocolError::HandshakeTimeout(peer_addr)))
            .inspect_err(|err| {
                warn!(error = %err, "handshake failed");
                self.registry.discard(peer_addr);
            })?;

        let mut worker = self.worker(peer_addr, Role::Outbound, ConnectionState::Ready);
        worker.registered = true;
        self.registry.promote(peer_addr, worker.handle());
        self.tracker.spawn(worker.run(frames));

        info!(peers = self.registry.len(), "connection established with peer");
        Ok(())
    }

    /// removes the peer and asks its worker to send the disconnect notice and close the socket.
    #[instrument(level = "info", name = "disconnect", skip_all, fields(peer = %peer_addr))]
    pub fn disconnect(&self, peer_addr: PeerAddr) -> Result<(), ProtocolError> {
        let connection = self.registry.remove(peer_addr)?;
        connection.close();
        info!("disconnected from peer");
        Ok(())
    }

    /// sends a request for one chunk on a fresh connection and returns without waiting. the
    /// response is picked up by the worker that takes over the connection.
    #[instrument(level = "info", name = "fetch", skip_all, fields(peer = %peer_addr, hash = %chunk_hash))]
    pub async fn fetch_chunk(
        &self,
        peer_addr: PeerAddr,
        ident: &str,
        chunk_hash: &str,
        offset: u32,
    ) -> Result<(), ProtocolError> {
        if !self.registry.is_connected(peer_addr) {
            return Err(ProtocolError::PeerNotConnected(peer_addr));
        }
        let store = self
            .packages
            .get(ident)
            .ok_or_else(|| ProtocolError::PackageNotManaged(ident.to_string()))?;
        let (_, chunk) = store
            .package()
            .find_chunk(chunk_hash, Some(offset))
            .ok_or_else(|| ProtocolError::ChunkNotOwned(chunk_hash.to_string()))?;

        let request = ChunkRequest {
            offset: chunk.offset,
            data_len: chunk.length.min(MAX_DATA_LEN as u32) as u16,
            chunk_hash: chunk.hash.clone(),
            ident: ident.to_string(),
        };

        let mut frames = open_connection(peer_addr, HANDSHAKE_TIMEOUT).await?;
        frames.send(Packet::ChunkRequest(request)).await?;
        // half close, the serving side finishes once it has answered
        frames.get_mut().shutdown().await?;

        let worker = self.worker(peer_addr, Role::Fetch, ConnectionState::Ready);
        self.tracker.spawn(worker.run(frames));
        debug!("chunk request sent");
        Ok(())
    }

    async fn serve_chunk(&self, request: ChunkRequest) -> Result<ChunkResponse, ProtocolError> {
        let store = self
            .packages
            .get(&request.ident)
            .ok_or_else(|| ProtocolError::PackageNotManaged(request.ident.clone()))?;
        let (_, chunk) = store
            .package()
            .find_chunk(&request.chunk_hash, Some(request.offset))
            .ok_or_else(|| PackageError::ChunkNotFound(request.chunk_hash.clone()))?;

        if chunk.length as usize > MAX_DATA_LEN {
            return Err(ProtocolError::ChunkTooLarge {
                hash: chunk.hash.clone(),
                len: chunk.length,
            });
        }

        let data = store.read_chunk(chunk).await?;
        debug!(offset = chunk.offset, len = data.len(), "serving chunk");
        Ok(ChunkResponse {
            offset: chunk.offset,
            data: data.into(),
            chunk_hash: request.chunk_hash,
            ident: request.ident,
        })
    }

    /// verifies a received chunk before anything touches the disk. data that doesn't hash to the
    /// chunk's expected digest, or doesn't fit the chunk's range exactly, is dropped and the chunk
    /// stays incomplete. returns whether the data was stored.
    async fn accept_chunk(&self, response: ChunkResponse) -> Result<bool, ProtocolError> {
        let store = self
            .packages
            .get(&response.ident)
            .ok_or_else(|| ProtocolError::PackageNotManaged(response.ident.clone()))?;
        let (index, chunk) = store
            .package()
            .find_chunk(&response.chunk_hash, Some(response.offset))
            .ok_or_else(|| PackageError::ChunkNotFound(response.chunk_hash.clone()))?;

        if chunk.offset != response.offset || response.data.len() != chunk.length as usize {
            warn!(
                offset = response.offset,
                len = response.data.len(),
                chunk_offset = chunk.offset,
                chunk_len = chunk.length,
                "chunk response does not cover the chunk range, dropped"
            );
            return Ok(false);
        }

        let computed = HashEngine::hex_digest_of(&response.data);
        if computed != chunk.hash {
            warn!(%computed, expected = %chunk.hash, "chunk failed integrity check, dropped");
            return Ok(false);
        }

        if store.is_chunk_completed(index) {
            debug!(chunk = index, "chunk already completed, ignoring");
            return Ok(false);
        }

        if store.file_check().await? == FileStatus::Created {
            warn!(path = %store.path().display(), "data file was missing and has been recreated");
        }
        store.write_chunk(chunk.offset, &response.data).await?;
        if store.mark_completed(index) {
            info!(chunk = index, ident = %response.ident, "chunk verified and stored");
        }
        Ok(true)
    }

    /// cancels every worker and the listener, then waits for the workers to finish.
    pub async fn shutdown(&self) {
        if !self.registry.is_empty() {
            info!(peers = self.registry.len(), "disconnecting peers");
        }
        info!("shutting down, closing all connections");
        self.shutdown_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn open_connection(
    peer_addr: PeerAddr,
    limit: Duration,
) -> Result<PeerFrames<TcpStream>, ProtocolError> {
    let stream = tokio::time::timeout(limit, TcpStream::connect(peer_addr))
        .await
        .map_err(|_| ProtocolError::ConnectTimeout(peer_addr))??;
    Ok(upgrade_stream(stream))
}

async fn handshake(peer_addr: PeerAddr) -> Result<PeerFrames<TcpStream>, ProtocolError> {
    debug!("connecting to peer");
    let mut frames = open_connection(peer_addr, HANDSHAKE_TIMEOUT).await?;

    debug!("sending announce");
    frames.send(Packet::Announce).await?;

    match frames.next().await {
        Some(Ok(Packet::Acknowledge)) => Ok(frames),
        Some(Ok(other)) => {
            warn!(code = other.code(), "peer answered the announce with something else");
            Err(ProtocolError::HandshakeRejected(peer_addr))
        }
        Some(Err(err)) => Err(err.into()),
        None => Err(ProtocolError::HandshakeRejected(peer_addr)),
    }
}

struct ConnectionWorker {
    engine: ProtocolEngine,
    peer_addr: PeerAddr,
    connection_id: ConnectionId,
    close_token: CancellationToken,
    role: Role,
    state: ConnectionState,
    registered: bool,
}

impl ConnectionWorker {
    fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.connection_id, self.close_token.clone())
    }

    /// reads one frame at a time until the peer leaves, the socket fails or the worker is told
    /// to close. none of those is an error, they are all just the way a connection ends.
    #[instrument(level = "info", name = "connection", skip_all, fields(peer = %self.peer_addr, role = ?self.role))]
    async fn run<T: PeerStream>(mut self, mut frames: PeerFrames<T>) {
        while self.state != ConnectionState::Closed {
            tokio::select! {
                _ = self.close_token.cancelled() => {
                    if self.state == ConnectionState::Ready && self.role != Role::Fetch {
                        debug!("sending disconnect notice");
                        if let Err(err) = frames.send(Packet::DisconnectNotice).await {
                            debug!(error = %err, "could not deliver disconnect notice");
                        }
                    }
                    self.state = ConnectionState::Closed;
                }

                frame = frames.next() => match frame {
                    Some(Ok(packet)) => self.dispatch(&mut frames, packet).await,
                    Some(Err(err)) => {
                        warn!(error = %err, "connection failed");
                        self.state = ConnectionState::Closed;
                    }
                    None => {
                        debug!("peer closed the connection");
                        self.state = ConnectionState::Closed;
                    }
                }
            }
        }

        if self.registered {
            self.engine.registry.release(self.peer_addr, self.connection_id);
        }
        info!("connection closed");
    }

    async fn dispatch<T: PeerStream>(&mut self, frames: &mut PeerFrames<T>, packet: Packet) {
        type P = Packet;
        match packet {
            P::Announce => self.accept_announce(frames).await,
            P::Acknowledge => debug!("stray acknowledge ignored"),
            P::DisconnectNotice => {
                info!("peer sent disconnect notice");
                self.state = ConnectionState::Closed;
            }
            P::ChunkRequest(request) => {
                let span = debug_span!("chunk request", hash = %request.chunk_hash, offset = request.offset);
                let served = self.engine.serve_chunk(request).instrument(span).await;
                match served {
                    Ok(response) => {
                        if let Err(err) = frames.send(Packet::ChunkResponse(response)).await {
                            warn!(error = %err, "failed to send chunk response");
                            self.state = ConnectionState::Closed;
                        }
                    }
                    Err(err) => warn!(error = %err, "chunk request rejected"),
                }
            }
            P::ChunkResponse(_) if self.state != ConnectionState::Ready => {
                debug!("chunk response before handshake ignored");
            }
            P::ChunkResponse(response) => {
                let span = debug_span!("chunk response", hash = %response.chunk_hash, offset = response.offset);
                if let Err(err) = self.engine.accept_chunk(response).instrument(span).await {
                    warn!(error = %err, "chunk response dropped");
                }
            }
            P::Malformed { code, reason } => warn!(code, reason, "malformed packet ignored"),
            P::Unknown(code) => debug!(code, "unknown packet ignored"),
        }
    }

    async fn accept_announce<T: PeerStream>(&mut self, frames: &mut PeerFrames<T>) {
        match (self.state, self.role) {
            (ConnectionState::AwaitingHandshake, Role::Inbound) => {
                if let Err(err) = self
                    .engine
                    .registry
                    .register_inbound(self.peer_addr, self.handle())
                {
                    warn!(error = %err, "rejecting peer");
                    self.state = ConnectionState::Closed;
                    return;
                }
                self.registered = true;
                self.state = ConnectionState::Ready;
                info!(peers = self.engine.registry.len(), "peer connected");
            }
            (ConnectionState::Ready, _) => debug!("repeated announce, acknowledging again"),
            _ => {
                debug!("announce ignored");
                return;
            }
        }

        if let Err(err) = frames.send(Packet::Acknowledge).await {
            warn!(error = %err, "failed to acknowledge announce");
            self.state = ConnectionState::Closed;
        }
    }
}
