use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::package::{descriptor, PackageError, PackageStore};
use crate::peer_protocol::{ProtocolEngine, ProtocolError};
use crate::peers::{PeerAddr, RegistryError};
use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(PeerAddr),
    Disconnect(PeerAddr),
    AddPackage(PathBuf),
    RemovePackage(String),
    Packages,
    Peers,
    Fetch {
        peer: PeerAddr,
        ident: String,
        hash: String,
        offset: u32,
    },
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("Missing address and port argument.")]
    MissingAddress,

    #[error("Invalid address `{0}`, expected an ipv4 address and port.")]
    InvalidAddress(String),

    #[error("Missing file argument.")]
    MissingFile,

    #[error("Missing identifier argument, please specify whole 1024 character or at least 20 characters.")]
    MissingIdent,

    #[error("Missing arguments from command.")]
    MissingFetchArguments,

    #[error("Invalid offset `{0}`.")]
    InvalidOffset(String),

    #[error("Invalid Input.")]
    Unknown,
}

fn peer_addr(arg: Option<&str>) -> Result<PeerAddr, CommandError> {
    let arg = arg.ok_or(CommandError::MissingAddress)?;
    arg.parse()
        .map_err(|_| CommandError::InvalidAddress(arg.to_string()))
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(word, rest)| (word, rest.trim()));
        let mut args = rest.split_whitespace();

        let command = match word {
            "CONNECT" => Self::Connect(peer_addr(args.next())?),
            "DISCONNECT" => Self::Disconnect(peer_addr(args.next())?),
            "ADDPACKAGE" if rest.is_empty() => return Err(CommandError::MissingFile),
            "ADDPACKAGE" => Self::AddPackage(rest.into()),
            "REMPACKAGE" => Self::RemovePackage(
                args.next().ok_or(CommandError::MissingIdent)?.to_string(),
            ),
            "PACKAGES" => Self::Packages,
            "PEERS" => Self::Peers,
            "FETCH" => {
                let (Some(peer), Some(ident), Some(hash)) = (args.next(), args.next(), args.next())
                else {
                    return Err(CommandError::MissingFetchArguments);
                };
                let offset = match args.next() {
                    Some(offset) => offset
                        .parse()
                        .map_err(|_| CommandError::InvalidOffset(offset.to_string()))?,
                    None => 0,
                };
                Self::Fetch {
                    peer: peer_addr(Some(peer))?,
                    ident: ident.to_string(),
                    hash: hash.to_string(),
                    offset,
                }
            }
            "QUIT" => Self::Quit,
            _ => return Err(CommandError::Unknown),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(String),
    Silent,
    Quit,
}

impl From<String> for Outcome {
    fn from(reply: String) -> Self {
        Self::Reply(reply)
    }
}

impl From<&str> for Outcome {
    fn from(reply: &str) -> Self {
        Self::Reply(reply.to_string())
    }
}

/// loads a descriptor and verifies whatever data already sits in `directory`.
pub async fn load_package(path: &Path, directory: &Path) -> anyhow::Result<PackageStore> {
    let package = descriptor::load(path)
        .await
        .with_context(|| format!("could not parse {}", path.display()))?;
    let (store, status) = PackageStore::open(package, directory)
        .await
        .with_context(|| format!("could not open the data file for {}", path.display()))?;
    debug!(ident = store.ident(), %status, "package data file ready");
    Ok(store)
}

/// runs one command against the node. `directory` is where package data files live.
#[instrument(level = "debug", name = "command", skip(engine, directory))]
pub async fn dispatch(command: Command, engine: &ProtocolEngine, directory: &Path) -> Outcome {
    match command {
        Command::Connect(peer) => match engine.connect(peer).await {
            Ok(()) => "Connection established with peer.".into(),
            Err(ProtocolError::Registry(RegistryError::CapacityExceeded(_))) => {
                "Maximum number of peers reached.".into()
            }
            Err(ProtocolError::Registry(RegistryError::AlreadyConnected(_))) => {
                "Already connected to peer.".into()
            }
            Err(ProtocolError::HandshakeRejected(_)) => "ACK not received.".into(),
            Err(err) => format!("Connection failed: {err}").into(),
        },

        Command::Disconnect(peer) => match engine.disconnect(peer) {
            Ok(()) => "Disconnected from peer.".into(),
            Err(_) => "Unknown peer, not connected.".into(),
        },

        Command::AddPackage(path) => {
            let store = match load_package(&path, directory).await {
                Ok(store) => store,
                Err(err) => {
                    warn!(error = ?err, "failed to add package");
                    return "Unable to parse bpkg file.".into();
                }
            };
            match engine.packages().add(store) {
                Ok(_) => "Package loaded successfully.".into(),
                Err(PackageError::AlreadyManaged(_)) => "Package is already managed.".into(),
                Err(err) => format!("Unable to add package: {err}").into(),
            }
        }

        Command::RemovePackage(ident) => match engine.packages().remove(&ident) {
            Ok(_) => "Package removed successfully.".into(),
            Err(_) => "Identifier provided does not match managed packages.".into(),
        },

        Command::Packages => {
            let packages = engine.packages().list();
            if packages.is_empty() {
                return "No packages managed.".into();
            }
            packages
                .iter()
                .enumerate()
                .map(|(i, package)| {
                    let status = if package.complete { "COMPLETED" } else { "INCOMPLETE" };
                    format!("{}. {}, {} : {status}", i + 1, package.ident, package.filename)
                })
                .collect::<Vec<_>>()
                .join("\n")
                .into()
        }

        Command::Peers => {
            let peers = engine.registry().list();
            if peers.is_empty() {
                return "Not connected to any peers".into();
            }
            let listing: Vec<_> = peers
                .iter()
                .enumerate()
                .map(|(i, peer)| format!("{}. {peer}", i + 1))
                .collect();
            format!("Connected to:\n{}", listing.join("\n")).into()
        }

        Command::Fetch {
            peer,
            ident,
            hash,
            offset,
        } => match engine.fetch_chunk(peer, &ident, &hash, offset).await {
            Ok(()) => Outcome::Silent,
            Err(ProtocolError::PeerNotConnected(_)) => {
                "Unable to request chunk, peer not in list".into()
            }
            Err(ProtocolError::PackageNotManaged(_)) => {
                "Unable to request chunk, package is not managed".into()
            }
            Err(ProtocolError::ChunkNotOwned(_)) => {
                "Unable to request chunk, chunk hash does not belong to package".into()
            }
            Err(err) => format!("Unable to request chunk: {err}").into(),
        },

        Command::Quit => Outcome::Quit,
    }
}
