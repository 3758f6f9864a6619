use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "bytetide", version, about = "peer to peer package sharing node")]
pub struct Cli {
    /// tracing filter, e.g. `debug` or `bytetide::peer_protocol=trace`. RUST_LOG wins when set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Mode,
}

#[derive(Subcommand, Debug)]
pub enum Mode {
    /// run a node: listen for peers and read commands from stdin
    Serve {
        /// configuration file with `directory`, `max_peers` and `port`
        config: PathBuf,
    },

    /// query a package descriptor and its data file without starting a node
    Check {
        /// package descriptor, the data file is looked up next to it
        descriptor: PathBuf,

        #[command(subcommand)]
        query: CheckQuery,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CheckQuery {
    /// every hash in the tree, internal nodes first
    AllHashes,
    /// hashes of the chunks whose data is present and valid
    ChunkCheck,
    /// smallest set of hashes covering the completed chunks
    MinHashes,
    /// chunk hashes under the given node
    HashesOf { hash: String },
    /// create the data file if it's missing
    FileCheck,
}
