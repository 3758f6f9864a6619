mod cli;
mod command;
mod config;
mod hash;
mod package;
mod peer_protocol;
mod peers;
mod prelude;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use cli::{CheckQuery, Cli, Mode};
use command::{Command, Outcome};
use config::{Config, ConfigError};
use prelude::*;

use tokio::sync::mpsc;
use tokio::task;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;

use package::{IntegrityTree, LeafDigests, PackageStore, PackageTable};
use peer_protocol::ProtocolEngine;
use peers::PeerRegistry;

use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, registry::Registry, Layer};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(&cli.log_level) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Mode::Serve { config } => run_node(&config).await,
        Mode::Check { descriptor, query } => run_check(&descriptor, query).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            let code = err
                .downcast_ref::<ConfigError>()
                .map_or(1, ConfigError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level `{level}`"))?;

    // stdout belongs to the command prompt
    let fmt_layer = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let subscriber = Registry::default().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("could not set global tracing subscriber")
}

async fn run_node(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)
        .await
        .with_context(|| format!("invalid configuration {}", config_path.display()))?;
    let shutdown_token = CancellationToken::new();
    let engine = ProtocolEngine::new(
        PeerRegistry::new(config.max_peers),
        PackageTable::new(),
        shutdown_token,
    );
    let listener = ProtocolEngine::bind(config.port)
        .await
        .with_context(|| format!("could not listen on port {}", config.port))?;
    info!(
        directory = %config.directory.display(),
        max_peers = engine.registry().capacity(),
        port = config.port,
        "node started"
    );

    let mut join_set = task::JoinSet::<anyhow::Result<()>>::new();
    join_set.spawn({
        let engine = engine.clone();
        async move { engine.serve(listener).await }
    });
    join_set.spawn(command_loop(engine.clone(), config.directory));

    let result = tokio::select! {
        Ok(_) = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
        Some(joined) = join_set.join_next() => joined.context("node task panicked").and_then(|result| result),
    };

    engine.shutdown().await;
    join_set.shutdown().await;
    result
}

#[instrument(level = "info", name = "commands", skip_all)]
async fn command_loop(engine: ProtocolEngine, directory: PathBuf) -> anyhow::Result<()> {
    let mut lines = stdin_lines();

    prompt()?;
    while let Some(line) = lines.next().await {
        if line.trim().is_empty() {
            prompt()?;
            continue;
        }

        match line.parse::<Command>() {
            Ok(command) => match command::dispatch(command, &engine, &directory).await {
                Outcome::Reply(reply) => println!("{reply}"),
                Outcome::Silent => {}
                Outcome::Quit => {
                    info!("quit requested");
                    return Ok(());
                }
            },
            Err(err) => println!("{err}"),
        }
        prompt()?;
    }

    info!("stdin closed");
    Ok(())
}

fn prompt() -> anyhow::Result<()> {
    print!("> ");
    std::io::stdout().flush().context("could not write prompt")
}

/// stdin is read on a plain thread, a blocked read must not hold up runtime shutdown.
fn stdin_lines() -> ReceiverStream<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

async fn run_check(descriptor_path: &Path, query: CheckQuery) -> anyhow::Result<()> {
    let package = package::descriptor::load(descriptor_path)
        .await
        .with_context(|| format!("could not parse {}", descriptor_path.display()))?;

    let hashes = if query == CheckQuery::AllHashes {
        // expected hashes only, the data file is never touched
        let leaves: Vec<_> = package
            .chunks
            .iter()
            .map(|chunk| LeafDigests {
                expected: chunk.hash.clone(),
                computed: chunk.hash.clone(),
            })
            .collect();
        IntegrityTree::build(&leaves, &package.hashes)?.all_hashes()
    } else {
        let directory = descriptor_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let (store, status) = PackageStore::open(package, directory)
            .await
            .context("could not open the package data file")?;

        match query {
            CheckQuery::FileCheck => {
                println!("{status}");
                return Ok(());
            }
            CheckQuery::ChunkCheck => store.completed_chunk_hashes(),
            CheckQuery::MinHashes => store.min_completed_hashes(),
            CheckQuery::HashesOf { hash } => store.chunk_hashes_under(&hash)?,
            CheckQuery::AllHashes => store.all_hashes(),
        }
    };

    for hash in hashes {
        println!("{hash}");
    }
    Ok(())
}
