//! CTF broker — the two-player capture-the-flag game broker.
//!
//! Accepts TCP peers, pairs them into games, and runs the session manager
//! implemented in the library crate: Framer, Policy, Game, Session worker,
//! Dispatcher, Lifecycle.

use anyhow::Result;
use clap::Parser;
use ctf_broker::Registry;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ctf-broker")]
#[command(version)]
#[command(about = "Two-player capture-the-flag game broker")]
struct Cli {
    /// TCP port to listen on.
    port: u16,

    /// Override the default game-slot capacity.
    #[arg(long, default_value_t = ctf_broker::constants::MAX_GAMES)]
    max_games: usize,

    /// Raise logging verbosity (stacks: -v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.max_games != ctf_broker::constants::MAX_GAMES {
        log::warn!(
            "--max-games={} ignored: registry capacity is a compile-time constant ({})",
            cli.max_games,
            ctf_broker::constants::MAX_GAMES
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(cli.port))
}

async fn run(port: u16) -> Result<()> {
    let stop_rx = ctf_broker::lifecycle::install()?;
    let listener = ctf_broker::dispatcher::bind(port).await?;
    log::info!("ctf-broker listening on 0.0.0.0:{port}");

    let registry = Arc::new(Registry::new());
    ctf_broker::dispatcher::run(listener, registry, stop_rx).await?;

    log::info!("ctf-broker shut down cleanly");
    std::process::exit(ctf_broker::lifecycle::exit_code());
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}
