mod classify;
mod cli;
mod config;
mod divert;
mod engine;
mod synth;

use clap::Parser as _;
use tracing::info;

use crate::config::Config;
use crate::engine::Engine;

#[cfg(not(target_os = "linux"))]
compile_error!("the capture backend requires Linux (AF_PACKET + raw sockets)");

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    let config = Config::load(&cli)?;
    info!(
        event_name = "startup",
        interface = %config.interface,
        mode = ?config.mode,
        "opening capture socket"
    );

    let divert = divert::afpacket::AfPacketDivert::open(&config.interface)?;
    let mut engine = Engine::new(divert, config.mode, config.filter, &config.body);
    engine.run()?;
    Ok(())
}
