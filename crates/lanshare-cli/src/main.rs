// SPDX-License-Identifier: AGPL-3.0
// LanShare CLI - Interactive frontend

mod bridge;
mod cli;
mod commands;
mod shell;

use clap::Parser;
use cli::Cli;
use lanshare_core::{
    detect_lan_address, AppError, ConnectionServer, ServerState, SettingsStore, SharedStore,
};
use std::process::ExitCode;
use std::sync::Arc;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let level = cli.log_level();
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in [format!("lanshare_cli={}", level), format!("lanshare_core={}", level)] {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting LanShare v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let settings_store = Arc::new(match &cli.settings {
        Some(path) => SettingsStore::open(path)?,
        None => SettingsStore::new()?,
    });
    let mut settings = settings_store.get();
    cli.apply(&mut settings);
    settings.validate()?;

    let local_address = detect_lan_address();
    let store = Arc::new(SharedStore::open(
        &settings.shared_dir,
        local_address.to_string(),
        settings.public_mode,
    )?);

    let state = Arc::new(ServerState::from_settings(Arc::clone(&store), &settings));
    let server = ConnectionServer::bind_lan(state, settings.port).await?.spawn()?;

    println!(
        "{} is sharing {} at {} ({} mode)",
        settings.device_name,
        store.root().display(),
        server.local_addr(),
        if settings.public_mode { "Public" } else { "Private" }
    );

    let bridge = bridge::EngineBridge::start(&settings, local_address, server);
    shell::Shell::new(store, settings_store, bridge).run().await
}
