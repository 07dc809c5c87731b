use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use bc_broker::cli::{init_tracing, load_config, Cli, Command};
use bc_broker::consumers::gatekeeper::{ConsumerAuthenticator, TokenAuthenticator};
use bc_broker::consumers::ws;
use bc_broker::runtime::coordinator::SessionCoordinator;
use bc_broker::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Arc::new(load_config(cli.config.as_ref())?);
            run_server(config).await
        }
        Some(Command::ConfigValidate) => {
            let config = load_config(cli.config.as_ref())?;
            println!("config ok: {}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_server(config: Arc<bc_domain::config::BrokerConfig>) -> anyhow::Result<()> {
    // Optional pre-shared consumer token.
    let authenticator: Option<Arc<dyn ConsumerAuthenticator>> =
        std::env::var("BC_CONSUMER_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(|token| Arc::new(TokenAuthenticator::new(token)) as Arc<dyn ConsumerAuthenticator>);
    if authenticator.is_some() {
        tracing::info!("consumer token authentication enabled");
    } else {
        tracing::info!("no consumer token configured, anonymous access enabled");
    }

    let coordinator = SessionCoordinator::new(config.clone(), authenticator, None, None)
        .context("initializing coordinator")?;
    let state = AppState::new(coordinator.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "beamcode listening");

    let app = ws::router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    coordinator.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
