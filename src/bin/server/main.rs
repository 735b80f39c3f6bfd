//! chatrelay-server: the central relay of the chat system.
//!
//! This server handles:
//! - Client registration, login, and session management
//! - Broadcast, unicast, and group (multicast) message routing
//! - File-transfer forwarding and the durable activity log

mod config;
mod connection;
mod handlers;
mod state;
mod store;

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::Config;
use connection::handle_connection;
use state::ServerState;
use store::Stores;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load_or_default("chatrelay.toml")?;

    println!("╔════════════════════════════════════════╗");
    println!("║            chatrelay server            ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Port: {:<33}║", config.port);
    println!("║ Max users: {:<28}║", config.max_users);
    println!("╚════════════════════════════════════════╝");

    let state = Arc::new(RwLock::new(ServerState::new()));
    let stores = Arc::new(Stores::open(&config)?);

    // The only process-fatal failure: the listening socket itself.
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    info!("listening on {}:{}", config.host, config.port);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let state = state.clone();
        let stores = stores.clone();
        let config = config.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, state, stores, config).await {
                warn!(%addr, error = %e, "connection error");
            }
        });
    }
}
