//! Hub server entry point.
//!
//! ```text
//! hub-server                        Run with ./hub-server.json
//! hub-server --config <path>        Load a custom JSON config
//! hub-server --port 4000            Override the configured port
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use hub_core::{
    ConfigStore, HubServer, ListenerConfig, Payload, ServerConfig, ServerEvent, ServerOptions,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "hub-server", about = "Hub relay server")]
struct Cli {
    /// Path to the JSON configuration file. Created if missing.
    #[arg(short, long, default_value = "hub-server.json")]
    config: PathBuf,

    /// TCP port to listen on (UDP uses the next port). Overrides the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("hub-server v{} (protocol {})", hub_core::VERSION, hub_core::VERSION_CODE);

    let mut store = ConfigStore::open(&cli.config)?;
    let config = ServerConfig::load(&mut store)?;
    let port = cli.port.unwrap_or(config.port);

    let options = ServerOptions {
        listener: ListenerConfig::new(port),
        settings: config.settings,
        ..ServerOptions::default()
    };
    let server = HubServer::start(options, info_span!("server")).await?;
    let mut events = server.subscribe();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ServerEvent::UserConnected(user) => {
                        info!(id = %user.id, name = %user.name, "user connected");
                    }
                    ServerEvent::UserDisconnected(user) => {
                        info!(id = %user.id, name = %user.name, "user disconnected");
                    }
                    ServerEvent::UserUpdated(user) => {
                        info!(id = %user.id, name = %user.name, "user updated");
                    }
                    ServerEvent::AckReceived { peer, ack } => {
                        info!(%peer, packet = %ack.packet_id, "acknowledged");
                    }
                    ServerEvent::UdpPacket { from, packet } => {
                        info!(%from, packet = %packet.summary(), "udp packet");
                    }
                    ServerEvent::PacketReceived { peer, packet } => {
                        if let Payload::Command(command) = &packet.payload {
                            if !matches!(command.command_type, hub_core::CommandType::Heartbeat) {
                                warn!(%peer, command = %command.command_type, "unhandled command");
                            }
                        }
                    }
                }
            }
        }
    }

    server.shutdown().await;
    let state = server.state().await;
    info!(users = state.len(), "stopped");
    Ok(())
}
