//! Hub client entry point.
//!
//! ```text
//! hub-client --name alice                       Join localhost:10356 as a user
//! hub-client --host 10.0.0.2 --observer         Watch the roster without joining
//! hub-client --name bob --relay hello --to <id> Send a custom command to a peer
//! ```

use clap::Parser;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use hub_core::{
    ClientEvent, ClientOptions, Command, CommandType, ConnectionInfo, HubClient, Packet, PeerId,
    DEFAULT_PORT,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "hub-client", about = "Hub relay client")]
struct Cli {
    /// Server host name or address.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server TCP port (UDP uses the next port).
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Display name announced to the server.
    #[arg(short, long, default_value = "client")]
    name: String,

    /// Join as a read-only observer instead of a roster user.
    #[arg(long)]
    observer: bool,

    /// Server password, if one is configured.
    #[arg(long, default_value = "")]
    password: String,

    /// Custom command to relay once connected.
    #[arg(long)]
    relay: Option<String>,

    /// Destination peer ids for `--relay`. Defaults to every other user.
    #[arg(long = "to")]
    to: Vec<PeerId>,

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

    info!("hub-client v{} (protocol {})", hub_core::VERSION, hub_core::VERSION_CODE);

    let options = if cli.observer {
        ClientOptions::observer(&cli.name)
    } else {
        ClientOptions::user(&cli.name)
    };
    let options = ClientOptions {
        password: cli.password.clone(),
        ..options
    };

    let info = ConnectionInfo::new(cli.host.clone(), cli.port);
    let client = HubClient::new(info, options, info_span!("client", name = %cli.name));
    let mut events = client.subscribe();

    if let Err(e) = client.start().await {
        warn!(error = %e, "initial connect failed, will keep retrying");
    }

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
                    ClientEvent::ConnectedToServer(response) => {
                        let users = response.state.as_ref().map(|s| s.len()).unwrap_or(0);
                        info!(message = %response.response.message, users, "connected");
                        for user in client.state().users() {
                            info!(id = %user.id, name = %user.name, "in roster");
                        }
                        if let Some(text) = &cli.relay {
                            relay(&client, text, &cli.to).await;
                        }
                    }
                    ClientEvent::FailedToConnect(Some(response)) => {
                        error!(message = %response.response.message, "server refused connection");
                    }
                    ClientEvent::FailedToConnect(None) => warn!("server unreachable, retrying"),
                    ClientEvent::ServerDisconnected => warn!("server disconnected"),
                    ClientEvent::UserAdded(user) => {
                        info!(id = %user.id, name = %user.name, "user joined");
                    }
                    ClientEvent::UserUpdated(user) => {
                        info!(id = %user.id, name = %user.name, "user updated");
                    }
                    ClientEvent::UserLeft(user) => {
                        info!(id = %user.id, name = %user.name, "user left");
                    }
                    ClientEvent::AckReceived { ack, from } => {
                        info!(%from, packet = %ack.packet_id, "acknowledged");
                    }
                    ClientEvent::FrameReceived(frame) => {
                        info!(file = %frame.file_id, timestamp = frame.timestamp, bytes = frame.data.len(), "frame");
                    }
                    ClientEvent::PacketReceived(packet) => {
                        if let hub_core::Payload::Command(Command {
                            command_type: CommandType::Custom(text),
                        }) = &packet.payload
                        {
                            info!(from = %packet.from, %text, "command");
                        }
                    }
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn relay(client: &HubClient, text: &str, to: &[PeerId]) {
    let me = client.self_user().map(|u| u.id);
    let targets: Vec<PeerId> = if to.is_empty() {
        client
            .state()
            .users()
            .map(|u| u.id)
            .filter(|id| Some(*id) != me)
            .collect()
    } else {
        to.to_vec()
    };

    let packet = Packet::new(Command {
        command_type: CommandType::Custom(text.to_string()),
    });
    match client.send_to(&targets, packet).await {
        Ok(()) => info!(peers = targets.len(), %text, "relayed"),
        Err(e) => error!(error = %e, "relay failed"),
    }
}
