//! tea-relay — development relay server for case collaboration.
//!
//! ```text
//! RUST_LOG=info tea-relay --bind 0.0.0.0:8000
//! ```

use clap::Parser;
use log::info;

use tea_collab::server::{RelayServer, ServerConfig};

#[derive(Parser)]
#[command(name = "tea-relay")]
#[command(about = "Relay server for real-time assurance case collaboration", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(short, long, env = "TEA_RELAY_BIND", default_value = "127.0.0.1:8000")]
    bind: String,

    /// Maximum sockets per case room
    #[arg(long, env = "TEA_RELAY_MAX_PEERS", default_value_t = 100)]
    max_peers: usize,

    /// Frames buffered per peer before it starts dropping
    #[arg(long, env = "TEA_RELAY_BUFFER", default_value_t = 256)]
    buffer: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let cli = Cli::parse();

    let server = RelayServer::new(ServerConfig {
        bind_addr: cli.bind,
        max_peers_per_room: cli.max_peers,
        broadcast_capacity: cli.buffer,
    });
    info!("Starting tea-relay on {}", server.bind_addr());

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
