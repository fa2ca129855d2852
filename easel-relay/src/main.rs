//! Easel relay - WebSocket fan-out for collaborative whiteboards.
//!
//! Peers connect to `ws://<bind>/<room>`; every frame is relayed to the
//! other peers of the same room, and late joiners receive the room's
//! accumulated document state.
//!
//! Usage:
//!   easel-relay --bind 0.0.0.0:9090 --max-peers 50
//!
//! Log level is taken from `RUST_LOG` (default `info`).

use clap::Parser;
use easel_collab::{RelayConfig, RelayServer};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "easel-relay")]
#[command(about = "WebSocket relay for Easel collaboration rooms")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Frames buffered per room before slow peers start losing them
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Maximum peers per room
    #[arg(long, default_value_t = 100)]
    max_peers: usize,
}

impl From<Args> for RelayConfig {
    fn from(args: Args) -> Self {
        RelayConfig {
            bind_addr: args.bind,
            broadcast_capacity: args.broadcast_capacity.max(1),
            max_peers_per_room: args.max_peers,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = RelayConfig::from(Args::parse());
    info!(
        "starting relay on {} (capacity {}, max {} peers per room)",
        config.bind_addr, config.broadcast_capacity, config.max_peers_per_room
    );

    if let Err(e) = RelayServer::new(config).run().await {
        error!("relay stopped: {e}");
        std::process::exit(1);
    }
}
