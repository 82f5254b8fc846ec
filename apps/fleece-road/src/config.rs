use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RoadConfig {
    pub listen_addr: SocketAddr,
    /// Time a new socket has to send its `register_request`.
    pub handshake_timeout: Duration,
}

impl Default for RoadConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "fleece-road",
    author,
    version,
    about = "Signaling relay for fleece worker links"
)]
pub struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "FLEECE_ROAD_LISTEN_ADDR", default_value = "127.0.0.1:8765")]
    pub listen_addr: String,

    /// Maximum time workers have to send their register_request frame.
    #[arg(
        long,
        env = "FLEECE_ROAD_HANDSHAKE_TIMEOUT_SECS",
        default_value_t = 5
    )]
    pub handshake_timeout_secs: u64,
}

impl TryFrom<Cli> for RoadConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        Ok(RoadConfig {
            listen_addr,
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
        })
    }
}
