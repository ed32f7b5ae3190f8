use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::server::{DEFAULT_MAX_FRAME_LEN, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, broadcasting every message to all other clients.
    Server(ServerArgs),
    /// Connect to a server and relay stdin lines as chat messages.
    Client(ClientArgs),
    /// Open many concurrent clients and flood the server with messages.
    Hammer(HammerArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:10001")]
    pub listen: SocketAddr,

    /// Largest partial frame buffered per connection before it is dropped. 0 disables the limit.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,
}

impl ServerArgs {
    pub fn config(&self) -> ServerConfig {
        ServerConfig {
            max_frame_len: (self.max_frame_bytes > 0).then_some(self.max_frame_bytes),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname attached to every message sent.
    #[arg(long, short = 'n')]
    pub nick: String,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:10001")]
    pub server: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct HammerArgs {
    /// Number of concurrent clients.
    #[arg(long, default_value_t = 4)]
    pub clients: usize,

    /// Messages sent by each client.
    #[arg(long, default_value_t = 100)]
    pub messages: usize,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:10001")]
    pub server: SocketAddr,

    /// Milliseconds to wait after connecting before sending.
    #[arg(long, default_value_t = 100)]
    pub warmup_ms: u64,

    /// Milliseconds of silence after which a client stops waiting for traffic.
    #[arg(long, default_value_t = 500)]
    pub settle_ms: u64,
}
