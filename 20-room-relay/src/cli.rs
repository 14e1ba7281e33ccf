use std::net::{IpAddr, SocketAddr};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    DEFAULT_HEARTBEAT_SECS, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the room server: TCP handshakes plus the UDP relay.
    Server(ServerArgs),
    /// Create or join a room and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address for create/join handshakes. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:5001")]
    pub tcp_listen: SocketAddr,

    /// Socket address the relay receives datagrams on.
    #[arg(long, default_value = "0.0.0.0:6001")]
    pub udp_listen: SocketAddr,

    /// Port broadcasts are sent to on each member's address. Defaults to the relay port.
    #[arg(long)]
    pub member_port: Option<u16>,

    /// Largest accepted handshake payload or datagram, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,

    /// Handshakes served concurrently before new connections wait.
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Members silent for longer than this are removed from their room.
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    pub idle_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub sweep_interval_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Room to create or join.
    #[arg(long)]
    pub room: String,

    /// Name shown to other members.
    #[arg(long)]
    pub username: String,

    /// Create the room instead of joining an existing one.
    #[arg(long)]
    pub create: bool,

    /// Address of the room server.
    #[arg(long, default_value = "127.0.0.1")]
    pub server: IpAddr,

    #[arg(long, default_value_t = DEFAULT_TCP_PORT)]
    pub tcp_port: u16,

    #[arg(long, default_value_t = DEFAULT_UDP_PORT)]
    pub udp_port: u16,

    /// Local UDP port broadcasts arrive on; must match the server's member port.
    #[arg(long, default_value_t = DEFAULT_UDP_PORT)]
    pub listen_port: u16,

    /// Seconds between keepalives; keep it well under the server's idle timeout.
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_SECS)]
    pub heartbeat_secs: u64,
}
