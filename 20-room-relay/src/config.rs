use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, ensure};

use crate::cli::ServerArgs;

pub const DEFAULT_TCP_PORT: u16 = 5001;
pub const DEFAULT_UDP_PORT: u16 = 6001;
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
/// Client keepalive period, well inside half of [`DEFAULT_IDLE_TIMEOUT_SECS`].
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;

/// Runtime settings for a relay server.
///
/// Every limit the server enforces lives here so that independent deployments
/// never share a hardcoded port or buffer size by accident.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoint for the create/join handshake.
    pub tcp_listen: SocketAddr,
    /// Endpoint the relay loop receives datagrams on.
    pub udp_listen: SocketAddr,
    /// UDP port broadcasts are delivered to on each member's IP.
    /// `None` means "same port the relay is bound to".
    pub member_port: Option<u16>,
    /// Upper bound for one handshake payload and for one datagram.
    pub max_message_size: usize,
    /// Handshakes allowed in flight at once.
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    /// Sessions silent for longer than this are reaped.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_TCP_PORT)),
            udp_listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_UDP_PORT)),
            member_port: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Loopback endpoints on ephemeral ports, for tests and local experiments.
    pub fn loopback() -> Self {
        Self {
            tcp_listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            udp_listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_message_size > 0, "max message size must be positive");
        ensure!(self.max_connections > 0, "max connections must be positive");
        ensure!(
            !self.sweep_interval.is_zero(),
            "sweep interval must be positive"
        );
        Ok(())
    }
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            tcp_listen: args.tcp_listen,
            udp_listen: args.udp_listen,
            member_port: args.member_port,
            max_message_size: args.max_message_size,
            max_connections: args.max_connections,
            handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
        }
    }
}
