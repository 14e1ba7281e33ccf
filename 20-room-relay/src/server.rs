use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{acceptor::Acceptor, config::ServerConfig, registry::Registry, relay::Relay};

/// A bound room server: the handshake acceptor and the relay loop sharing one registry.
pub struct Server {
    acceptor: Acceptor,
    relay: Relay,
    registry: Arc<Registry>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.tcp_listen)
            .await
            .with_context(|| format!("failed to bind handshake listener {}", config.tcp_listen))?;
        let socket = UdpSocket::bind(config.udp_listen)
            .await
            .with_context(|| format!("failed to bind relay socket on {}", config.udp_listen))?;
        let member_port = match config.member_port {
            Some(port) => port,
            None => socket.local_addr()?.port(),
        };

        let registry = Arc::new(Registry::new());
        let acceptor = Acceptor::new(
            listener,
            Arc::clone(&registry),
            config.max_connections,
            config.max_message_size,
            config.handshake_timeout,
        );
        let relay = Relay::new(
            socket,
            Arc::clone(&registry),
            member_port,
            config.max_message_size,
            config.idle_timeout,
            config.sweep_interval,
        );

        Ok(Self {
            acceptor,
            relay,
            registry,
        })
    }

    pub fn tcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn udp_addr(&self) -> std::io::Result<SocketAddr> {
        self.relay.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Runs the acceptor and the relay until `cancel` fires, then waits for both to stop.
    pub async fn run(self, cancel: CancellationToken) {
        let Server { acceptor, relay, .. } = self;
        tokio::join!(acceptor.run(cancel.clone()), relay.run(cancel));
        info!("server stopped");
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            info!("server shutting down");
            trigger.cancel();
        });

        self.run(cancel).await;
        Ok(())
    }
}
