use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{handshake::handle_connection, protocol::HandshakeResponse, registry::Registry};

/// Accepts handshake connections and serves each on its own task.
///
/// At most `max_connections` handshakes run at once; once every permit is
/// taken the acceptor stops accepting until a handler finishes.
pub struct Acceptor {
    listener: TcpListener,
    registry: Arc<Registry>,
    permits: Arc<Semaphore>,
    max_message_size: usize,
    handshake_timeout: Duration,
}

impl Acceptor {
    pub fn new(
        listener: TcpListener,
        registry: Arc<Registry>,
        max_connections: usize,
        max_message_size: usize,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            registry,
            permits: Arc::new(Semaphore::new(max_connections)),
            max_message_size,
            handshake_timeout,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let permit = select! {
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            select! {
                _ = cancel.cancelled() => break,
                accept_result = self.listener.accept() => {
                    self.handle_accept_result(accept_result, permit);
                }
            }
        }
        info!("acceptor stopping");
    }

    fn handle_accept_result(
        &self,
        result: std::io::Result<(TcpStream, SocketAddr)>,
        permit: OwnedSemaphorePermit,
    ) {
        match result {
            Ok((stream, peer)) => self.spawn_handshake(stream, peer, permit),
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }

    fn spawn_handshake(&self, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let registry = Arc::clone(&self.registry);
        let max_message_size = self.max_message_size;
        let deadline = self.handshake_timeout;

        tokio::spawn(async move {
            let _permit = permit;
            let served = timeout(
                deadline,
                handle_connection(stream, peer.ip(), &registry, max_message_size),
            )
            .await;

            match served {
                Ok(Ok(HandshakeResponse::Success { .. })) => {
                    info!(peer = %peer, "handshake issued token");
                }
                Ok(Ok(HandshakeResponse::Error { message })) => {
                    debug!(peer = %peer, %message, "handshake rejected");
                }
                Ok(Err(err)) => warn!(peer = %peer, error = %err, "handshake failed"),
                Err(_) => warn!(peer = %peer, ?deadline, "handshake timed out"),
            }
        });
    }
}
