//! UDP relay: authorizes chat datagrams against the registry and fans them
//! out to every member of the room, sender included.
//!
//! Routing is split from I/O. [`route`] turns one decoded request into a list
//! of [`Delivery`] values without touching the socket; [`Relay::run`] owns the
//! socket, receives strictly one datagram at a time, and sends what `route`
//! planned. The idle sweep runs on the same loop so registry changes made by
//! the relay never interleave with each other.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use tokio::{
    net::UdpSocket,
    select,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::ChatError,
    protocol::{Broadcast, RelayRequest, Token, decode, encode},
    registry::{Departure, Registry},
};

/// One outbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: SocketAddr,
    pub payload: Broadcast,
}

pub struct Relay {
    socket: UdpSocket,
    registry: Arc<Registry>,
    member_port: u16,
    max_message_size: usize,
    idle_timeout: Duration,
    sweep_interval: Duration,
}

impl Relay {
    pub fn new(
        socket: UdpSocket,
        registry: Arc<Registry>,
        member_port: u16,
        max_message_size: usize,
        idle_timeout: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            socket,
            registry,
            member_port,
            max_message_size,
            idle_timeout,
            sweep_interval,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Processes datagrams until `cancel` fires. Individual failures are
    /// logged and never end the loop.
    pub async fn run(self, cancel: CancellationToken) {
        let mut buffer = vec![0u8; self.max_message_size];
        let first_sweep = Instant::now() + self.sweep_interval;
        let mut sweep = time::interval_at(first_sweep, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = cancel.cancelled() => {
                    info!("relay loop stopping");
                    break;
                }
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => self.handle_datagram(&buffer[..len], from).await,
                    Err(err) => warn!(error = ?err, "failed to receive datagram"),
                },
                _ = sweep.tick() => self.sweep_idle().await,
            }
        }
    }

    async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let deliveries = match decode::<RelayRequest>(datagram) {
            Ok(request) => route(&self.registry, self.member_port, request).await,
            Err(err) => Err(err),
        };

        match deliveries {
            Ok(deliveries) => self.deliver(&deliveries).await,
            Err(err) if err.is_rejected_request() => {
                debug!(%from, error = %err, "dropping datagram");
            }
            Err(err) => warn!(%from, error = %err, "failed to process datagram"),
        }
    }

    async fn sweep_idle(&self) {
        let departures = self
            .registry
            .reap_idle(self.idle_timeout, Instant::now())
            .await;
        if departures.is_empty() {
            return;
        }

        info!(count = departures.len(), "reaped idle members");
        for departure in &departures {
            debug!(
                room = %departure.room_name,
                token = %departure.token,
                username = %departure.username,
                "member reaped"
            );
        }
        let deliveries = announce_departures(&self.registry, self.member_port, &departures).await;
        self.deliver(&deliveries).await;
    }

    async fn deliver(&self, deliveries: &[Delivery]) {
        for delivery in deliveries {
            let bytes = match encode(&delivery.payload) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %err, "failed to encode broadcast");
                    continue;
                }
            };
            if let Err(err) = self.socket.send_to(&bytes, delivery.to).await {
                warn!(to = %delivery.to, error = ?err, "failed to deliver datagram");
            }
        }
    }
}

/// Authorizes `request` and plans the datagrams it produces.
///
/// Requests without a token, for an unknown room, or from a token that is not a
/// member of the named room fail with [`ChatError::UnauthorizedRelay`] and
/// produce no traffic. An authorized `heartbeat` only refreshes the session.
pub async fn route(
    registry: &Registry,
    member_port: u16,
    request: RelayRequest,
) -> Result<Vec<Delivery>, ChatError> {
    let room_name = request.room_name().to_string();
    let Some(token) = request.token().cloned() else {
        return Err(ChatError::UnauthorizedRelay { room: room_name });
    };
    if !registry.is_member(&room_name, &token).await {
        return Err(ChatError::UnauthorizedRelay { room: room_name });
    }
    registry.touch(&token).await;

    match request {
        RelayRequest::Message {
            username, message, ..
        } => {
            let sender = display_name(registry, &token, username).await;
            let payload = Broadcast::chat(sender, message);
            let members = registry.resolve_members(&room_name).await;
            Ok(fan_out(&members, member_port, &payload))
        }
        RelayRequest::Leave { username, .. } => {
            let Some(session) = registry.remove_member(&room_name, &token).await else {
                return Ok(Vec::new());
            };
            let username = if username.trim().is_empty() {
                session.username
            } else {
                username
            };
            debug!(room = %room_name, %username, "member left");
            let departure = Departure {
                room_name,
                token,
                username,
            };
            Ok(announce_departures(registry, member_port, &[departure]).await)
        }
        RelayRequest::Heartbeat { .. } => Ok(Vec::new()),
    }
}

/// Names a message by the username it carries, or by the session's name when
/// the datagram left it blank.
async fn display_name(registry: &Registry, token: &Token, claimed: String) -> String {
    if !claimed.trim().is_empty() {
        return claimed;
    }
    registry.lookup_username(token).await.unwrap_or_default()
}

/// Plans a "has left the room" notice to the remaining members of each departure's room.
pub async fn announce_departures(
    registry: &Registry,
    member_port: u16,
    departures: &[Departure],
) -> Vec<Delivery> {
    let mut deliveries = Vec::new();
    for departure in departures {
        let members = registry.resolve_members(&departure.room_name).await;
        let payload = Broadcast::departure(&departure.username);
        deliveries.extend(fan_out(&members, member_port, &payload));
    }
    deliveries
}

fn fan_out(members: &[(Token, IpAddr)], member_port: u16, payload: &Broadcast) -> Vec<Delivery> {
    members
        .iter()
        .map(|(_, address)| Delivery {
            to: SocketAddr::new(*address, member_port),
            payload: payload.clone(),
        })
        .collect()
}
