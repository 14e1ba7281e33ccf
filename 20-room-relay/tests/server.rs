use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use room_relay::{
    config::ServerConfig,
    protocol::{
        Broadcast, HandshakeOperation, HandshakeRequest, HandshakeResponse, RelayRequest, Token,
        decode, encode, read_message, write_message,
    },
    registry::Registry,
    server::Server,
};
use tokio::{
    net::{TcpStream, UdpSocket},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);
const QUIET_PERIOD: Duration = Duration::from_millis(200);
const HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);

/// A running server whose broadcasts all land on `inbox`: every member
/// registers from 127.0.0.1 and the member port points at the inbox socket.
struct Harness {
    tcp: SocketAddr,
    udp: SocketAddr,
    registry: Arc<Registry>,
    inbox: UdpSocket,
    cancel: CancellationToken,
    server: JoinHandle<()>,
}

impl Harness {
    async fn start() -> Result<Self> {
        Self::start_with(ServerConfig::loopback()).await
    }

    async fn start_with(config: ServerConfig) -> Result<Self> {
        let inbox = UdpSocket::bind("127.0.0.1:0").await?;
        let config = ServerConfig {
            member_port: Some(inbox.local_addr()?.port()),
            ..config
        };
        let server = Server::bind(config).await?;
        let tcp = server.tcp_addr()?;
        let udp = server.udp_addr()?;
        let registry = server.registry();

        let cancel = CancellationToken::new();
        let server = tokio::spawn(server.run(cancel.clone()));

        Ok(Self {
            tcp,
            udp,
            registry,
            inbox,
            cancel,
            server,
        })
    }

    async fn handshake(
        &self,
        operation: HandshakeOperation,
        room: &str,
        username: &str,
    ) -> Result<HandshakeResponse> {
        handshake(self.tcp, operation, room, username).await
    }

    async fn token(&self, operation: HandshakeOperation, room: &str, username: &str) -> Result<Token> {
        match self.handshake(operation, room, username).await? {
            HandshakeResponse::Success { token } => Ok(token),
            other => anyhow::bail!("handshake for {username} failed: {other:?}"),
        }
    }

    async fn send(&self, request: &RelayRequest) -> Result<()> {
        self.inbox.send_to(&encode(request)?, self.udp).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Broadcast> {
        let mut buffer = vec![0u8; 4096];
        let (len, _) = timeout(RECV_TIMEOUT, self.inbox.recv_from(&mut buffer)).await??;
        Ok(decode(&buffer[..len])?)
    }

    async fn assert_quiet(&self) {
        let mut buffer = vec![0u8; 4096];
        let result = timeout(QUIET_PERIOD, self.inbox.recv_from(&mut buffer)).await;
        assert!(result.is_err(), "expected no datagram, got {result:?}");
    }

    async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        timeout(RECV_TIMEOUT, self.server).await??;
        Ok(())
    }
}

async fn handshake(
    tcp: SocketAddr,
    operation: HandshakeOperation,
    room: &str,
    username: &str,
) -> Result<HandshakeResponse> {
    let mut stream = TcpStream::connect(tcp).await?;
    write_message(
        &mut stream,
        &HandshakeRequest {
            operation,
            room_name: room.to_string(),
            username: username.to_string(),
        },
    )
    .await?;
    Ok(timeout(RECV_TIMEOUT, read_message(&mut stream, 4096)).await??)
}

fn chat(token: &Token, room: &str, username: &str, text: &str) -> RelayRequest {
    RelayRequest::Message {
        token: Some(token.clone()),
        room_name: room.to_string(),
        username: username.to_string(),
        message: text.to_string(),
    }
}

fn heartbeat(token: &Token, room: &str) -> RelayRequest {
    RelayRequest::Heartbeat {
        token: Some(token.clone()),
        room_name: room.to_string(),
        username: String::new(),
    }
}

fn leave(token: &Token, room: &str, username: &str) -> RelayRequest {
    RelayRequest::Leave {
        token: Some(token.clone()),
        room_name: room.to_string(),
        username: username.to_string(),
    }
}

#[tokio::test]
async fn message_reaches_every_member() -> Result<()> {
    let harness = Harness::start().await?;
    let alice = harness
        .token(HandshakeOperation::CreateRoom, "lobby", "alice")
        .await?;
    harness
        .token(HandshakeOperation::JoinRoom, "lobby", "bob")
        .await?;

    harness.send(&chat(&alice, "lobby", "alice", "hello bob")).await?;

    for _ in 0..2 {
        assert_eq!(harness.recv().await?, Broadcast::chat("alice", "hello bob"));
    }
    harness.assert_quiet().await;

    harness.shutdown().await
}

#[tokio::test]
async fn handshake_errors_are_reported_over_tcp() -> Result<()> {
    let harness = Harness::start().await?;
    harness
        .token(HandshakeOperation::CreateRoom, "lobby", "alice")
        .await?;

    let duplicate = harness
        .handshake(HandshakeOperation::CreateRoom, "lobby", "mallory")
        .await?;
    assert_eq!(
        duplicate,
        HandshakeResponse::Error {
            message: "Room already exists.".into()
        }
    );

    let missing = harness
        .handshake(HandshakeOperation::JoinRoom, "attic", "bob")
        .await?;
    assert_eq!(
        missing,
        HandshakeResponse::Error {
            message: "Room not found.".into()
        }
    );
    assert_eq!(harness.registry.session_count().await, 1);

    harness.shutdown().await
}

#[tokio::test]
async fn forged_and_foreign_tokens_are_dropped() -> Result<()> {
    let harness = Harness::start().await?;
    let alice = harness
        .token(HandshakeOperation::CreateRoom, "lobby", "alice")
        .await?;
    harness
        .token(HandshakeOperation::CreateRoom, "den", "carol")
        .await?;

    harness
        .send(&chat(&Token::from("lobby-alice-127.0.0.1"), "lobby", "alice", "spoof"))
        .await?;
    harness.send(&chat(&alice, "den", "alice", "intrude")).await?;
    harness.assert_quiet().await;

    harness.shutdown().await
}

#[tokio::test]
async fn bad_datagrams_do_not_stop_the_relay() -> Result<()> {
    let harness = Harness::start().await?;
    let alice = harness
        .token(HandshakeOperation::CreateRoom, "lobby", "alice")
        .await?;

    harness.inbox.send_to(b"not json at all", harness.udp).await?;
    harness
        .inbox
        .send_to(br#"{"operation":"shout","room_name":"lobby"}"#, harness.udp)
        .await?;
    harness.send(&chat(&alice, "lobby", "alice", "still here")).await?;

    assert_eq!(harness.recv().await?, Broadcast::chat("alice", "still here"));

    harness.shutdown().await
}

#[tokio::test]
async fn leave_notifies_the_rest_of_the_room() -> Result<()> {
    let harness = Harness::start().await?;
    harness
        .token(HandshakeOperation::CreateRoom, "lobby", "alice")
        .await?;
    let bob = harness
        .token(HandshakeOperation::JoinRoom, "lobby", "bob")
        .await?;
    harness
        .token(HandshakeOperation::JoinRoom, "lobby", "carol")
        .await?;

    harness.send(&leave(&bob, "lobby", "bob")).await?;

    for _ in 0..2 {
        assert_eq!(harness.recv().await?, Broadcast::departure("bob"));
    }
    harness.assert_quiet().await;
    assert!(!harness.registry.is_member("lobby", &bob).await);
    assert_eq!(harness.registry.resolve_members("lobby").await.len(), 2);

    // The departed token no longer authorizes anything.
    harness.send(&chat(&bob, "lobby", "bob", "ghost")).await?;
    harness.assert_quiet().await;

    harness.shutdown().await
}

#[tokio::test]
async fn concurrent_creates_pick_one_winner() -> Result<()> {
    let harness = Harness::start().await?;

    let mut attempts = Vec::new();
    for i in 0..8 {
        let tcp = harness.tcp;
        attempts.push(tokio::spawn(async move {
            handshake(tcp, HandshakeOperation::CreateRoom, "same-name", &format!("user-{i}")).await
        }));
    }

    let mut winners = 0;
    for attempt in attempts {
        if let HandshakeResponse::Success { .. } = attempt.await?? {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    let room = harness.registry.room("same-name").await.expect("room exists");
    assert_eq!(room.members.len(), 1);

    harness.shutdown().await
}

#[tokio::test]
async fn idle_members_are_reaped_and_announced() -> Result<()> {
    let harness = Harness::start_with(ServerConfig {
        idle_timeout: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(50),
        ..ServerConfig::loopback()
    })
    .await?;

    let alice = harness
        .token(HandshakeOperation::CreateRoom, "lobby", "alice")
        .await?;
    let bob = harness
        .token(HandshakeOperation::JoinRoom, "lobby", "bob")
        .await?;

    // Bob keeps heartbeating while alice stays silent until the sweep takes her.
    let mut buffer = vec![0u8; 4096];
    let mut departure = None;
    for _ in 0..30 {
        harness.send(&heartbeat(&bob, "lobby")).await?;
        if let Ok(received) = timeout(HEARTBEAT_PERIOD, harness.inbox.recv_from(&mut buffer)).await
        {
            let (len, _) = received?;
            departure = Some(decode::<Broadcast>(&buffer[..len])?);
            break;
        }
    }

    assert_eq!(departure, Some(Broadcast::departure("alice")));
    assert!(!harness.registry.is_member("lobby", &alice).await);
    assert!(harness.registry.is_member("lobby", &bob).await);

    harness.shutdown().await
}

#[tokio::test]
async fn cancellation_stops_both_loops() -> Result<()> {
    let harness = Harness::start().await?;
    let tcp = harness.tcp;
    harness.shutdown().await?;

    // The listener is gone once the acceptor has returned.
    assert!(TcpStream::connect(tcp).await.is_err());
    Ok(())
}
