use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, UdpSocket},
    select,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    config::DEFAULT_MAX_MESSAGE_SIZE,
    protocol::{
        Broadcast, BroadcastBody, HandshakeOperation, HandshakeRequest, HandshakeResponse,
        RelayRequest, Token, decode, encode, read_message, write_message,
    },
};

const EXIT_COMMAND: &str = "exit";

/// Everything the client needs to talk to the relay after the handshake.
struct RoomSession {
    token: Token,
    room: String,
    username: String,
    relay: SocketAddr,
    heartbeat_interval: Duration,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    // Bind first so a port clash fails before a token is issued.
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, args.listen_port))
        .await
        .with_context(|| format!("failed to bind UDP port {}", args.listen_port))?;

    let token = request_token(&args).await?;
    let session = RoomSession {
        token,
        room: args.room.clone(),
        username: args.username.clone(),
        relay: SocketAddr::new(args.server, args.udp_port),
        heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
    };
    write_stdout(&format!("*** joined {} as {}", session.room, session.username)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    run_client_loop(&socket, &session, &mut stdin, &mut input).await
}

async fn request_token(args: &ClientArgs) -> Result<Token> {
    let server = SocketAddr::new(args.server, args.tcp_port);
    let mut stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to {server}"))?;
    info!("connected to {}", server);

    let operation = if args.create {
        HandshakeOperation::CreateRoom
    } else {
        HandshakeOperation::JoinRoom
    };
    write_message(
        &mut stream,
        &HandshakeRequest {
            operation,
            room_name: args.room.clone(),
            username: args.username.clone(),
        },
    )
    .await?;

    let response = read_message::<_, HandshakeResponse>(&mut stream, DEFAULT_MAX_MESSAGE_SIZE)
        .await
        .context("failed to read handshake response")?;
    match response {
        HandshakeResponse::Success { token } => Ok(token),
        HandshakeResponse::Error { message } => bail!("server refused request: {message}"),
    }
}

async fn run_client_loop(
    socket: &UdpSocket,
    session: &RoomSession,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    let mut buffer = vec![0u8; DEFAULT_MAX_MESSAGE_SIZE];
    let period = session.heartbeat_interval;
    let mut heartbeat = time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            received = socket.recv_from(&mut buffer) => {
                handle_datagram(received.map(|(len, _)| &buffer[..len])).await?;
            }
            bytes_read = stdin.read_line(input) => {
                // Only a completed line clears the buffer; a read interrupted by
                // another branch keeps its partial bytes for the next call.
                let keep_going = handle_stdin_input(bytes_read, input, socket, session).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(error) = send_heartbeat(socket, session).await {
                    warn!(?error, "failed to send heartbeat");
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                send_leave(socket, session).await?;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_datagram(received: io::Result<&[u8]>) -> Result<()> {
    let bytes = match received {
        Ok(bytes) => bytes,
        Err(error) => {
            warn!(?error, "failed to receive datagram");
            return Ok(());
        }
    };

    match decode::<Broadcast>(bytes) {
        Ok(broadcast) => render_broadcast(broadcast).await?,
        Err(error) => debug!(%error, "ignoring undecodable datagram"),
    }
    Ok(())
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    socket: &UdpSocket,
    session: &RoomSession,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        send_leave(socket, session).await?;
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case(EXIT_COMMAND) {
        write_stdout(&format!("*** leaving {}", session.room)).await?;
        send_leave(socket, session).await?;
        return Ok(false);
    }

    send_request(
        socket,
        session,
        &RelayRequest::Message {
            token: Some(session.token.clone()),
            room_name: session.room.clone(),
            username: session.username.clone(),
            message: text.to_string(),
        },
    )
    .await?;
    Ok(true)
}

async fn send_leave(socket: &UdpSocket, session: &RoomSession) -> Result<()> {
    send_request(
        socket,
        session,
        &RelayRequest::Leave {
            token: Some(session.token.clone()),
            room_name: session.room.clone(),
            username: session.username.clone(),
        },
    )
    .await
}

async fn send_heartbeat(socket: &UdpSocket, session: &RoomSession) -> Result<()> {
    debug!(room = %session.room, "sending heartbeat");
    send_request(
        socket,
        session,
        &RelayRequest::Heartbeat {
            token: Some(session.token.clone()),
            room_name: session.room.clone(),
            username: session.username.clone(),
        },
    )
    .await
}

async fn send_request(
    socket: &UdpSocket,
    session: &RoomSession,
    request: &RelayRequest,
) -> Result<()> {
    let bytes = encode(request)?;
    socket
        .send_to(&bytes, session.relay)
        .await
        .with_context(|| format!("failed to send datagram to {}", session.relay))?;
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn render_broadcast(broadcast: Broadcast) -> io::Result<()> {
    match broadcast.body {
        BroadcastBody::Chat { sender, message } => {
            write_stdout(&format!("<{sender}> {message}")).await
        }
        BroadcastBody::System { system_message } => {
            write_stdout(&format!("*** {system_message}")).await
        }
        BroadcastBody::Error { message } => write_stderr(&format!("!!! {message}")).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
