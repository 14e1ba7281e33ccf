use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{
    error::ChatError,
    protocol::{
        HandshakeOperation, HandshakeRequest, HandshakeResponse, Token, read_message,
        write_message,
    },
    registry::Registry,
};

/// Serves one handshake: read a single request, answer it, close the stream.
///
/// Client mistakes are answered with an error response and reported as
/// `Ok`; only transport failures surface as `Err`.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: IpAddr,
    registry: &Registry,
    max_message_size: usize,
) -> Result<HandshakeResponse, ChatError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let response = match read_message::<_, HandshakeRequest>(&mut stream, max_message_size).await
    {
        Ok(request) => respond(registry, request, peer).await,
        Err(ChatError::Transport(err)) => return Err(ChatError::Transport(err)),
        Err(err) => {
            debug!(%peer, error = %err, "rejecting handshake");
            HandshakeResponse::Error {
                message: err.client_message().to_string(),
            }
        }
    };

    write_message(&mut stream, &response).await?;
    stream.shutdown().await?;
    Ok(response)
}

/// Applies a decoded request to the registry and maps the outcome to a response.
pub async fn respond(
    registry: &Registry,
    request: HandshakeRequest,
    peer: IpAddr,
) -> HandshakeResponse {
    match execute(registry, &request, peer).await {
        Ok(token) => HandshakeResponse::Success { token },
        Err(err) => {
            debug!(%peer, room = %request.room_name, error = %err, "handshake refused");
            HandshakeResponse::Error {
                message: err.client_message().to_string(),
            }
        }
    }
}

async fn execute(
    registry: &Registry,
    request: &HandshakeRequest,
    peer: IpAddr,
) -> Result<Token, ChatError> {
    request.validate()?;
    match request.operation {
        HandshakeOperation::CreateRoom => {
            registry
                .create_room(&request.room_name, &request.username, peer)
                .await
        }
        HandshakeOperation::JoinRoom => {
            registry
                .join_room(&request.room_name, &request.username, peer)
                .await
        }
    }
}
