//! Datagram-variant authenticator glue: the agent writes an `AuthMessage`
//! on the freshly opened control stream, the gateway resolves it against
//! the directory and writes back an `AuthResponse`. The handshake
//! variant authenticates inline during its SSH password callback instead
//! (see [`crate::ssh_transport::GatewayHandler::auth_password`]) and
//! never calls these helpers.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tunnel_protocol::{decode, encode, AuthMessage, AuthResponse};

use crate::connection::Stream;
use crate::error::{AuthError, TransportError};

/// Writes a 4-byte big-endian length prefix followed by `payload`. Used
/// for every bincode message exchanged on a control stream — the auth
/// handshake here, and the `gateway`/`agent` control-request loops that
/// build on top of it.
pub async fn write_framed<S: Stream + ?Sized>(stream: &mut S, payload: &[u8]) -> Result<(), TransportError> {
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

/// Reverses [`write_framed`].
pub async fn read_framed<S: Stream + ?Sized>(stream: &mut S) -> Result<Vec<u8>, TransportError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Agent side: writes `message` on the control stream and waits for the
/// gateway's response. Any non-ok response, or the stream closing first,
/// is treated as terminal per the datagram authenticator's contract.
pub async fn send_auth_message<S: Stream + ?Sized>(
    control: &mut S,
    message: &AuthMessage,
) -> Result<AuthResponse, TransportError> {
    let encoded = encode(message).map_err(|e| TransportError::Mux(e.to_string()))?;
    write_framed(control, &encoded).await?;
    let reply_bytes = read_framed(control).await?;
    let reply: AuthResponse =
        decode(&reply_bytes).map_err(|e| TransportError::Mux(e.to_string()))?;
    Ok(reply)
}

/// Gateway side: reads an `AuthMessage` off the freshly accepted control
/// stream. A malformed message is reported as [`AuthError::Malformed`],
/// distinct from a token the directory rejects.
pub async fn read_auth_message<S: Stream + ?Sized>(control: &mut S) -> Result<AuthMessage, AuthError> {
    let bytes = read_framed(control).await?;
    decode(&bytes).map_err(|e| AuthError::Malformed(e.to_string()))
}

/// Gateway side: writes the resolved [`AuthResponse`] back to the agent.
pub async fn send_auth_response<S: Stream + ?Sized>(
    control: &mut S,
    response: &AuthResponse,
) -> Result<(), TransportError> {
    let encoded = encode(response).map_err(|e| TransportError::Mux(e.to_string()))?;
    write_framed(control, &encoded).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn auth_message_round_trips_over_a_framed_stream() {
        let (mut agent_side, mut gateway_side) = duplex(4096);

        let msg = AuthMessage {
            token: "T1".into(),
            client_name: "worker-1".into(),
            client_version: "wormhole 0.1.0".into(),
        };

        let send_task = {
            let msg = msg.clone();
            tokio::spawn(async move { send_auth_message(&mut agent_side, &msg).await })
        };

        let received = read_auth_message(&mut gateway_side).await.unwrap();
        assert_eq!(received, msg);

        send_auth_response(
            &mut gateway_side,
            &AuthResponse {
                ok: true,
                message: None,
            },
        )
        .await
        .unwrap();

        let reply = send_task.await.unwrap().unwrap();
        assert!(reply.ok);
    }
}
