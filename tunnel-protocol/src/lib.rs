//! Wire types shared by the wormhole agent and gateway.
//!
//! Both processes link this crate so that the messages exchanged over a
//! tunnel's control channel — authentication, control requests, release
//! metadata — stay in lock-step without duplicating the struct definitions
//! on each side, the way the client/gateway `protocol.rs` modules used to.

use serde::{Deserialize, Serialize};

/// Sent by the agent on the first stream of a session (encrypted-datagram
/// variant only; the handshake variant authenticates inline via its
/// password callback and never constructs one of these).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthMessage {
    /// Client auth token (`FLY_TOKEN` in the agent's environment).
    pub token: String,
    /// The agent host's name, used only for display/logging.
    pub client_name: String,
    /// Agent build/version string.
    pub client_version: String,
}

/// Gateway's reply to an [`AuthMessage`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthResponse {
    pub ok: bool,
    pub message: Option<String>,
}

/// Opaque agent-supplied version/build metadata attached to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Release {
    pub version: String,
    pub build: String,
}

/// Payload of a `remote-forward` request: the host/port the agent is
/// asking the gateway to bind its public ingress listener on.
///
/// `port == 0` asks the gateway to allocate any free port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TcpipForward {
    pub port: u32,
}

/// Descriptor attached to a newly opened data stream so the agent can
/// report provenance of the connection it's about to relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DirectForward {
    pub bind_host: String,
    pub bind_port: u32,
    pub peer_host: String,
    pub peer_port: u32,
}

/// Typed control requests carried on a session's control channel, after
/// authentication, for the lifetime of the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlRequest {
    /// Ask the gateway to bind a public ingress listener.
    RemoteForward(TcpipForward),
    /// Attach release/build metadata to the session.
    RegisterRelease(Release),
    /// Heartbeat; gateway bumps `last_heartbeat_at` and may reply.
    Keepalive,
}

/// Gateway's reply to a [`ControlRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlReply {
    /// `remote-forward` succeeded; carries the bound port (big-endian
    /// 32-bit integer on the wire per spec, bincode handles the byte
    /// order for us the same way on both ends).
    ForwardedPort(u32),
    /// Generic success with no payload (e.g. keepalive, register-release).
    Ok,
    /// Request rejected or malformed.
    Err(String),
}

/// Per-session record shape written through to the directory. The exact
/// keys/serialization used against the external store are
/// implementation-chosen (see `gateway::directory`), but this is the
/// logical schema every node of a deployment must agree on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoryRecord {
    pub session_id: String,
    pub node_id: String,
    pub backend_id: String,
    pub cluster_id: String,
    pub client_addr: String,
    pub client_agent: String,
    pub connected_at: i64,
    pub last_heartbeat_at: i64,
    pub release: Option<Release>,
}

/// Error returned by [`encode`]/[`decode`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::Error),
}

/// Serializes `value` with bincode. Used for every message exchanged on a
/// session's control channel, on both transport variants.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(value)?)
}

/// Deserializes a value previously produced by [`encode`].
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_message_round_trips() {
        let msg = AuthMessage {
            token: "T1".into(),
            client_name: "worker-1".into(),
            client_version: "wormhole 0.1.0".into(),
        };
        let bytes = encode(&msg).unwrap();
        let decoded: AuthMessage = decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn auth_response_round_trips_both_variants() {
        let ok = AuthResponse {
            ok: true,
            message: None,
        };
        let rejected = AuthResponse {
            ok: false,
            message: Some("token rejected".into()),
        };
        assert_eq!(ok, decode::<AuthResponse>(&encode(&ok).unwrap()).unwrap());
        assert_eq!(
            rejected,
            decode::<AuthResponse>(&encode(&rejected).unwrap()).unwrap()
        );
    }

    #[test]
    fn control_request_round_trips() {
        let reqs = vec![
            ControlRequest::RemoteForward(TcpipForward { port: 0 }),
            ControlRequest::RegisterRelease(Release {
                version: "v42".into(),
                build: "abc".into(),
            }),
            ControlRequest::Keepalive,
        ];
        for req in reqs {
            let bytes = encode(&req).unwrap();
            let decoded: ControlRequest = decode(&bytes).unwrap();
            assert_eq!(req, decoded);
        }
    }

    #[test]
    fn forwarded_port_reply_carries_nonzero_port() {
        let reply = ControlReply::ForwardedPort(45321);
        let bytes = encode(&reply).unwrap();
        match decode::<ControlReply>(&bytes).unwrap() {
            ControlReply::ForwardedPort(p) => assert_eq!(p, 45321),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
