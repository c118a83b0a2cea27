use thiserror::Error;

/// Errors surfaced by the transport adapter layer (dial, accept, stream
/// open/accept, encryption). Agent-side reconnect loops retry on these;
/// gateway-side they close the owning session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(#[source] std::io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("decryption failed, dropping session")]
    DecryptionFailed,

    #[error("connection closed")]
    Closed,

    #[error("stream multiplexer error: {0}")]
    Mux(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the authenticator, on either transport variant.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The supplied token does not resolve to a backend. Terminal: the
    /// client should not retry with the same token.
    #[error("token rejected")]
    TokenRejected,

    /// The directory could not be reached to resolve the token. Retryable,
    /// distinct from a rejected token (see the Open Question resolution in
    /// the design notes).
    #[error("directory unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("malformed auth message: {0}")]
    Malformed(String),

    #[error("transport error during auth: {0}")]
    Transport(#[from] TransportError),
}
