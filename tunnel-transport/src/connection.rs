//! The transport capability set both variants implement, so that
//! `gateway::session::Session` and the agent's connect loop can drive
//! either one without inspecting which concrete transport they got. See
//! the design note on modeling this as a capability set rather than a
//! shared base type.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tunnel_protocol::DirectForward;

use crate::error::TransportError;

/// A reliable, ordered, bidirectional byte channel with independent
/// half-close, carried by either transport variant.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// One established agent↔gateway connection, abstracting over the
/// encrypted-datagram (KCP) and public-key handshake (SSH) variants.
///
/// Exactly one control stream exists per connection (opened by the agent,
/// accepted by the gateway); data streams are opened by the gateway, one
/// per inbound public connection, and accepted by the agent in a loop.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Agent side: opens the session's single control stream.
    async fn open_control_stream(&self) -> Result<Box<dyn Stream>, TransportError>;

    /// Gateway side: accepts the session's single control stream.
    async fn accept_control_stream(&self) -> Result<Box<dyn Stream>, TransportError>;

    /// Gateway side: opens a data stream for one inbound public
    /// connection, carrying `descriptor` so the agent can report
    /// provenance before relaying.
    async fn open_data_stream(
        &self,
        descriptor: DirectForward,
    ) -> Result<Box<dyn Stream>, TransportError>;

    /// Agent side: accepts the next gateway-opened data stream, along
    /// with the descriptor it was opened with.
    async fn accept_data_stream(&self) -> Result<(Box<dyn Stream>, DirectForward), TransportError>;

    /// Tears the whole connection down; idempotent.
    async fn close(&self);

    /// Resolves once the connection has closed, for any reason — peer
    /// close, keepalive timeout, or a local `close()` call. Used by the
    /// ingress forwarder's accept loop to know when to quit instead of
    /// polling a deadline in a tight loop, per the cancellation design
    /// note (native cancellation preferred where available).
    async fn closed(&self);

    /// Gateway side, public-key handshake variant only: yields the next
    /// TCP listener bound in response to a native `tcpip-forward`
    /// request. The encrypted-datagram variant has no equivalent — its
    /// `remote-forward` arrives as an ordinary [`crate::mux`] control
    /// request instead, so the default implementation never resolves.
    async fn next_forward_listener(&self) -> Option<tokio::net::TcpListener> {
        std::future::pending().await
    }
}
