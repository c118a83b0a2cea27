//! Ingress forwarder: the accept loop `session::Session::handle_remote_forward`
//! and `Session::run_ssh_forward_bridge` spawn on a session's bound
//! listener. Mirrors `handleRemoteForward`'s inner goroutine in
//! `session/ssh_session.go` — a 1-second accept deadline so the loop can
//! fall through to a quit check instead of blocking forever on `accept`,
//! a `directForward` descriptor opened on every accepted connection, and
//! a bidirectional copier per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};
use tunnel_protocol::DirectForward;

use crate::session::Session;

const ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

/// Drives one session's ingress listener until the listener errors
/// non-temporarily or the session closes. Closing the session in turn
/// closes the listener (it is dropped here when the loop exits).
pub async fn run(listener: tokio::net::TcpListener, session: Arc<Session>) {
    let bind_addr = listener.local_addr().ok();

    loop {
        if session.is_closed() {
            break;
        }
        match tokio::time::timeout(ACCEPT_DEADLINE, listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                let descriptor = match build_descriptor(bind_addr, peer_addr) {
                    Some(d) => d,
                    None => {
                        warn!("could not parse peer address {peer_addr}, dropping connection");
                        continue;
                    }
                };
                let session = session.clone();
                tokio::spawn(async move {
                    handle_connection(stream, descriptor, session).await;
                });
            }
            Ok(Err(err)) => {
                warn!("ingress accept error, terminating listener: {err}");
                break;
            }
            Err(_elapsed) => continue, // deadline hit, loop back to the quit check
        }
    }

    session.close().await;
}

fn build_descriptor(bind_addr: Option<SocketAddr>, peer_addr: SocketAddr) -> Option<DirectForward> {
    let bind_addr = bind_addr?;
    Some(DirectForward {
        bind_host: bind_addr.ip().to_string(),
        bind_port: bind_addr.port() as u32,
        peer_host: peer_addr.ip().to_string(),
        peer_port: peer_addr.port() as u32,
    })
}

async fn handle_connection(mut peer: TcpStream, descriptor: DirectForward, session: Arc<Session>) {
    let mut stream = match session.open_data_stream(descriptor).await {
        Ok(s) => s,
        Err(err) => {
            warn!(session_id = %session.id(), "failed to open data stream: {err}");
            return;
        }
    };

    session.metrics_channel_opened();
    debug!(session_id = %session.id(), "relaying ingress connection");

    match tokio::io::copy_bidirectional(&mut peer, &mut *stream).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {}
        Err(err) => warn!(session_id = %session.id(), "stream copy error: {err}"),
    }

    session.metrics_channel_closed();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_carries_bind_and_peer_addresses() {
        let bind: SocketAddr = "0.0.0.0:45321".parse().unwrap();
        let peer: SocketAddr = "203.0.113.7:51000".parse().unwrap();
        let descriptor = build_descriptor(Some(bind), peer).unwrap();
        assert_eq!(descriptor.bind_port, 45321);
        assert_eq!(descriptor.peer_host, "203.0.113.7");
        assert_eq!(descriptor.peer_port, 51000);
    }
}
