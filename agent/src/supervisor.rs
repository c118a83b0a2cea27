//! The agent's reconnect loop: dial whichever transport variant is
//! configured, authenticate, request the public ingress forward, then
//! relay every tunnel stream the gateway opens into the local endpoint.
//! Generalizes `cmd/local/main.go`'s top-level `for {}` loop around
//! `dialAndServe`, which did the same thing for one hard-coded protocol.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tunnel_protocol::{AuthMessage, ControlReply, ControlRequest, TcpipForward};
use tunnel_transport::auth::{read_framed, send_auth_message, write_framed};
use tunnel_transport::{kcp_transport, ssh_transport, Connection, Stream, TransportError};

use crate::backoff::Backoff;
use crate::config::{Config, TransportVariant};
use crate::process::ChildProcess;

const CLIENT_VERSION: &str = concat!("wormhole-agent ", env!("CARGO_PKG_VERSION"));
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs the reconnect loop until the process is asked to exit. `child`,
/// if present, is watched independently of the tunnel: either a signal
/// or the child exiting on its own tears the tunnel down and mirrors the
/// child's exit status, so the agent never outlives a child that has
/// already quit.
pub async fn run(config: Config, child: Option<ChildProcess>) -> anyhow::Result<()> {
    let local_endpoint = config.local_endpoint(child.as_ref().map(|c| c.port.as_str()));
    let target: SocketAddr = resolve_target(&config.remote_endpoint)?;

    let current: Arc<Mutex<Option<Arc<dyn Connection>>>> = Arc::new(Mutex::new(None));
    spawn_shutdown_watcher(current.clone(), child);

    let mut backoff = Backoff::new();
    loop {
        match connect_once(target, &config, &local_endpoint).await {
            Ok(conn) => {
                *current.lock().await = Some(conn.clone());
                backoff.reset();
                conn.closed().await;
                info!("connection to {target} closed, reconnecting");
            }
            Err(err) => {
                warn!("connect to {target} failed: {err}");
            }
        }
        *current.lock().await = None;
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

fn resolve_target(remote_endpoint: &str) -> anyhow::Result<SocketAddr> {
    // `REMOTE_ENDPOINT` carries just `:port` in the common case (the
    // gateway's hostname is resolved by whatever fronts it); `0.0.0.0`
    // fills in a host so `SocketAddr`'s parser accepts it.
    let candidate = if let Some(port) = remote_endpoint.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        remote_endpoint.to_string()
    };
    Ok(candidate.parse()?)
}

/// Races SIGTERM/SIGINT against the supervised child exiting on its own
/// (if any) and shuts the tunnel down on whichever happens first. A
/// child that crashes or exits normally must not leave the agent
/// reconnecting forever against a backend nothing is listening on.
fn spawn_shutdown_watcher(current: Arc<Mutex<Option<Arc<dyn Connection>>>>, child: Option<ChildProcess>) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(err) => {
                error!("failed to install SIGINT handler: {err}");
                return;
            }
        };

        match child {
            Some(mut child) => {
                tokio::select! {
                    _ = term.recv() => {
                        info!("signal received, shutting down");
                        if let Err(err) = child.signal(libc::SIGTERM) {
                            warn!("could not forward signal to supervised program: {err}");
                        }
                        if let Some(conn) = current.lock().await.take() {
                            conn.close().await;
                        }
                        child.wait_and_exit().await;
                    }
                    _ = int.recv() => {
                        info!("signal received, shutting down");
                        if let Err(err) = child.signal(libc::SIGINT) {
                            warn!("could not forward signal to supervised program: {err}");
                        }
                        if let Some(conn) = current.lock().await.take() {
                            conn.close().await;
                        }
                        child.wait_and_exit().await;
                    }
                    status = child.wait() => {
                        if let Some(conn) = current.lock().await.take() {
                            conn.close().await;
                        }
                        match status {
                            Ok(status) => {
                                info!("supervised program exited, shutting down tunnel");
                                std::process::exit(crate::process::exit_code(status));
                            }
                            Err(err) => {
                                error!("error waiting for supervised program: {err}");
                                std::process::exit(1);
                            }
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                info!("signal received, shutting down");
                if let Some(conn) = current.lock().await.take() {
                    conn.close().await;
                }
                std::process::exit(0);
            }
        }
    });
}

/// Dials, authenticates, requests the public forward, and spawns the
/// keepalive sender and data-stream relay loop for one connection
/// attempt. Returns once the connection is up and running in background
/// tasks; the caller awaits `conn.closed()` to learn when to retry.
async fn connect_once(
    target: SocketAddr,
    config: &Config,
    local_endpoint: &str,
) -> Result<Arc<dyn Connection>, TransportError> {
    match &config.transport {
        TransportVariant::Datagram { passphrase, kcp } => {
            let mux = kcp_transport::dial(target, passphrase, kcp).await?;
            let conn: Arc<dyn Connection> = Arc::new(mux);

            let mut control = conn.open_control_stream().await?;
            let auth = AuthMessage {
                token: config.token.clone(),
                client_name: hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| "unknown".to_string()),
                client_version: CLIENT_VERSION.to_string(),
            };
            let response = send_auth_message(&mut control, &auth).await?;
            if !response.ok {
                return Err(TransportError::Handshake(
                    response.message.unwrap_or_else(|| "token rejected".to_string()),
                ));
            }

            let bound_port = request_remote_forward(&mut control).await?;
            info!("forwarding gateway:{bound_port} -> {local_endpoint}");

            tokio::spawn(keepalive_loop(conn.clone(), control));
            spawn_relay_loop(conn.clone(), local_endpoint.to_string());
            Ok(conn)
        }
        TransportVariant::Handshake => {
            let client_config = ssh_transport::build_client_config();
            let (ssh, bound_port) = ssh_transport::dial(target, &config.token, 0, client_config).await?;
            info!("forwarding gateway:{bound_port} -> {local_endpoint}");

            let conn: Arc<dyn Connection> = Arc::new(ssh);
            let control = conn.open_control_stream().await?;
            tokio::spawn(keepalive_loop(conn.clone(), control));
            spawn_relay_loop(conn.clone(), local_endpoint.to_string());
            Ok(conn)
        }
    }
}

/// Sends the one `remote-forward` request the datagram variant needs;
/// the handshake variant gets its bound port back from `dial` itself via
/// the native `tcpip-forward` global request instead.
async fn request_remote_forward(control: &mut Box<dyn Stream>) -> Result<u32, TransportError> {
    let encoded = tunnel_protocol::encode(&ControlRequest::RemoteForward(TcpipForward { port: 0 }))
        .map_err(|e| TransportError::Mux(e.to_string()))?;
    write_framed(control, &encoded).await?;
    let reply_bytes = read_framed(control).await?;
    let reply: ControlReply =
        tunnel_protocol::decode(&reply_bytes).map_err(|e| TransportError::Mux(e.to_string()))?;
    match reply {
        ControlReply::ForwardedPort(port) => Ok(port),
        ControlReply::Ok => Ok(0),
        ControlReply::Err(message) => Err(TransportError::Handshake(message)),
    }
}

/// Periodically sends `Keepalive` on the control stream so the gateway's
/// directory record stays fresh. A write or read failure here is the
/// most reliable sign the connection is dead on either transport
/// variant, so it drives `conn.close()` directly rather than relying on
/// the transport to notice on its own.
async fn keepalive_loop(conn: Arc<dyn Connection>, mut control: Box<dyn Stream>) {
    loop {
        tokio::time::sleep(KEEPALIVE_INTERVAL).await;
        let encoded = match tunnel_protocol::encode(&ControlRequest::Keepalive) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("failed to encode keepalive: {err}");
                conn.close().await;
                return;
            }
        };
        if write_framed(&mut control, &encoded).await.is_err() || read_framed(&mut control).await.is_err() {
            conn.close().await;
            return;
        }
    }
}

/// Accepts every gateway-opened data stream and relays it to the local
/// endpoint on its own task, matching `dialAndServe`'s `io.Copy` pump per
/// accepted stream.
fn spawn_relay_loop(conn: Arc<dyn Connection>, local_endpoint: String) {
    tokio::spawn(async move {
        loop {
            match conn.accept_data_stream().await {
                Ok((stream, descriptor)) => {
                    let local_endpoint = local_endpoint.clone();
                    tokio::spawn(async move {
                        if let Err(err) = relay_one(stream, &local_endpoint).await {
                            warn!(
                                peer = %descriptor.peer_host,
                                "relay to {local_endpoint} failed: {err}"
                            );
                        }
                    });
                }
                Err(_) => {
                    conn.close().await;
                    return;
                }
            }
        }
    });
}

/// Large buffers on the local socket, matching `handleStream`'s
/// `SetReadBuffer`/`SetWriteBuffer` calls so the local hop isn't the
/// bottleneck relative to the tunnel's own flow control.
const LOCAL_SOCKET_BUFFER_SIZE: u32 = 1 << 20;

async fn dial_local(local_endpoint: &str) -> std::io::Result<TcpStream> {
    let addr = tokio::net::lookup_host(local_endpoint)
        .await?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "local endpoint resolved to no addresses"))?;
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_send_buffer_size(LOCAL_SOCKET_BUFFER_SIZE)?;
    socket.set_recv_buffer_size(LOCAL_SOCKET_BUFFER_SIZE)?;
    socket.connect(addr).await
}

async fn relay_one(mut tunnel_stream: Box<dyn Stream>, local_endpoint: &str) -> std::io::Result<()> {
    let mut local = tokio::time::timeout(LOCAL_DIAL_TIMEOUT, dial_local(local_endpoint))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "local dial timed out"))??;
    let result = tokio::io::copy_bidirectional(&mut tunnel_stream, &mut local).await;
    let _ = local.shutdown().await;
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_bare_port_against_any_host() {
        let addr = resolve_target(":10000").unwrap();
        assert_eq!(addr.port(), 10000);
    }

    #[test]
    fn resolves_explicit_host_and_port() {
        let addr = resolve_target("127.0.0.1:10000").unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:10000");
    }
}
