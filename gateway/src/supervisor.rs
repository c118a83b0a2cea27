//! Gateway supervisor: parses configuration, opens the directory, builds
//! whichever transport variant is configured, and runs the accept loop
//! that instantiates a `Session` per connected agent on its own task.
//! Generalizes `remote.go`'s `StartRemote`/`handleDeath`, which did the
//! same three things — pick a handler, listen, clean up on signal — for
//! a single hard-coded protocol at a time.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tunnel_protocol::AuthResponse;
use tunnel_transport::auth::{read_auth_message, send_auth_response};
use tunnel_transport::kcp_transport::KcpListener as DatagramListener;
use tunnel_transport::ssh_transport::{SshGatewayListener, TokenResolver};
use tunnel_transport::{AuthError, Connection, TransportError};

use crate::config::{Config, TransportVariant};
use crate::directory::Directory;
use crate::metrics::Metrics;
use crate::session::{generate_session_id, Session, SessionIndex};

/// Bridges `gateway::directory::Directory` to the SSH handshake
/// variant's password callback without making `tunnel-transport` depend
/// on `redis` directly. Preserves the same unknown-token vs.
/// directory-unreachable distinction the datagram variant's
/// `accept_datagram_session` makes, per the Open Question resolution in
/// the design notes.
struct DirectoryTokenResolver {
    directory: Arc<dyn Directory>,
}

#[async_trait]
impl TokenResolver for DirectoryTokenResolver {
    async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        match self.directory.backend_id_from_token(token).await {
            Ok(id) if !id.is_empty() => Ok(id),
            Ok(_) => Err(AuthError::TokenRejected),
            Err(err) => Err(AuthError::DirectoryUnavailable(err.to_string())),
        }
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let directory: Arc<dyn Directory> = Arc::new(crate::directory::RedisDirectory::connect(&config.redis_url).await?);
    let metrics = Arc::new(Metrics::new());
    let index: Arc<SessionIndex> = Arc::new(SessionIndex::new());

    tokio::spawn(crate::metrics::serve(config.metrics_addr, metrics.clone()));

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", config.listen_port).parse()?;
    spawn_signal_handler(index.clone());

    match &config.transport {
        TransportVariant::Datagram { passphrase, kcp } => {
            run_datagram(listen_addr, passphrase.clone(), kcp.clone(), config, directory, metrics, index).await
        }
        TransportVariant::Handshake { private_key_path } => {
            run_handshake(listen_addr, private_key_path.clone(), config, directory, metrics, index).await
        }
    }
}

fn spawn_signal_handler(index: Arc<SessionIndex>) {
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
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        info!("signal received, closing {} active sessions", index.len());
        let sessions: Vec<_> = index.iter().map(|entry| entry.value().clone()).collect();
        for session in sessions {
            session.close().await;
        }
        std::process::exit(1);
    });
}

async fn run_datagram(
    listen_addr: SocketAddr,
    passphrase: String,
    kcp: tunnel_transport::kcp_transport::KcpConfig,
    config: Config,
    directory: Arc<dyn Directory>,
    metrics: Arc<Metrics>,
    index: Arc<SessionIndex>,
) -> anyhow::Result<()> {
    let mut listener = DatagramListener::bind(listen_addr, passphrase, kcp).await?;
    info!("gateway listening on {listen_addr} (encrypted-datagram transport)");

    loop {
        let (mux, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                warn!("datagram accept error: {err}");
                continue;
            }
        };
        let conn: Box<dyn Connection> = Box::new(mux);
        let directory = directory.clone();
        let metrics = metrics.clone();
        let index = index.clone();
        let node_id = config.node_id.clone();
        let cluster_id = config.cluster_id.clone();

        tokio::spawn(async move {
            if let Err(err) = accept_datagram_session(
                conn, peer_addr, node_id, cluster_id, directory, metrics, index,
            )
            .await
            {
                warn!("datagram session rejected: {err}");
            }
        });
    }
}

async fn accept_datagram_session(
    conn: Box<dyn Connection>,
    peer_addr: SocketAddr,
    node_id: String,
    cluster_id: String,
    directory: Arc<dyn Directory>,
    metrics: Arc<Metrics>,
    index: Arc<SessionIndex>,
) -> Result<(), AuthError> {
    let mut control = conn.accept_control_stream().await?;
    let auth_message = read_auth_message(&mut control).await?;

    let backend_id = match directory.backend_id_from_token(&auth_message.token).await {
        Ok(id) if !id.is_empty() => id,
        Ok(_) => {
            let _ = send_auth_response(
                &mut control,
                &AuthResponse { ok: false, message: Some("token rejected".into()) },
            )
            .await;
            return Err(AuthError::TokenRejected);
        }
        Err(err) => {
            let _ = send_auth_response(
                &mut control,
                &AuthResponse { ok: false, message: Some("directory unavailable".into()) },
            )
            .await;
            return Err(AuthError::DirectoryUnavailable(err.to_string()));
        }
    };

    send_auth_response(&mut control, &AuthResponse { ok: true, message: None }).await?;

    let session = Session::new(
        generate_session_id(),
        backend_id,
        node_id,
        cluster_id,
        format!("{} {}", auth_message.client_name, auth_message.client_version),
        peer_addr.to_string(),
        conn,
        directory,
        metrics,
        index,
    );
    session.mark_ready().await;
    session.spawn_close_watcher();
    tokio::spawn(session.run_control_loop(control));
    Ok(())
}

async fn run_handshake(
    listen_addr: SocketAddr,
    private_key_path: String,
    config: Config,
    directory: Arc<dyn Directory>,
    metrics: Arc<Metrics>,
    index: Arc<SessionIndex>,
) -> anyhow::Result<()> {
    let server_config = tunnel_transport::ssh_transport::build_server_config(&private_key_path)?;
    let resolver = Arc::new(DirectoryTokenResolver { directory: directory.clone() });
    let ssh_listener = Arc::new(SshGatewayListener::new(server_config, resolver));

    let tcp_listener = TcpListener::bind(listen_addr).await?;
    info!("gateway listening on {listen_addr} (public-key handshake transport)");

    loop {
        let (stream, peer_addr) = match tcp_listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                warn!("handshake accept error: {err}");
                continue;
            }
        };

        let ssh_listener = ssh_listener.clone();
        let directory = directory.clone();
        let metrics = metrics.clone();
        let index = index.clone();
        let node_id = config.node_id.clone();
        let cluster_id = config.cluster_id.clone();

        // The handshake itself (key exchange, password auth, first
        // channel open) runs for as long as `russh::server::run_stream`
        // drives the connection, so it must not block the accept loop
        // the way `run_datagram` already doesn't for its own accept path.
        tokio::spawn(async move {
            match ssh_listener.handshake(stream, peer_addr).await {
                Ok((conn, backend_id)) => {
                    let session = Session::new(
                        generate_session_id(),
                        backend_id,
                        node_id,
                        cluster_id,
                        "ssh-client".to_string(),
                        peer_addr.to_string(),
                        Box::new(conn),
                        directory,
                        metrics,
                        index,
                    );
                    session.mark_ready().await;
                    session.spawn_close_watcher();
                    run_handshake_session(session).await;
                }
                Err(err) => warn!("handshake session rejected from {peer_addr}: {err}"),
            }
        });
    }
}

async fn run_handshake_session(session: Arc<Session>) {
    // The handshake variant's control stream only ever carries
    // `register-release`/`keepalive`; `remote-forward` arrives as a
    // native `tcpip-forward` request instead, handled by the forward
    // bridge below.
    let control = match session_open_control_stream(&session).await {
        Ok(c) => c,
        Err(err) => {
            warn!(session_id = %session.id(), "could not accept control stream: {err}");
            session.close().await;
            return;
        }
    };
    let bridge_session = session.clone();
    tokio::spawn(async move {
        bridge_session.run_ssh_forward_bridge().await;
    });
    session.run_control_loop(control).await;
}

async fn session_open_control_stream(
    session: &Arc<Session>,
) -> Result<Box<dyn tunnel_transport::Stream>, TransportError> {
    session.accept_control_stream().await
}
