//! One live agent↔gateway tunnel. Mirrors `session/ssh_session.go`'s
//! `SSHSession`/`baseSession` split, generalized so both transport
//! variants drive the same state machine and control-request dispatch
//! instead of each owning its own copy.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tunnel_protocol::{
    decode, encode, ControlReply, ControlRequest, DirectoryRecord, Release,
};
use tunnel_transport::auth::{read_framed, write_framed};
use tunnel_transport::{Connection, Stream};

use crate::directory::Directory;
use crate::ingress;
use crate::metrics::Metrics;

/// Gateway-wide session index: id -> Session. Single-producer insertion
/// (the accept loop, via [`Session::mark_ready`]), single-producer
/// removal (the close path, via [`Session::close`]); every other reader
/// (metrics, signal handling) takes a lock-free snapshot.
pub type SessionIndex = DashMap<String, Arc<Session>>;

/// States from §4.4's table. Transitions are asserted at the call sites
/// that drive them rather than enforced by a generic FSM library, the
/// way the teacher favors plain enums over framework machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Handshaking,
    Authenticating,
    Ready,
    Forwarding,
    Closed,
}

pub struct Session {
    id: String,
    backend_id: String,
    node_id: String,
    cluster_id: String,
    client_agent: String,
    client_addr: String,
    connected_at: i64,
    last_heartbeat_at: AtomicI64,
    release: Mutex<Option<Release>>,
    conn: Box<dyn Connection>,
    state: Mutex<SessionState>,
    directory: Arc<dyn Directory>,
    metrics: Arc<Metrics>,
    index: Arc<SessionIndex>,
}

#[allow(clippy::too_many_arguments)]
impl Session {
    /// Constructs a `Session` already past authentication — both
    /// transport variants resolve a backend id before this is called
    /// (the datagram variant via [`crate::run_control_loop`]'s initial
    /// auth exchange, the handshake variant inline during its password
    /// callback), so there is no separate "authenticate" entry point
    /// here; this *is* the Ready-state constructor.
    pub fn new(
        id: String,
        backend_id: String,
        node_id: String,
        cluster_id: String,
        client_agent: String,
        client_addr: String,
        conn: Box<dyn Connection>,
        directory: Arc<dyn Directory>,
        metrics: Arc<Metrics>,
        index: Arc<SessionIndex>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            backend_id,
            node_id,
            cluster_id,
            client_agent,
            client_addr,
            connected_at: now(),
            last_heartbeat_at: AtomicI64::new(now()),
            release: Mutex::new(None),
            conn,
            state: Mutex::new(SessionState::Ready),
            directory,
            metrics,
            index,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn client_agent(&self) -> &str {
        &self.client_agent
    }

    pub fn client_addr(&self) -> String {
        self.client_addr.clone()
    }

    pub fn last_heartbeat_at(&self) -> i64 {
        self.last_heartbeat_at.load(Ordering::SeqCst)
    }

    pub fn release(&self) -> Option<Release> {
        self.release.lock().unwrap().clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Opens a data stream for one inbound public connection; used by
    /// `gateway::ingress` so it never has to reach past `Session` into
    /// the concrete transport.
    pub async fn open_data_stream(
        &self,
        descriptor: tunnel_protocol::DirectForward,
    ) -> Result<Box<dyn Stream>, tunnel_transport::TransportError> {
        self.conn.open_data_stream(descriptor).await
    }

    /// Accepts the session's control stream. Only the handshake variant's
    /// supervisor calls this directly — the datagram variant's control
    /// stream is already in hand (and authenticated) before `Session` is
    /// even constructed, since auth has to happen first to resolve the
    /// backend id this constructor requires.
    pub async fn accept_control_stream(&self) -> Result<Box<dyn Stream>, tunnel_transport::TransportError> {
        self.conn.accept_control_stream().await
    }

    pub fn metrics_channel_opened(&self) {
        self.metrics.channel_opened(&self.backend_id, &self.node_id, &self.cluster_id);
    }

    pub fn metrics_channel_closed(&self) {
        self.metrics.channel_closed(&self.backend_id, &self.node_id, &self.cluster_id);
    }

    pub fn to_record(&self) -> DirectoryRecord {
        DirectoryRecord {
            session_id: self.id.clone(),
            node_id: self.node_id.clone(),
            backend_id: self.backend_id.clone(),
            cluster_id: self.cluster_id.clone(),
            client_addr: self.client_addr.clone(),
            client_agent: self.client_agent.clone(),
            connected_at: self.connected_at,
            last_heartbeat_at: self.last_heartbeat_at(),
            release: self.release(),
        }
    }

    /// Registers the session: inserts into the in-memory index and writes
    /// through to the directory, bumps the open-sessions gauge. Per §5,
    /// this happens-before any data-stream accept.
    pub async fn mark_ready(self: &Arc<Self>) {
        self.index.insert(self.id.clone(), self.clone());
        self.directory.register_connection(self).await;
        self.metrics.session_opened(&self.backend_id, &self.node_id, &self.cluster_id);
    }

    fn enter_forwarding(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Ready {
            *state = SessionState::Forwarding;
        }
    }

    /// Tears the session down. Idempotent: a second call observes the
    /// same state as the first and does no further work.
    pub async fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.conn.close().await;
        self.directory.register_disconnection(self).await;
        self.index.remove(&self.id);
        self.metrics.session_closed(&self.backend_id, &self.node_id, &self.cluster_id);
        debug!(session_id = %self.id, backend_id = %self.backend_id, "session closed");
    }

    /// Spawns a task that waits for the underlying transport connection
    /// to report itself closed (peer hangup, keepalive timeout) and
    /// closes the session in response. Lets callers `tokio::spawn` the
    /// control loop and the ssh forward bridge independently without
    /// either one owning shutdown.
    pub fn spawn_close_watcher(self: &Arc<Self>) {
        let session = self.clone();
        tokio::spawn(async move {
            session.conn.closed().await;
            session.close().await;
        });
    }

    /// Datagram-variant control loop: reads length-prefixed
    /// [`ControlRequest`] frames off `control` and dispatches each as its
    /// own task, per §5 ("a slow heartbeat write cannot block accept").
    /// Handshake-variant sessions run this too, for `register-release`
    /// and `keepalive` only — their `remote-forward` arrives natively via
    /// [`Session::run_ssh_forward_bridge`] instead.
    pub async fn run_control_loop(self: Arc<Self>, control: Box<dyn Stream>) {
        let (mut reader, mut writer) = tokio::io::split(control);
        let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(32);

        tokio::spawn(async move {
            while let Some(bytes) = reply_rx.recv().await {
                if write_framed(&mut writer, &bytes).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let bytes = match read_framed(&mut reader).await {
                Ok(b) => b,
                Err(_) => break,
            };
            let request: ControlRequest = match decode(&bytes) {
                Ok(r) => r,
                Err(err) => {
                    warn!(session_id = %self.id, "malformed control request: {err}");
                    continue;
                }
            };
            let session = self.clone();
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                let reply = session.handle_request(request).await;
                if let Ok(encoded) = encode(&reply) {
                    let _ = reply_tx.send(encoded).await;
                }
            });
        }

        drop(reader);
        self.close().await;
    }

    async fn handle_request(self: &Arc<Self>, request: ControlRequest) -> ControlReply {
        match request {
            ControlRequest::RemoteForward(forward) => self.handle_remote_forward(forward.port).await,
            ControlRequest::RegisterRelease(release) => {
                *self.release.lock().unwrap() = Some(release);
                self.directory.register_release(self).await;
                ControlReply::Ok
            }
            ControlRequest::Keepalive => {
                self.last_heartbeat_at.store(now(), Ordering::SeqCst);
                self.directory.register_heartbeat(self).await;
                ControlReply::Ok
            }
        }
    }

    async fn handle_remote_forward(self: &Arc<Self>, requested_port: u32) -> ControlReply {
        let listener = match TcpListener::bind(("0.0.0.0", requested_port as u16)).await {
            Ok(l) => l,
            Err(err) => return ControlReply::Err(format!("bind failed: {err}")),
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port() as u32,
            Err(err) => return ControlReply::Err(format!("could not read bound address: {err}")),
        };

        self.enter_forwarding();
        let session = self.clone();
        tokio::spawn(async move {
            ingress::run(listener, session).await;
        });

        if requested_port == 0 {
            ControlReply::ForwardedPort(bound_port)
        } else {
            ControlReply::Ok
        }
    }

    /// Handshake-variant only: waits for each TCP listener the `russh`
    /// server handler bound in response to a native `tcpip-forward`
    /// request, and spawns the ingress forwarder on it. The
    /// encrypted-datagram variant's [`tunnel_transport::Connection::next_forward_listener`]
    /// never resolves, so this simply never returns for that variant.
    pub async fn run_ssh_forward_bridge(self: Arc<Self>) {
        while let Some(listener) = self.conn.next_forward_listener().await {
            if self.is_closed() {
                break;
            }
            self.enter_forwarding();
            let session = self.clone();
            tokio::spawn(async move {
                ingress::run(listener, session).await;
            });
        }
    }
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Generates a random hex session id for the encrypted-datagram variant,
/// the closest idiomatic stand-in for the original's `xid.New().String()`
/// (the handshake variant instead uses the hex-encoded SSH session id
/// `russh` hands back, per `session/ssh_session.go`'s
/// `hex.EncodeToString(c.SessionID())`).
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fake::InMemoryDirectory;
    use async_trait::async_trait;
    use tunnel_transport::TransportError;

    struct NullConnection;

    #[async_trait]
    impl Connection for NullConnection {
        async fn open_control_stream(&self) -> Result<Box<dyn Stream>, TransportError> {
            Err(TransportError::Closed)
        }
        async fn accept_control_stream(&self) -> Result<Box<dyn Stream>, TransportError> {
            Err(TransportError::Closed)
        }
        async fn open_data_stream(
            &self,
            _descriptor: tunnel_protocol::DirectForward,
        ) -> Result<Box<dyn Stream>, TransportError> {
            Err(TransportError::Closed)
        }
        async fn accept_data_stream(
            &self,
        ) -> Result<(Box<dyn Stream>, tunnel_protocol::DirectForward), TransportError> {
            Err(TransportError::Closed)
        }
        async fn close(&self) {}
        async fn closed(&self) {
            std::future::pending().await
        }
    }

    fn test_session(index: Arc<SessionIndex>, directory: Arc<dyn Directory>) -> Arc<Session> {
        Session::new(
            "sess-1".into(),
            "B1".into(),
            "node-a".into(),
            "cluster-1".into(),
            "wormhole 0.1.0".into(),
            "203.0.113.7:51000".into(),
            Box::new(NullConnection),
            directory,
            Arc::new(Metrics::new()),
            index,
        )
    }

    #[tokio::test]
    async fn close_is_idempotent_and_removes_from_index_and_directory() {
        let index = Arc::new(SessionIndex::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let session = test_session(index.clone(), directory.clone());

        session.mark_ready().await;
        assert!(index.contains_key("sess-1"));
        assert!(directory.connected.contains_key("sess-1"));

        session.close().await;
        assert!(!index.contains_key("sess-1"));
        assert!(!directory.connected.contains_key("sess-1"));

        // Second close observes the same state; no panic, no re-removal.
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn register_release_then_restart_reports_latest_release() {
        let index = Arc::new(SessionIndex::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let session = test_session(index.clone(), directory.clone());
        session.mark_ready().await;

        let reply = session
            .handle_request(ControlRequest::RegisterRelease(Release {
                version: "v42".into(),
                build: "abc".into(),
            }))
            .await;
        assert_eq!(reply, ControlReply::Ok);

        let stored = directory.releases.get("B1").unwrap();
        assert_eq!(stored.version, "v42");
        assert_eq!(stored.build, "abc");
    }

    #[tokio::test]
    async fn remote_forward_with_port_zero_returns_nonzero_allocated_port() {
        let index = Arc::new(SessionIndex::new());
        let directory = Arc::new(InMemoryDirectory::new());
        let session = test_session(index.clone(), directory.clone());
        session.mark_ready().await;

        let reply = session.handle_remote_forward(0).await;
        match reply {
            ControlReply::ForwardedPort(port) => assert_ne!(port, 0),
            other => panic!("unexpected reply: {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Forwarding);
    }
}
