//! Encrypted-datagram transport variant: KCP (ARQ over UDP) with whole-
//! datagram AES-GCM encryption, exposed as an `AsyncRead + AsyncWrite`
//! byte stream that [`crate::mux::Mux`] then layers multiplexing on top
//! of. One shared `UdpSocket` serves every inbound peer on the gateway
//! side, demultiplexed by source address, mirroring a `kcp-go` listener.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use kcp::Kcp;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::crypt::DatagramCrypt;
use crate::error::TransportError;
use crate::mux::Mux;

/// Recognized KCP tuning knobs, all required except where noted, per the
/// encrypted-datagram variant's configuration surface.
#[derive(Debug, Clone)]
pub struct KcpConfig {
    pub mtu: usize,
    pub nodelay: bool,
    pub interval: i32,
    pub resend: i32,
    pub no_congestion: bool,
    pub send_window: u16,
    pub recv_window: u16,
    pub keepalive: Duration,
    /// DSCP traffic class applied to the underlying UDP socket; best
    /// effort, silently ignored on platforms without the required
    /// socket option.
    pub dscp: Option<u32>,
}

impl Default for KcpConfig {
    fn default() -> Self {
        Self {
            mtu: 1350,
            nodelay: true,
            interval: 10,
            resend: 2,
            no_congestion: true,
            send_window: 1024,
            recv_window: 1024,
            keepalive: Duration::from_secs(10),
            dscp: None,
        }
    }
}

fn apply_socket_tuning(socket: &UdpSocket, config: &KcpConfig) {
    let sock_ref = SockRef::from(socket);
    if let Some(dscp) = config.dscp {
        if let Err(err) = sock_ref.set_tos(dscp) {
            warn!("failed to set DSCP on tunnel UDP socket: {err}");
        }
    }
}

struct ChannelOutput {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl io::Write for ChannelOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "kcp output channel closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn now_millis() -> u32 {
    // Wraps every ~49 days; kcp's internal arithmetic is designed to
    // tolerate u32 wraparound the same way the original's `time.Now()`
    // millisecond counter does.
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    since_epoch.as_millis() as u32
}

/// Drives one KCP session's ARQ state machine: feeds it decrypted inbound
/// datagrams, pulls application writes into it, and reassembles inbound
/// application data for the [`KcpIo`] handle.
struct KcpActor {
    kcp: Kcp<ChannelOutput>,
    raw_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    app_write_rx: mpsc::UnboundedReceiver<Bytes>,
    app_read_tx: mpsc::Sender<Bytes>,
}

impl KcpActor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(10));
        let mut recv_buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_millis();
                    if self.kcp.update(now).is_err() {
                        break;
                    }
                }
                raw = self.raw_rx.recv() => {
                    match raw {
                        Some(datagram) => {
                            if self.kcp.input(&datagram).is_err() {
                                trace!("kcp rejected an inbound datagram");
                                continue;
                            }
                            loop {
                                match self.kcp.recv(&mut recv_buf) {
                                    Ok(n) if n > 0 => {
                                        if self.app_read_tx.send(Bytes::copy_from_slice(&recv_buf[..n])).await.is_err() {
                                            return;
                                        }
                                    }
                                    _ => break,
                                }
                            }
                        }
                        None => break,
                    }
                }
                data = self.app_write_rx.recv() => {
                    match data {
                        Some(bytes) => {
                            if self.kcp.send(&bytes).is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        debug!("kcp actor exiting, conv={}", self.kcp.conv());
    }
}

/// The `AsyncRead + AsyncWrite` handle handed to [`Mux::new`].
pub struct KcpIo {
    app_read_rx: mpsc::Receiver<Bytes>,
    current: Option<Bytes>,
    app_write_tx: mpsc::UnboundedSender<Bytes>,
}

impl AsyncRead for KcpIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some(chunk) = &mut self.current {
                let to_copy = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..to_copy]);
                chunk.advance(to_copy);
                if chunk.is_empty() {
                    self.current = None;
                }
                return Poll::Ready(Ok(()));
            }
            match self.app_read_rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    self.current = Some(bytes);
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for KcpIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.app_write_tx
            .send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "kcp actor gone"))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn build_kcp(conv: u32, config: &KcpConfig, output_tx: mpsc::UnboundedSender<Vec<u8>>) -> Kcp<ChannelOutput> {
    let mut kcp = Kcp::new(conv, ChannelOutput { tx: output_tx });
    kcp.set_nodelay(config.nodelay, config.interval, config.resend, config.no_congestion);
    let _ = kcp.set_mtu(config.mtu);
    kcp.set_wndsize(config.send_window, config.recv_window);
    kcp
}

/// Spawns the actor and UDP output pump for one KCP session and returns
/// the byte-stream handle, the decrypted-input sender the caller's UDP
/// demuxer feeds, and nothing else — callers own sending decrypted raw
/// datagrams into the returned channel as they arrive from the socket.
fn spawn_session(
    conv: u32,
    config: &KcpConfig,
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    crypt: Arc<DatagramCrypt>,
) -> (KcpIo, mpsc::UnboundedSender<Vec<u8>>) {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (app_write_tx, app_write_rx) = mpsc::unbounded_channel::<Bytes>();
    let (app_read_tx, app_read_rx) = mpsc::channel::<Bytes>(256);
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let kcp = build_kcp(conv, config, output_tx);
    let actor = KcpActor {
        kcp,
        raw_rx,
        app_write_rx,
        app_read_tx,
    };
    tokio::spawn(actor.run());

    tokio::spawn(async move {
        while let Some(packet) = output_rx.recv().await {
            let encrypted = crypt.encrypt(&packet);
            if socket.send_to(&encrypted, peer).await.is_err() {
                break;
            }
        }
    });

    (
        KcpIo {
            app_read_rx,
            current: None,
            app_write_tx,
        },
        raw_tx,
    )
}

/// Dials a gateway as the agent side of the encrypted-datagram transport.
pub async fn dial(
    target: SocketAddr,
    passphrase: &str,
    config: &KcpConfig,
) -> Result<Mux, TransportError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(TransportError::Dial)?;
    socket.connect(target).await.map_err(TransportError::Dial)?;
    apply_socket_tuning(&socket, config);
    let socket = Arc::new(socket);
    let crypt = Arc::new(DatagramCrypt::from_passphrase(passphrase));
    let conv: u32 = rand::random();

    let (io, raw_tx) = spawn_session(conv, config, socket.clone(), target, crypt.clone());

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match socket.recv(&mut buf).await {
                Ok(n) => match crypt.decrypt(&buf[..n]) {
                    Ok(plain) => {
                        if raw_tx.send(plain).is_err() {
                            break;
                        }
                    }
                    Err(_) => warn!("dropping undecryptable datagram from gateway"),
                },
                Err(_) => break,
            }
        }
    });

    Ok(Mux::new(io, true, config.keepalive))
}

/// Listens for inbound encrypted-datagram sessions on behalf of the
/// gateway. One UDP socket is shared by every connected agent; sessions
/// are demultiplexed by source address.
pub struct KcpListener {
    accept_rx: mpsc::Receiver<(Mux, SocketAddr)>,
}

impl KcpListener {
    pub async fn bind(
        addr: SocketAddr,
        passphrase: String,
        config: KcpConfig,
    ) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await.map_err(TransportError::Accept)?;
        apply_socket_tuning(&socket, &config);
        let socket = Arc::new(socket);
        let crypt = Arc::new(DatagramCrypt::from_passphrase(&passphrase));
        let (accept_tx, accept_rx) = mpsc::channel(16);

        tokio::spawn(listener_task(socket, crypt, config, accept_tx));

        Ok(Self { accept_rx })
    }

    /// Accepts the next agent session, along with its source address for
    /// the `Session`'s `client_addr` attribute.
    pub async fn accept(&mut self) -> Result<(Mux, SocketAddr), TransportError> {
        self.accept_rx.recv().await.ok_or(TransportError::Closed)
    }
}

async fn listener_task(
    socket: Arc<UdpSocket>,
    crypt: Arc<DatagramCrypt>,
    config: KcpConfig,
    accept_tx: mpsc::Sender<(Mux, SocketAddr)>,
) {
    let sessions: Arc<Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Vec<u8>>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                warn!("kcp listener socket error: {err}");
                break;
            }
        };
        let plain = match crypt.decrypt(&buf[..n]) {
            Ok(p) => p,
            Err(_) => {
                warn!("dropping undecryptable datagram from {peer}");
                continue;
            }
        };

        let existing = sessions.lock().unwrap().get(&peer).cloned();
        if let Some(raw_tx) = existing {
            if raw_tx.send(plain).is_err() {
                sessions.lock().unwrap().remove(&peer);
            }
            continue;
        }

        // First datagram from an unknown peer opens a new session. The
        // conv id is read out of the KCP header's first 4 bytes so a
        // retransmitted first segment from the same handshake reuses it.
        if plain.len() < 4 {
            continue;
        }
        let conv = u32::from_le_bytes(plain[0..4].try_into().unwrap());
        let (io, raw_tx) = spawn_session(conv, &config, socket.clone(), peer, crypt.clone());
        raw_tx.send(plain).ok();
        sessions.lock().unwrap().insert(peer, raw_tx);

        let mux = Mux::new(io, false, config.keepalive);
        if accept_tx.send((mux, peer)).await.is_err() {
            break;
        }
    }
}
