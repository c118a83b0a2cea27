//! Directory client: reads and writes backend tokens, session state,
//! heartbeats and release metadata against the external key-value store
//! (Redis, per the original's `remote.go` `newRedisPool`/`garyburd/redigo`
//! use). Every write off the hot path is fire-and-forget: callers enqueue
//! onto a bounded in-process queue and return immediately, so a slow or
//! unreachable directory never blocks the accept loop. Only token
//! resolution during authentication is synchronous, because its failure
//! must reject the session.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Notify;
use tracing::warn;
use tunnel_protocol::{DirectoryRecord, Release};

use crate::error::DirectoryError;
use crate::session::Session;

/// Depth of the pending-write queue. Sized generously for bursts of
/// connect/heartbeat traffic; once full, the oldest pending write is
/// dropped (with a warning) rather than blocking producers, per the
/// fire-and-forget design note.
const WRITE_QUEUE_DEPTH: usize = 1024;

/// Operations exposed to `Session`. `backend_id_from_token` is the only
/// fallible, synchronous member — every other call is best-effort and
/// never surfaces a failure to its caller.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn backend_id_from_token(&self, token: &str) -> Result<String, DirectoryError>;
    async fn register_connection(&self, session: &Session);
    async fn register_disconnection(&self, session: &Session);
    async fn register_endpoint(&self, session: &Session);
    async fn register_heartbeat(&self, session: &Session);
    async fn register_release(&self, session: &Session);
    async fn update_attribute(&self, session: &Session, name: &str, value: &str);
}

/// One pending hot-path write, enqueued by a `Session` and drained by the
/// background task spawned in [`RedisDirectory::connect`].
enum Write {
    Connect(DirectoryRecord),
    Disconnect { session_id: String, backend_id: String },
    Endpoint { session_id: String, addr: String },
    Heartbeat { session_id: String, at: i64 },
    Release { backend_id: String, release: Release },
    Attribute { session_id: String, name: String, value: String },
}

struct WriteQueue {
    inner: Mutex<VecDeque<Write>>,
    notify: Notify,
}

impl WriteQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, item: Write) {
        let mut q = self.inner.lock().unwrap();
        if q.len() >= WRITE_QUEUE_DEPTH {
            q.pop_front();
            warn!("directory write queue full, dropping oldest pending write");
        }
        q.push_back(item);
        drop(q);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Write {
        loop {
            if let Some(item) = self.inner.lock().unwrap().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

fn session_key(session_id: &str) -> String {
    format!("wormhole:session:{session_id}")
}

fn backend_sessions_key(backend_id: &str) -> String {
    format!("wormhole:backend:{backend_id}:sessions")
}

fn token_key(token: &str) -> String {
    format!("wormhole:token:{token}")
}

fn release_key(backend_id: &str) -> String {
    format!("wormhole:backend:{backend_id}:release")
}

/// Redis-backed [`Directory`]. Every hot-path write runs through
/// [`WriteQueue`]; only `backend_id_from_token` talks to Redis inline.
pub struct RedisDirectory {
    manager: ConnectionManager,
    queue: std::sync::Arc<WriteQueue>,
}

impl RedisDirectory {
    /// Connects to `redis_url` and spawns the background writer task.
    /// Connection failure here is fatal at startup (§6 exit code 1).
    pub async fn connect(redis_url: &str) -> Result<Self, DirectoryError> {
        let client = redis::Client::open(redis_url).map_err(DirectoryError::from)?;
        let manager = client.get_connection_manager().await.map_err(DirectoryError::from)?;
        let queue = std::sync::Arc::new(WriteQueue::new());

        let drain_manager = manager.clone();
        let drain_queue = queue.clone();
        tokio::spawn(async move {
            loop {
                let write = drain_queue.pop().await;
                if let Err(err) = apply_write(&drain_manager, write).await {
                    warn!("directory write failed: {err}");
                }
            }
        });

        Ok(Self { manager, queue })
    }
}

async fn apply_write(manager: &ConnectionManager, write: Write) -> Result<(), DirectoryError> {
    let mut conn = manager.clone();
    match write {
        Write::Connect(record) => {
            let key = session_key(&record.session_id);
            let fields: Vec<(&str, String)> = vec![
                ("node_id", record.node_id.clone()),
                ("backend_id", record.backend_id.clone()),
                ("cluster_id", record.cluster_id.clone()),
                ("client_addr", record.client_addr.clone()),
                ("client_agent", record.client_agent.clone()),
                ("connected_at", record.connected_at.to_string()),
                ("last_heartbeat_at", record.last_heartbeat_at.to_string()),
            ];
            conn.hset_multiple(&key, &fields).await?;
            conn.sadd(backend_sessions_key(&record.backend_id), &record.session_id)
                .await?;
        }
        Write::Disconnect { session_id, backend_id } => {
            conn.del(session_key(&session_id)).await?;
            conn.srem(backend_sessions_key(&backend_id), &session_id).await?;
        }
        Write::Endpoint { session_id, addr } => {
            conn.hset(session_key(&session_id), "client_addr", addr).await?;
        }
        Write::Heartbeat { session_id, at } => {
            conn.hset(session_key(&session_id), "last_heartbeat_at", at).await?;
        }
        Write::Release { backend_id, release } => {
            conn.hset_multiple(
                release_key(&backend_id),
                &[("version", release.version), ("build", release.build)],
            )
            .await?;
        }
        Write::Attribute { session_id, name, value } => {
            conn.hset(session_key(&session_id), name, value).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn backend_id_from_token(&self, token: &str) -> Result<String, DirectoryError> {
        let mut conn = self.manager.clone();
        let backend_id: Option<String> = conn.get(token_key(token)).await?;
        Ok(backend_id.unwrap_or_default())
    }

    async fn register_connection(&self, session: &Session) {
        self.queue.push(Write::Connect(session.to_record()));
    }

    async fn register_disconnection(&self, session: &Session) {
        self.queue.push(Write::Disconnect {
            session_id: session.id().to_string(),
            backend_id: session.backend_id().to_string(),
        });
    }

    async fn register_endpoint(&self, session: &Session) {
        self.queue.push(Write::Endpoint {
            session_id: session.id().to_string(),
            addr: session.client_addr(),
        });
    }

    async fn register_heartbeat(&self, session: &Session) {
        self.queue.push(Write::Heartbeat {
            session_id: session.id().to_string(),
            at: session.last_heartbeat_at(),
        });
    }

    async fn register_release(&self, session: &Session) {
        if let Some(release) = session.release() {
            self.queue.push(Write::Release {
                backend_id: session.backend_id().to_string(),
                release,
            });
        }
    }

    async fn update_attribute(&self, session: &Session, name: &str, value: &str) {
        self.queue.push(Write::Attribute {
            session_id: session.id().to_string(),
            name: name.to_string(),
            value: value.to_string(),
        });
    }
}

/// In-memory [`Directory`] fake used by tests that exercise `Session`
/// without a real Redis instance, mirroring the abstraction boundary
/// `AppState`'s `DashMap` registries already give callers in the teacher.
#[cfg(test)]
pub mod fake {
    use super::*;
    use dashmap::DashMap;

    #[derive(Default)]
    pub struct InMemoryDirectory {
        pub tokens: DashMap<String, String>,
        pub connected: DashMap<String, DirectoryRecord>,
        pub releases: DashMap<String, Release>,
    }

    impl InMemoryDirectory {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Directory for InMemoryDirectory {
        async fn backend_id_from_token(&self, token: &str) -> Result<String, DirectoryError> {
            Ok(self.tokens.get(token).map(|v| v.clone()).unwrap_or_default())
        }

        async fn register_connection(&self, session: &Session) {
            let record = session.to_record();
            self.connected.insert(record.session_id.clone(), record);
        }

        async fn register_disconnection(&self, session: &Session) {
            self.connected.remove(session.id());
        }

        async fn register_endpoint(&self, _session: &Session) {}

        async fn register_heartbeat(&self, session: &Session) {
            if let Some(mut record) = self.connected.get_mut(session.id()) {
                record.last_heartbeat_at = session.last_heartbeat_at();
            }
        }

        async fn register_release(&self, session: &Session) {
            if let Some(release) = session.release() {
                self.releases.insert(session.backend_id().to_string(), release);
            }
        }

        async fn update_attribute(&self, _session: &Session, _name: &str, _value: &str) {}
    }
}
