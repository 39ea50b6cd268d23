//! Shared node state: the client, peer, discovery, group, and pending-ack
//! registries, each behind its own lock, plus the observer channel, the
//! reminder queue, and the translation backend.
//!
//! Sessions are clone-able handles; the maps hold the canonical copy.
//! Eviction must go through `evict_client`/`evict_peer` so the read loop is
//! signalled and the socket is shut down alongside the map removal.

use crate::config::NodeConfig;
use crate::events::{NodeEvent, event_channel};
use crate::groups::Group;
use crate::reminder::ReminderQueue;
use crate::translate::TranslationBackend;
use crate::wire::FrameWriter;
use cm_protocol::{Feature, UserRef};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, RwLock, broadcast};
use tracing::info;

// ---------------------------------------------------------------------------
// Session records
// ---------------------------------------------------------------------------

/// One connected client.  At most one session per user id at any instant.
#[derive(Clone)]
pub struct ClientSession {
    pub user: UserRef,
    pub writer: FrameWriter,
    /// Updated on every received frame; heartbeat sweeps evict on staleness.
    pub last_active: Arc<StdMutex<Instant>>,
    /// Correlation handle of the client's in-flight federated search.
    pub pending_search: Arc<StdMutex<Option<u64>>>,
    /// Signalled to make the session's read loop exit.
    pub shutdown: Arc<Notify>,
}

impl ClientSession {
    fn new(user: UserRef, writer: FrameWriter) -> Self {
        ClientSession {
            user,
            writer,
            last_active: Arc::new(StdMutex::new(Instant::now())),
            pending_search: Arc::new(StdMutex::new(None)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn touch(&self) {
        *self.last_active.lock().expect("last_active lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .expect("last_active lock poisoned")
            .elapsed()
    }
}

/// One connected peer server.  At most one session per remote server id.
#[derive(Clone)]
pub struct PeerSession {
    pub server_id: String,
    pub features: Vec<String>,
    pub writer: FrameWriter,
    pub last_active: Arc<StdMutex<Instant>>,
    pub shutdown: Arc<Notify>,
}

impl PeerSession {
    fn new(server_id: String, features: Vec<String>, writer: FrameWriter) -> Self {
        PeerSession {
            server_id,
            features,
            writer,
            last_active: Arc::new(StdMutex::new(Instant::now())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn touch(&self) {
        *self.last_active.lock().expect("last_active lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .expect("last_active lock poisoned")
            .elapsed()
    }
}

/// A server learned from `SERVER_ANNOUNCE`, whether or not a peer session
/// to it exists yet.
#[derive(Debug, Clone)]
pub struct DiscoveredServer {
    pub server_id: String,
    pub ip: IpAddr,
    pub features: Vec<Feature>,
    pub first_seen: Instant,
}

/// Return route for an in-flight message, keyed by snowflake.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub source: UserRef,
    pub recorded_at: Instant,
}

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

pub struct NodeState {
    pub config: NodeConfig,
    pub clients: RwLock<HashMap<String, ClientSession>>,
    pub peers: RwLock<HashMap<String, PeerSession>>,
    pub discovered: RwLock<HashMap<String, DiscoveredServer>>,
    pub groups: RwLock<HashMap<String, Group>>,
    pub pending_acks: StdMutex<HashMap<u64, PendingAck>>,
    pub events: broadcast::Sender<NodeEvent>,
    pub reminders: ReminderQueue,
    pub translator: Arc<dyn TranslationBackend>,
}

impl NodeState {
    pub fn new(config: NodeConfig, translator: Arc<dyn TranslationBackend>) -> Arc<Self> {
        Arc::new(NodeState {
            config,
            clients: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
            discovered: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            pending_acks: StdMutex::new(HashMap::new()),
            events: event_channel(),
            reminders: ReminderQueue::new(),
            translator,
        })
    }

    /// A `UserRef` for a user homed on this node.
    pub fn user_ref(&self, user_id: impl Into<String>) -> UserRef {
        UserRef::new(user_id, self.config.server_id.clone())
    }

    pub fn emit(&self, event: NodeEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Clients
    // -----------------------------------------------------------------------

    /// Install a client session unless the user id is already connected.
    pub async fn register_client(
        &self,
        user: UserRef,
        writer: FrameWriter,
    ) -> Option<ClientSession> {
        let mut clients = self.clients.write().await;
        if clients.contains_key(&user.user_id) {
            return None;
        }
        let session = ClientSession::new(user.clone(), writer);
        clients.insert(user.user_id.clone(), session.clone());
        drop(clients);
        self.emit(NodeEvent::ClientConnected { user });
        Some(session)
    }

    pub async fn client(&self, user_id: &str) -> Option<ClientSession> {
        self.clients.read().await.get(user_id).cloned()
    }

    pub async fn clients_snapshot(&self) -> Vec<ClientSession> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Local users whose id contains `query` as a substring.
    pub async fn local_users_matching(&self, query: &str) -> Vec<UserRef> {
        let mut users: Vec<UserRef> = self
            .clients
            .read()
            .await
            .values()
            .filter(|s| s.user.user_id.contains(query))
            .map(|s| s.user.clone())
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub async fn touch_client(&self, user_id: &str) {
        if let Some(session) = self.clients.read().await.get(user_id) {
            session.touch();
        }
    }

    /// Remove the session for `user_id` if it is still the given connection.
    /// A read loop exiting after a heartbeat eviction (or after a fresh
    /// session replaced it) must not tear down the newer registration.
    pub async fn remove_client_if_same(&self, user_id: &str, writer: &FrameWriter) {
        let removed = {
            let mut clients = self.clients.write().await;
            match clients.get(user_id) {
                Some(existing) if existing.writer.same_connection(writer) => {
                    clients.remove(user_id)
                }
                _ => None,
            }
        };
        if let Some(session) = removed {
            info!(user_id = %user_id, "client session removed");
            self.emit(NodeEvent::ClientDisconnected { user: session.user });
        }
    }

    /// Forcibly tear down a client: remove from the table, signal its read
    /// loop, and close the socket.
    pub async fn evict_client(&self, user_id: &str) {
        let removed = self.clients.write().await.remove(user_id);
        if let Some(session) = removed {
            session.shutdown.notify_one();
            session.writer.shutdown().await;
            self.emit(NodeEvent::ClientDisconnected { user: session.user });
        }
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Install a peer session unless one already exists for the server id.
    pub async fn register_peer(
        &self,
        server_id: String,
        features: Vec<String>,
        writer: FrameWriter,
    ) -> Option<PeerSession> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&server_id) {
            return None;
        }
        let session = PeerSession::new(server_id.clone(), features, writer);
        peers.insert(server_id.clone(), session.clone());
        drop(peers);
        self.emit(NodeEvent::PeerConnected { server_id });
        Some(session)
    }

    pub async fn peer(&self, server_id: &str) -> Option<PeerSession> {
        self.peers.read().await.get(server_id).cloned()
    }

    pub async fn has_peer(&self, server_id: &str) -> bool {
        self.peers.read().await.contains_key(server_id)
    }

    pub async fn peers_snapshot(&self) -> Vec<PeerSession> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn touch_peer(&self, server_id: &str) {
        if let Some(session) = self.peers.read().await.get(server_id) {
            session.touch();
        }
    }

    pub async fn remove_peer_if_same(&self, server_id: &str, writer: &FrameWriter) {
        let removed = {
            let mut peers = self.peers.write().await;
            match peers.get(server_id) {
                Some(existing) if existing.writer.same_connection(writer) => {
                    peers.remove(server_id)
                }
                _ => None,
            }
        };
        if removed.is_some() {
            info!(server_id = %server_id, "peer session removed");
            self.emit(NodeEvent::PeerDisconnected {
                server_id: server_id.to_owned(),
            });
        }
    }

    pub async fn evict_peer(&self, server_id: &str) {
        let removed = self.peers.write().await.remove(server_id);
        if let Some(session) = removed {
            session.shutdown.notify_one();
            session.writer.shutdown().await;
            self.emit(NodeEvent::PeerDisconnected {
                server_id: server_id.to_owned(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Discovery table
    // -----------------------------------------------------------------------

    /// Record an announced server.  Returns true the first time a server id
    /// is seen (the caller then initiates a dial).
    pub async fn record_discovered(
        &self,
        server_id: String,
        ip: IpAddr,
        features: Vec<Feature>,
    ) -> bool {
        let mut discovered = self.discovered.write().await;
        let is_new = !discovered.contains_key(&server_id);
        discovered.insert(
            server_id.clone(),
            DiscoveredServer {
                server_id,
                ip,
                features,
                first_seen: Instant::now(),
            },
        );
        is_new
    }

    pub async fn discovered_server(&self, server_id: &str) -> Option<DiscoveredServer> {
        self.discovered.read().await.get(server_id).cloned()
    }

    // -----------------------------------------------------------------------
    // Pending acks
    // -----------------------------------------------------------------------

    pub fn record_pending_ack(&self, snowflake: u64, source: UserRef) {
        self.pending_acks
            .lock()
            .expect("pending_acks lock poisoned")
            .insert(
                snowflake,
                PendingAck {
                    source,
                    recorded_at: Instant::now(),
                },
            );
    }

    /// Consume the return route for a snowflake, if one is known.
    pub fn take_pending_ack(&self, snowflake: u64) -> Option<PendingAck> {
        self.pending_acks
            .lock()
            .expect("pending_acks lock poisoned")
            .remove(&snowflake)
    }

    /// Drop entries older than `ttl`; returns how many were evicted.
    pub fn evict_expired_acks(&self, ttl: Duration) -> usize {
        let mut acks = self.pending_acks.lock().expect("pending_acks lock poisoned");
        let before = acks.len();
        acks.retain(|_, entry| entry.recorded_at.elapsed() < ttl);
        before - acks.len()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks
            .lock()
            .expect("pending_acks lock poisoned")
            .len()
    }
}
