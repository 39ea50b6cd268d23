//! Node lifecycle: bind the sockets, spawn the long-lived tasks, and tear
//! everything down on shutdown.

use crate::config::NodeConfig;
use crate::discovery::DiscoveryService;
use crate::events::NodeEvent;
use crate::mesh;
use crate::reminder::{ReminderTarget, run_scheduler};
use crate::routing::run_ack_sweeper;
use crate::session::{run_client_heartbeat, run_listener};
use crate::state::NodeState;
use crate::translate::{PassthroughBackend, TranslationBackend};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("socket setup: {0}")]
    Io(#[from] std::io::Error),
}

/// A running federation node.
///
/// Binding happens in [`start`](Node::start) so port conflicts surface
/// immediately; everything after that keeps running until
/// [`shutdown`](Node::shutdown).
pub struct Node {
    state: Arc<NodeState>,
    discovery: Arc<DiscoveryService>,
    tcp_addr: SocketAddr,
    udp_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Start a node with the default (passthrough) translation backend.
    pub async fn start(config: NodeConfig) -> Result<Node, NodeError> {
        Self::start_with_backend(config, Arc::new(PassthroughBackend)).await
    }

    pub async fn start_with_backend(
        config: NodeConfig,
        translator: Arc<dyn TranslationBackend>,
    ) -> Result<Node, NodeError> {
        let state = NodeState::new(config, translator);

        let listener = TcpListener::bind(("0.0.0.0", state.config.network.tcp_port)).await?;
        let tcp_addr = listener.local_addr()?;
        let discovery = Arc::new(DiscoveryService::bind(Arc::clone(&state)).await?);
        let udp_addr = discovery.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(run_listener(
                Arc::clone(&state),
                listener,
                shutdown_rx.clone(),
            )),
            tokio::spawn(Arc::clone(&discovery).run(shutdown_rx.clone())),
            tokio::spawn(run_client_heartbeat(
                Arc::clone(&state),
                shutdown_rx.clone(),
            )),
            tokio::spawn(mesh::run_peer_heartbeat(
                Arc::clone(&state),
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_ack_sweeper(Arc::clone(&state), shutdown_rx.clone())),
            tokio::spawn(run_scheduler(Arc::clone(&state), shutdown_rx)),
        ];

        info!(
            server_id = %state.config.server_id,
            tcp = %tcp_addr,
            udp = %udp_addr,
            "node started"
        );

        Ok(Node {
            state,
            discovery,
            tcp_addr,
            udp_addr,
            shutdown_tx,
            tasks,
        })
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn server_id(&self) -> &str {
        &self.state.config.server_id
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Probe the configured peer ports for other servers.
    pub async fn discover(&self) {
        self.discovery.probe().await;
    }

    /// Schedule a reminder directly, bypassing a client session.  `target`
    /// uses the internal `userId[@serverId]` encoding; the remote form is
    /// how one server reminds a user homed elsewhere.
    pub fn schedule_reminder(&self, target: &str, event: impl Into<String>, countdown: Duration) {
        self.state
            .reminders
            .schedule(ReminderTarget::parse(target), event.into(), countdown);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.state.subscribe_events()
    }

    /// Stop every task and close every session.  Idempotent enough for a
    /// test harness: a node that is already gone just logs.
    pub async fn shutdown(self) {
        info!(server_id = %self.state.config.server_id, "node shutting down");
        let _ = self.shutdown_tx.send(true);

        for session in self.state.clients_snapshot().await {
            self.state.evict_client(&session.user.user_id).await;
        }
        for session in self.state.peers_snapshot().await {
            self.state.evict_peer(&session.server_id).await;
        }

        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}
