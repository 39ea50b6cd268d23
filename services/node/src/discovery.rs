//! UDP server discovery.
//!
//! Every node listens on its discovery port with broadcast enabled.  A
//! `DISCOVER_SERVER` datagram gets a unicast `SERVER_ANNOUNCE` back to the
//! sender, plus the same announcement broadcast to every configured peer
//! port (except this node's own).  Announcements from other servers are
//! recorded and handed to the mesh for an outbound dial.
//!
//! Broadcast sends are best-effort: a LAN that filters limited broadcast
//! only degrades bootstrap, never the running node.

use crate::mesh;
use crate::state::NodeState;
use cm_protocol::{Feature, Packet, ServerAnnounce, decode_datagram, features};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outbound discovery uses the IPv4 limited broadcast address.
pub const BROADCAST_IP: Ipv4Addr = Ipv4Addr::BROADCAST;

const MAX_DATAGRAM: usize = 2048;

/// The features this node announces, all served on its TCP port.
pub fn advertised_features(tcp_port: u16) -> Vec<Feature> {
    [features::MESSAGES, features::TRANSLATION, features::REMINDER]
        .into_iter()
        .map(|name| Feature {
            name: name.to_owned(),
            port: tcp_port,
        })
        .collect()
}

/// Peer ports worth broadcasting to: the configured set minus our own.
pub fn broadcast_targets(state: &NodeState) -> Vec<u16> {
    state
        .config
        .network
        .peer_ports
        .iter()
        .copied()
        .filter(|&port| port != state.config.network.udp_port)
        .collect()
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct DiscoveryService {
    state: Arc<NodeState>,
    socket: Arc<UdpSocket>,
}

impl DiscoveryService {
    /// Bind the discovery socket on the configured port with broadcast
    /// enabled.
    pub async fn bind(state: Arc<NodeState>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", state.config.network.udp_port)).await?;
        socket.set_broadcast(true)?;
        info!(
            port = socket.local_addr()?.port(),
            "discovery listening"
        );
        Ok(DiscoveryService {
            state,
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Operator bootstrap: probe every configured peer port once.
    pub async fn probe(&self) {
        let probe = Packet::DiscoverServer.encode();
        for port in &self.state.config.network.peer_ports {
            if let Err(e) = self
                .socket
                .send_to(&probe, (BROADCAST_IP, *port))
                .await
            {
                warn!(port, error = %e, "discover probe failed");
            }
        }
        info!(
            ports = ?self.state.config.network.peer_ports,
            "discover probe sent"
        );
    }

    /// The discovery receive loop.  Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    Err(e) => {
                        warn!(error = %e, "discovery receive error");
                    }
                }
            }
        }
        info!("discovery listener stopped");
    }

    async fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        let frame = match decode_datagram(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(from = %from, error = %e, "undecodable discovery datagram ignored");
                return;
            }
        };
        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(from = %from, error = %e, "unexpected discovery frame ignored");
                return;
            }
        };

        match packet {
            Packet::DiscoverServer => self.answer_probe(from).await,
            Packet::ServerAnnounce(announce) => self.record_announce(announce, from.ip()).await,
            other => {
                debug!(from = %from, purpose = other.purpose(), "discovery frame ignored");
            }
        }
    }

    /// Reply to a probe: unicast to the asker, broadcast to the peer ports.
    async fn answer_probe(&self, from: SocketAddr) {
        let announce = self.announce_packet().encode();
        if let Err(e) = self.socket.send_to(&announce, from).await {
            warn!(to = %from, error = %e, "announce unicast failed");
        } else {
            debug!(to = %from, "announced in reply to probe");
        }
        for port in broadcast_targets(&self.state) {
            if let Err(e) = self.socket.send_to(&announce, (BROADCAST_IP, port)).await {
                debug!(port, error = %e, "announce broadcast failed");
            }
        }
    }

    async fn record_announce(&self, announce: ServerAnnounce, ip: IpAddr) {
        if announce.server_id == self.state.config.server_id {
            return;
        }
        let is_new = self
            .state
            .record_discovered(announce.server_id.clone(), ip, announce.features.clone())
            .await;
        if is_new {
            info!(
                server_id = %announce.server_id,
                ip = %ip,
                features = announce.features.len(),
                "discovered new server"
            );
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                mesh::dial_peer(state, announce.server_id, ip, announce.features).await;
            });
        }
    }

    fn announce_packet(&self) -> Packet {
        Packet::ServerAnnounce(ServerAnnounce {
            server_id: self.state.config.server_id.clone(),
            features: advertised_features(self.state.config.network.tcp_port),
        })
    }
}
