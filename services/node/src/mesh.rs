//! The server-to-server mesh.
//!
//! Discovery hands a new server id to [`dial_peer`], which connects with a
//! small random back-off so two nodes discovering each other at the same
//! moment rarely collide.  When they do, the `CONNECTED(already_connected)`
//! reply breaks the tie: the inbound side that finds an existing live
//! session rejects, the outbound side that receives the rejection closes.
//! Either way at most one session per remote server id survives.

use crate::dispatch::{Origin, dispatch_frame};
use crate::state::{NodeState, PeerSession};
use crate::wire::{FrameReader, FrameWriter};
use cm_protocol::{
    ConnectResult, ConnectServer, Connected, Feature, Packet, features,
};
use rand::Rng;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

fn self_features() -> Vec<String> {
    vec![
        features::MESSAGES.to_owned(),
        features::TRANSLATION.to_owned(),
        features::REMINDER.to_owned(),
    ]
}

// ---------------------------------------------------------------------------
// Outbound dial
// ---------------------------------------------------------------------------

/// Dial a discovered server and, on success, run its peer read loop.
pub async fn dial_peer(
    state: Arc<NodeState>,
    server_id: String,
    ip: IpAddr,
    remote_features: Vec<Feature>,
) {
    if state.has_peer(&server_id).await {
        debug!(server_id = %server_id, "already connected, dial skipped");
        return;
    }
    let Some(port) = remote_features.first().map(|f| f.port) else {
        warn!(server_id = %server_id, "announcement carried no ports, dial skipped");
        return;
    };

    // De-synchronize mutual dials.
    let backoff = {
        let mut rng = rand::thread_rng();
        let min = state.config.mesh.dial_backoff_min.as_millis() as u64;
        let max = state.config.mesh.dial_backoff_max.as_millis() as u64;
        Duration::from_millis(rng.gen_range(min..=max))
    };
    tokio::time::sleep(backoff).await;

    if state.has_peer(&server_id).await {
        debug!(server_id = %server_id, "peer appeared during back-off, dial skipped");
        return;
    }

    let connect_timeout = state.config.mesh.connect_timeout;
    let stream = match timeout(connect_timeout, TcpStream::connect((ip, port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(server_id = %server_id, %ip, port, error = %e, "dial failed");
            return;
        }
        Err(_) => {
            warn!(server_id = %server_id, %ip, port, "dial timed out");
            return;
        }
    };

    let (mut reader, writer) = crate::wire::split(stream);
    let hello = Packet::ConnectServer(ConnectServer {
        server_id: state.config.server_id.clone(),
        features: self_features(),
    });
    if writer.send(&hello).await.is_err() {
        warn!(server_id = %server_id, "handshake write failed");
        return;
    }

    let reply = match timeout(connect_timeout, reader.next_frame()).await {
        Ok(Ok(Some(frame))) => Packet::decode(&frame),
        _ => {
            warn!(server_id = %server_id, "no handshake reply");
            writer.shutdown().await;
            return;
        }
    };
    match reply {
        Ok(Packet::Connected(Connected {
            result: ConnectResult::Connected,
        })) => {}
        Ok(Packet::Connected(Connected { result })) => {
            // Lost the mutual-dial race (or were otherwise refused).  The
            // discovery record stays, so a later probe may retry.
            info!(server_id = %server_id, ?result, "peer refused connection");
            writer.shutdown().await;
            return;
        }
        other => {
            warn!(server_id = %server_id, ?other, "unexpected handshake reply");
            writer.shutdown().await;
            return;
        }
    }

    let feature_names = remote_features.into_iter().map(|f| f.name).collect();
    let Some(session) = state
        .register_peer(server_id.clone(), feature_names, writer.clone())
        .await
    else {
        // An inbound session won the race while we were shaking hands.
        info!(server_id = %server_id, "peer session already present, closing dial");
        writer.shutdown().await;
        return;
    };

    info!(server_id = %server_id, %ip, port, "peer connected (outbound)");
    peer_loop(&state, session, reader).await;
}

// ---------------------------------------------------------------------------
// Inbound accept
// ---------------------------------------------------------------------------

/// Complete an inbound `CONNECT_SERVER` handshake and run the peer loop.
pub async fn accept_peer(
    state: &Arc<NodeState>,
    hello: ConnectServer,
    reader: FrameReader,
    writer: FrameWriter,
) {
    match state
        .register_peer(hello.server_id.clone(), hello.features, writer.clone())
        .await
    {
        None => {
            info!(server_id = %hello.server_id, "duplicate peer rejected");
            let reply = Packet::Connected(Connected {
                result: ConnectResult::AlreadyConnected,
            });
            let _ = writer.send(&reply).await;
            writer.shutdown().await;
        }
        Some(session) => {
            let reply = Packet::Connected(Connected {
                result: ConnectResult::Connected,
            });
            if writer.send(&reply).await.is_err() {
                warn!(server_id = %hello.server_id, "handshake reply failed");
                state.evict_peer(&hello.server_id).await;
                return;
            }
            info!(server_id = %hello.server_id, "peer connected (inbound)");
            peer_loop(state, session, reader).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Read loop and heartbeat
// ---------------------------------------------------------------------------

async fn peer_loop(state: &Arc<NodeState>, session: PeerSession, mut reader: FrameReader) {
    let origin = Origin::Peer(session.server_id.clone());
    loop {
        tokio::select! {
            () = session.shutdown.notified() => {
                debug!(server_id = %session.server_id, "peer loop signalled to stop");
                break;
            }
            result = reader.next_frame() => match result {
                Ok(Some(frame)) => {
                    session.touch();
                    dispatch_frame(state, &origin, &session.writer, &frame).await;
                }
                Ok(None) => {
                    info!(server_id = %session.server_id, "peer disconnected");
                    break;
                }
                Err(e) => {
                    warn!(server_id = %session.server_id, error = %e, "peer read error, closing");
                    break;
                }
            }
        }
    }
    state
        .remove_peer_if_same(&session.server_id, &session.writer)
        .await;
    session.writer.shutdown().await;
}

/// Peer liveness sweep: evict the stale, ping the rest.
pub async fn run_peer_heartbeat(state: Arc<NodeState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(state.config.heartbeat.interval);
    loop {
        tokio::select! {
            _ = interval.tick() => sweep(&state).await,
            _ = shutdown.changed() => break,
        }
    }
}

async fn sweep(state: &Arc<NodeState>) {
    let idle_limit = state.config.heartbeat.timeout;
    for session in state.peers_snapshot().await {
        if session.idle_for() > idle_limit {
            warn!(server_id = %session.server_id, "peer heartbeat timeout, evicting");
            state.evict_peer(&session.server_id).await;
            continue;
        }
        if session.writer.send(&Packet::Ping).await.is_err() {
            warn!(server_id = %session.server_id, "heartbeat write failed, evicting peer");
            state.evict_peer(&session.server_id).await;
        }
    }
}
