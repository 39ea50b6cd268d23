//! TCP accept path and client sessions.
//!
//! One TCP port serves both clients and peers; the first frame
//! disambiguates.  `CONNECT_CLIENT` starts a client session (subject to the
//! one-session-per-user rule), `CONNECT_SERVER` hands the connection to the
//! mesh, anything else closes the socket.

use crate::dispatch::{Origin, dispatch_frame};
use crate::mesh;
use crate::state::{ClientSession, NodeState};
use cm_protocol::{ConnectResult, Connected, Packet, UserRef};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The accept loop.  Each connection gets its own task; a failed accept is
/// logged and the loop continues.
pub async fn run_listener(
    state: Arc<NodeState>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(peer_addr = %addr, "inbound tcp connection");
                    let state = Arc::clone(&state);
                    tokio::spawn(handle_connection(state, stream, addr));
                }
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                }
            }
        }
    }
    info!("tcp listener stopped");
}

async fn handle_connection(
    state: Arc<NodeState>,
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
) {
    let (mut reader, writer) = crate::wire::split(stream);

    // The first frame must identify the connection; a silent or malformed
    // opener is closed without ceremony.
    let first = match timeout(state.config.heartbeat.timeout, reader.next_frame()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => {
            debug!(peer_addr = %addr, "connection closed before identifying");
            return;
        }
        Ok(Err(e)) => {
            warn!(peer_addr = %addr, error = %e, "malformed first frame, closing");
            writer.shutdown().await;
            return;
        }
        Err(_) => {
            debug!(peer_addr = %addr, "no identification frame in time, closing");
            writer.shutdown().await;
            return;
        }
    };

    match Packet::decode(&first) {
        Ok(Packet::ConnectClient(connect)) => {
            run_client_session(&state, connect.user, reader, writer).await;
        }
        Ok(Packet::ConnectServer(hello)) => {
            mesh::accept_peer(&state, hello, reader, writer).await;
        }
        other => {
            warn!(
                peer_addr = %addr,
                purpose = %first.purpose,
                decoded_ok = other.is_ok(),
                "first frame is neither connect_client nor connect_server, closing"
            );
            writer.shutdown().await;
        }
    }
}

async fn run_client_session(
    state: &Arc<NodeState>,
    user: UserRef,
    mut reader: crate::wire::FrameReader,
    writer: crate::wire::FrameWriter,
) {
    let Some(session) = state.register_client(user.clone(), writer.clone()).await else {
        info!(user_id = %user.user_id, "duplicate client identity rejected");
        let reply = Packet::Connected(Connected {
            result: ConnectResult::IsAlreadyConnected,
        });
        let _ = writer.send(&reply).await;
        writer.shutdown().await;
        return;
    };

    let reply = Packet::Connected(Connected {
        result: ConnectResult::Connected,
    });
    if writer.send(&reply).await.is_err() {
        warn!(user_id = %user.user_id, "connect reply failed");
        state.evict_client(&user.user_id).await;
        return;
    }
    info!(user_id = %user.user_id, server_id = %user.server_id, "client connected");

    receive_loop(state, &session, &mut reader).await;

    state
        .remove_client_if_same(&user.user_id, &session.writer)
        .await;
    session.writer.shutdown().await;
}

async fn receive_loop(
    state: &Arc<NodeState>,
    session: &ClientSession,
    reader: &mut crate::wire::FrameReader,
) {
    let origin = Origin::Client(session.user.clone());
    loop {
        tokio::select! {
            () = session.shutdown.notified() => {
                debug!(user_id = %session.user.user_id, "client loop signalled to stop");
                break;
            }
            result = reader.next_frame() => match result {
                Ok(Some(frame)) => {
                    session.touch();
                    dispatch_frame(state, &origin, &session.writer, &frame).await;
                }
                Ok(None) => {
                    info!(user_id = %session.user.user_id, "client disconnected");
                    break;
                }
                Err(e) => {
                    warn!(
                        user_id = %session.user.user_id,
                        error = %e,
                        "client read error, closing"
                    );
                    break;
                }
            }
        }
    }
}

/// Client liveness sweep: evict the stale, ping the rest.
pub async fn run_client_heartbeat(state: Arc<NodeState>, mut shutdown: watch::Receiver<bool>) {
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
    for session in state.clients_snapshot().await {
        if session.idle_for() > idle_limit {
            warn!(user_id = %session.user.user_id, "client heartbeat timeout, evicting");
            state.evict_client(&session.user.user_id).await;
            continue;
        }
        if session.writer.send(&Packet::Ping).await.is_err() {
            warn!(user_id = %session.user.user_id, "heartbeat write failed, evicting client");
            state.evict_client(&session.user.user_id).await;
        }
    }
}
