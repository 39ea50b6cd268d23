//! Message routing and delivery-acknowledgement correlation.
//!
//! A user-addressed message is delivered to a local session, forwarded to
//! the home peer, or — when the home server is not connected — broadcast to
//! every peer as a best-effort find-the-home-server fallback.  Before any
//! of that, the return route for the eventual `MESSAGE_ACK` is recorded
//! under the message snowflake, so the ack can retrace the path hop by hop.
//!
//! Group messages fan out on the owning server only.  Remote members
//! receive a copy readdressed to them, because the group itself does not
//! exist on their home server.

use crate::state::NodeState;
use crate::translate::translate_or_original;
use cm_protocol::{ChatMessage, Content, GroupRef, MessageAck, Packet, Recipient, UserRef};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub async fn handle_message(state: &Arc<NodeState>, mut msg: ChatMessage) {
    // Translation intercept: fill in the translated text while the message
    // transits this server, before any routing decision.
    if let Content::Translation(t) = &mut msg.content {
        if !t.original_text.is_empty() && t.translated_text.is_empty() {
            t.translated_text =
                translate_or_original(state.translator.as_ref(), &t.original_text, t.target_lang);
        }
    }

    match msg.recipient.clone() {
        Recipient::User(target) => route_to_user(state, msg, target).await,
        Recipient::Group(group) => route_to_group(state, msg, &group).await,
    }
}

async fn route_to_user(state: &Arc<NodeState>, msg: ChatMessage, target: UserRef) {
    state.record_pending_ack(msg.snowflake, msg.author.clone());

    if let Some(session) = state.client(&target.user_id).await {
        let packet = Packet::Message(msg);
        if session.writer.send(&packet).await.is_err() {
            warn!(user_id = %target.user_id, "message delivery failed, evicting client");
            state.evict_client(&target.user_id).await;
        } else {
            debug!(user_id = %target.user_id, "message delivered locally");
        }
        return;
    }

    if let Some(peer) = state.peer(&target.server_id).await {
        let packet = Packet::Message(msg);
        if peer.writer.send(&packet).await.is_err() {
            warn!(server_id = %target.server_id, "message forward failed, evicting peer");
            state.evict_peer(&target.server_id).await;
        } else {
            debug!(
                user_id = %target.user_id,
                server_id = %target.server_id,
                "message forwarded to home server"
            );
        }
        return;
    }

    // No session and no matching peer: broadcast so whichever server is
    // home can still deliver.
    let peers = state.peers_snapshot().await;
    if peers.is_empty() {
        warn!(
            user_id = %target.user_id,
            server_id = %target.server_id,
            "no route to recipient, message dropped"
        );
        return;
    }
    info!(
        user_id = %target.user_id,
        server_id = %target.server_id,
        peer_count = peers.len(),
        "recipient's home server unknown, broadcasting to all peers"
    );
    let packet = Packet::Message(msg);
    for peer in peers {
        if peer.writer.send(&packet).await.is_err() {
            warn!(server_id = %peer.server_id, "broadcast forward failed, evicting peer");
            state.evict_peer(&peer.server_id).await;
        }
    }
}

async fn route_to_group(state: &Arc<NodeState>, msg: ChatMessage, group: &GroupRef) {
    // Group state lives only on the owning server; a frame for somebody
    // else's group has no business here.  An empty server id means the
    // sender assumed the local server.
    if !group.server_id.is_empty() && group.server_id != state.config.server_id {
        warn!(
            group_id = %group.group_id,
            server_id = %group.server_id,
            "message for a group owned elsewhere dropped"
        );
        return;
    }
    let members = {
        let groups = state.groups.read().await;
        match groups.get(&group.group_id) {
            Some(g) => g.member_refs(),
            None => {
                warn!(group_id = %group.group_id, "message for unknown group dropped");
                return;
            }
        }
    };

    for member in members {
        if member.user_id == msg.author.user_id {
            continue;
        }
        if let Some(session) = state.client(&member.user_id).await {
            if session.writer.send(&Packet::Message(msg.clone())).await.is_err() {
                warn!(user_id = %member.user_id, "group delivery failed, evicting client");
                state.evict_client(&member.user_id).await;
            }
            continue;
        }
        if member.server_id == state.config.server_id {
            debug!(user_id = %member.user_id, "group member offline, skipped");
            continue;
        }
        if let Some(peer) = state.peer(&member.server_id).await {
            // The group does not exist on the member's home server, so the
            // copy is readdressed to the member before it leaves this node.
            let readdressed = ChatMessage {
                recipient: Recipient::User(member.clone()),
                ..msg.clone()
            };
            if peer.writer.send(&Packet::Message(readdressed)).await.is_err() {
                warn!(server_id = %member.server_id, "group forward failed, evicting peer");
                state.evict_peer(&member.server_id).await;
            }
        } else {
            debug!(
                user_id = %member.user_id,
                server_id = %member.server_id,
                "group member's home server not connected, skipped"
            );
        }
    }
}

/// Route a `MESSAGE_ACK` one hop back toward the message source.  An
/// unknown snowflake is dropped silently (best-effort semantics).
pub async fn handle_ack(state: &Arc<NodeState>, ack: MessageAck) {
    let Some(route) = state.take_pending_ack(ack.snowflake) else {
        debug!(snowflake = ack.snowflake, "ack for unknown snowflake dropped");
        return;
    };

    if let Some(session) = state.client(&route.source.user_id).await {
        if session.writer.send(&Packet::MessageAck(ack)).await.is_err() {
            warn!(user_id = %route.source.user_id, "ack delivery failed, evicting client");
            state.evict_client(&route.source.user_id).await;
        }
        return;
    }

    if let Some(peer) = state.peer(&route.source.server_id).await {
        if peer.writer.send(&Packet::MessageAck(ack)).await.is_err() {
            warn!(server_id = %route.source.server_id, "ack forward failed, evicting peer");
            state.evict_peer(&route.source.server_id).await;
        }
        return;
    }

    warn!(
        user_id = %route.source.user_id,
        server_id = %route.source.server_id,
        "no route back to message source, ack dropped"
    );
}

/// Periodically evict pending-ack entries that were never consumed.
pub async fn run_ack_sweeper(state: Arc<NodeState>, mut shutdown: watch::Receiver<bool>) {
    let ttl = ack_ttl(&state);
    let mut interval = tokio::time::interval(state.config.heartbeat.interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let evicted = state.evict_expired_acks(ttl);
                if evicted > 0 {
                    debug!(evicted, "expired pending acks evicted");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Pending-ack lifetime: long enough to span a dead-peer detection cycle.
fn ack_ttl(state: &NodeState) -> Duration {
    state.config.heartbeat.timeout * 2
}
