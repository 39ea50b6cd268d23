//! The dispatcher shared by client and peer read loops.
//!
//! Both loops hand every received frame here; a frame is decoded exactly
//! once and fanned out by purpose.  The handful of rules that differ by
//! who sent the frame (reminder authority, search pending-state) branch on
//! [`Origin`] rather than living in duplicated per-loop handlers.

use crate::reminder::ReminderTarget;
use crate::state::NodeState;
use crate::translate::translate_or_original;
use crate::wire::FrameWriter;
use crate::{groups, routing, search};
use cm_protocol::{DecodeError, Frame, Packet, TranslationRequest, UserRef};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Who produced the frame being dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A local client session, identified by its connect-time claim.
    Client(UserRef),
    /// A peer server, identified by its server id.
    Peer(String),
}

impl Origin {
    fn client_user(&self) -> Option<&UserRef> {
        match self {
            Origin::Client(user) => Some(user),
            Origin::Peer(_) => None,
        }
    }
}

pub async fn dispatch_frame(
    state: &Arc<NodeState>,
    origin: &Origin,
    writer: &FrameWriter,
    frame: &Frame,
) {
    let packet = match Packet::decode(frame) {
        Ok(packet) => packet,
        Err(DecodeError::UnknownPurpose(purpose)) => {
            warn!(purpose = %purpose, ?origin, "unknown purpose ignored");
            return;
        }
        Err(e) => {
            warn!(error = %e, ?origin, "undecodable payload dropped");
            return;
        }
    };

    match packet {
        Packet::Ping => {
            if writer.send(&Packet::Pong).await.is_err() {
                evict_origin(state, origin).await;
            }
        }
        Packet::Pong => {
            // Liveness bookkeeping happened when the frame arrived.
        }

        Packet::Message(msg) => routing::handle_message(state, msg).await,
        Packet::MessageAck(ack) => routing::handle_ack(state, ack).await,

        Packet::ModifyGroup(modify) => {
            groups::handle_modify_group(state, origin.client_user(), writer, modify).await;
        }
        Packet::InviteGroup(invite) => {
            groups::handle_invite(state, origin.client_user(), invite).await;
        }
        Packet::QueryGroupMembers(query) => {
            groups::handle_query_members(state, writer, query).await;
        }
        Packet::JoinGroup(join) => groups::handle_join(state, join).await,
        Packet::LeaveGroup(leave) => groups::handle_leave(state, leave).await,

        Packet::SearchUsers(s) => match origin {
            Origin::Client(user) => search::handle_search_from_client(state, user, s).await,
            Origin::Peer(_) => search::handle_search_from_peer(state, writer, s).await,
        },
        Packet::SearchUsersResp(resp) => search::handle_search_resp(state, resp).await,

        Packet::SetReminder(set) => handle_set_reminder(state, origin, set).await,
        Packet::Reminder(reminder) => match origin {
            // Only the scheduling server forwards reminders; a client has
            // no business injecting them.
            Origin::Peer(_) => deliver_forwarded_reminder(state, reminder).await,
            Origin::Client(user) => {
                warn!(user_id = %user.user_id, "reminder frame from a client ignored");
            }
        },

        Packet::Translate(req) => {
            let translated = translate_or_original(
                state.translator.as_ref(),
                &req.original_text,
                req.target_lang,
            );
            let reply = Packet::Translated(TranslationRequest {
                target_lang: req.target_lang,
                original_text: req.original_text,
                translated_text: translated,
            });
            if writer.send(&reply).await.is_err() {
                evict_origin(state, origin).await;
            }
        }

        // Frames this node only ever sends, or that belong to other
        // transports (UDP discovery, handshakes), are ignored mid-stream.
        Packet::DiscoverServer
        | Packet::ServerAnnounce(_)
        | Packet::ConnectClient(_)
        | Packet::ConnectServer(_)
        | Packet::Connected(_)
        | Packet::ModifyGroupResp(_)
        | Packet::NotifyGroupInvite(_)
        | Packet::GroupMembers(_)
        | Packet::Translated(_) => {
            debug!(purpose = %frame.purpose, ?origin, "out-of-place frame ignored");
        }
    }
}

/// `SET_REMINDER` is only honoured from a client, and only for itself.
async fn handle_set_reminder(
    state: &Arc<NodeState>,
    origin: &Origin,
    set: cm_protocol::SetReminder,
) {
    let Origin::Client(session_user) = origin else {
        warn!("set-reminder over a peer link ignored");
        return;
    };
    if set.user.user_id != session_user.user_id {
        warn!(
            session_user = %session_user.user_id,
            target_user = %set.user.user_id,
            "reminder for another user rejected"
        );
        return;
    }

    let target = ReminderTarget::for_user(&set.user, &state.config.server_id);
    debug!(
        target = %target.encode(),
        event = %set.event,
        countdown_seconds = set.countdown_seconds,
        "reminder scheduled"
    );
    state.reminders.schedule(
        target,
        set.event,
        Duration::from_secs(set.countdown_seconds),
    );
}

/// A `REMINDER` frame from the scheduling server: this node is the target's
/// home server, so deliver to the local session or drop.
async fn deliver_forwarded_reminder(state: &Arc<NodeState>, reminder: cm_protocol::Reminder) {
    let user_id = reminder.user.user_id.clone();
    let Some(session) = state.client(&user_id).await else {
        debug!(user_id = %user_id, "forwarded reminder target offline, dropped");
        return;
    };
    if session
        .writer
        .send(&Packet::Reminder(reminder))
        .await
        .is_err()
    {
        warn!(user_id = %user_id, "forwarded reminder delivery failed, evicting client");
        state.evict_client(&user_id).await;
    }
}

async fn evict_origin(state: &Arc<NodeState>, origin: &Origin) {
    match origin {
        Origin::Client(user) => {
            warn!(user_id = %user.user_id, "write failed, evicting client");
            state.evict_client(&user.user_id).await;
        }
        Origin::Peer(server_id) => {
            warn!(server_id = %server_id, "write failed, evicting peer");
            state.evict_peer(server_id).await;
        }
    }
}
