//! Federated user search.
//!
//! A client's search is answered twice or more: once immediately with this
//! node's matching users, then once per peer as their `SEARCH_USERS_RESP`
//! frames arrive and are correlated back through the requester's pending
//! handle.  The client unions the result sets.

use crate::state::NodeState;
use crate::wire::FrameWriter;
use cm_protocol::{Packet, SearchUsers, SearchUsersResp, UserRef};
use std::sync::Arc;
use tracing::{debug, warn};

/// A search from a local client: reply with local matches, remember the
/// handle, and fan the query out to every peer.
pub async fn handle_search_from_client(
    state: &Arc<NodeState>,
    requester: &UserRef,
    search: SearchUsers,
) {
    let Some(session) = state.client(&requester.user_id).await else {
        // Session vanished between dispatch and here.
        return;
    };

    let users = state.local_users_matching(&search.query).await;
    let local_resp = Packet::SearchUsersResp(SearchUsersResp {
        handle: search.handle,
        users,
    });
    if session.writer.send(&local_resp).await.is_err() {
        warn!(user_id = %requester.user_id, "search reply failed, evicting client");
        state.evict_client(&requester.user_id).await;
        return;
    }

    *session
        .pending_search
        .lock()
        .expect("pending_search lock poisoned") = Some(search.handle);

    let forward = Packet::SearchUsers(search);
    for peer in state.peers_snapshot().await {
        if peer.writer.send(&forward).await.is_err() {
            warn!(server_id = %peer.server_id, "search fan-out failed, evicting peer");
            state.evict_peer(&peer.server_id).await;
        }
    }
}

/// A search arriving over a peer link: answer with local matches on the
/// same link.  No pending state — the peer correlates by handle.
pub async fn handle_search_from_peer(
    state: &Arc<NodeState>,
    reply_to: &FrameWriter,
    search: SearchUsers,
) {
    let users = state.local_users_matching(&search.query).await;
    let resp = Packet::SearchUsersResp(SearchUsersResp {
        handle: search.handle,
        users,
    });
    if reply_to.send(&resp).await.is_err() {
        debug!(handle = search.handle, "peer search reply failed");
    }
}

/// A peer's answer to a search this node fanned out: forward it to the
/// client whose pending handle matches.
pub async fn handle_search_resp(state: &Arc<NodeState>, resp: SearchUsersResp) {
    let target = {
        let clients = state.clients.read().await;
        clients
            .values()
            .find(|s| {
                *s.pending_search
                    .lock()
                    .expect("pending_search lock poisoned")
                    == Some(resp.handle)
            })
            .cloned()
    };

    let Some(session) = target else {
        debug!(handle = resp.handle, "search response with no pending requester dropped");
        return;
    };

    if session
        .writer
        .send(&Packet::SearchUsersResp(resp))
        .await
        .is_err()
    {
        warn!(user_id = %session.user.user_id, "search relay failed, evicting client");
        state.evict_client(&session.user.user_id).await;
    }
}
