//! Group registry: create/update/delete, invites, membership queries, and
//! the membership-broadcast rule.
//!
//! Groups live only on the server that created them.  Member sets map
//! `user_id -> home server_id` so pushes and remote fan-out always carry a
//! full `UserRef`.  Invariants: admins are a subset of the member ids, and
//! a group whose member set empties is deleted.
//!
//! The mutation helpers are pure functions over the group map; the async
//! handlers wrap them, reply on the requesting connection, and push
//! `GROUP_MEMBERS` snapshots to local members after every change.

use crate::events::NodeEvent;
use crate::state::NodeState;
use cm_protocol::{
    GroupMembers, GroupOpResult, GroupRef, InviteGroup, JoinGroup, LeaveGroup, ModifyGroup,
    ModifyGroupResp, NotifyGroupInvite, Packet, QueryGroupMembers, UserRef,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Group record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    pub display_name: String,
    pub admins: BTreeSet<String>,
    /// `user_id -> home server_id`.
    pub members: BTreeMap<String, String>,
}

impl Group {
    pub fn is_admin(&self, user_id: &str) -> bool {
        self.admins.contains(user_id)
    }

    pub fn member_refs(&self) -> Vec<UserRef> {
        self.members
            .iter()
            .map(|(user_id, server_id)| UserRef::new(user_id.clone(), server_id.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Pure mutations
// ---------------------------------------------------------------------------

/// Outcome of a mutation: the reply code and whether membership changed
/// (which obliges a `GROUP_MEMBERS` push).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MutationOutcome {
    pub result: GroupOpResult,
    pub membership_changed: bool,
}

/// Apply `MODIFY_GROUP`.  `requester` is the authenticated client user id;
/// `None` means the request arrived over a peer link and authority is the
/// remote server's concern.
pub(crate) fn apply_modify(
    groups: &mut HashMap<String, Group>,
    modify: &ModifyGroup,
    requester: Option<&str>,
) -> MutationOutcome {
    if modify.delete_group {
        return match groups.get(&modify.group_id) {
            None => MutationOutcome {
                result: GroupOpResult::NotFound,
                membership_changed: false,
            },
            Some(group) => {
                if let Some(user_id) = requester {
                    if !group.is_admin(user_id) {
                        return MutationOutcome {
                            result: GroupOpResult::UnknownError,
                            membership_changed: false,
                        };
                    }
                }
                groups.remove(&modify.group_id);
                MutationOutcome {
                    result: GroupOpResult::Success,
                    membership_changed: false,
                }
            }
        };
    }

    let admin_ids: BTreeSet<String> =
        modify.admins.iter().map(|u| u.user_id.clone()).collect();

    match groups.get_mut(&modify.group_id) {
        Some(group) => {
            if let Some(user_id) = requester {
                if !group.is_admin(user_id) {
                    return MutationOutcome {
                        result: GroupOpResult::UnknownError,
                        membership_changed: false,
                    };
                }
            }
            group.display_name = modify.display_name.clone();
            group.admins = admin_ids;
            // Members retain their values, but every admin must be a member.
            let mut membership_changed = false;
            for admin in &modify.admins {
                if !group.members.contains_key(&admin.user_id) {
                    group
                        .members
                        .insert(admin.user_id.clone(), admin.server_id.clone());
                    membership_changed = true;
                }
            }
            MutationOutcome {
                result: GroupOpResult::Success,
                membership_changed,
            }
        }
        None => {
            let members: BTreeMap<String, String> = modify
                .admins
                .iter()
                .map(|u| (u.user_id.clone(), u.server_id.clone()))
                .collect();
            groups.insert(
                modify.group_id.clone(),
                Group {
                    display_name: modify.display_name.clone(),
                    admins: admin_ids,
                    members,
                },
            );
            MutationOutcome {
                result: GroupOpResult::Success,
                membership_changed: true,
            }
        }
    }
}

/// Apply `JOIN_GROUP`.  Adding an existing member is a no-op.
pub(crate) fn apply_join(groups: &mut HashMap<String, Group>, join: &JoinGroup) -> MutationOutcome {
    match groups.get_mut(&join.group.group_id) {
        None => MutationOutcome {
            result: GroupOpResult::NotFound,
            membership_changed: false,
        },
        Some(group) => {
            let inserted = group
                .members
                .insert(join.user.user_id.clone(), join.user.server_id.clone())
                .is_none();
            MutationOutcome {
                result: GroupOpResult::Success,
                membership_changed: inserted,
            }
        }
    }
}

/// Apply `LEAVE_GROUP`.  Removes the user from admins and members; a group
/// left empty is deleted.
pub(crate) fn apply_leave(
    groups: &mut HashMap<String, Group>,
    leave: &LeaveGroup,
) -> MutationOutcome {
    match groups.get_mut(&leave.group.group_id) {
        None => MutationOutcome {
            result: GroupOpResult::NotFound,
            membership_changed: false,
        },
        Some(group) => {
            group.admins.remove(&leave.user.user_id);
            let removed = group.members.remove(&leave.user.user_id).is_some();
            if group.members.is_empty() {
                groups.remove(&leave.group.group_id);
            }
            MutationOutcome {
                result: GroupOpResult::Success,
                membership_changed: removed,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn handle_modify_group(
    state: &Arc<NodeState>,
    requester: Option<&UserRef>,
    reply_to: &crate::wire::FrameWriter,
    modify: ModifyGroup,
) {
    let outcome = {
        let mut groups = state.groups.write().await;
        apply_modify(&mut groups, &modify, requester.map(|u| u.user_id.as_str()))
    };
    info!(
        group_id = %modify.group_id,
        delete = modify.delete_group,
        result = ?outcome.result,
        "modify group"
    );

    let resp = Packet::ModifyGroupResp(ModifyGroupResp {
        handle: modify.handle,
        result: outcome.result,
    });
    if reply_to.send(&resp).await.is_err() {
        debug!(group_id = %modify.group_id, "modify group reply failed");
    }

    if outcome.membership_changed {
        push_members(state, &modify.group_id).await;
    }
}

pub async fn handle_invite(
    state: &Arc<NodeState>,
    requester: Option<&UserRef>,
    invite: InviteGroup,
) {
    {
        let groups = state.groups.read().await;
        let Some(group) = groups.get(&invite.group_id) else {
            warn!(group_id = %invite.group_id, "invite to unknown group dropped");
            return;
        };
        if let Some(user) = requester {
            if !group.is_admin(&user.user_id) {
                warn!(
                    group_id = %invite.group_id,
                    user_id = %user.user_id,
                    "invite by non-admin dropped"
                );
                return;
            }
        }
    }

    let Some(session) = state.client(&invite.invitee.user_id).await else {
        // No offline invite queue.
        debug!(
            group_id = %invite.group_id,
            invitee = %invite.invitee.user_id,
            "invitee offline, invite dropped"
        );
        return;
    };

    let notify = Packet::NotifyGroupInvite(NotifyGroupInvite {
        handle: invite.handle,
        group: GroupRef::new(invite.group_id.clone(), state.config.server_id.clone()),
    });
    if session.writer.send(&notify).await.is_err() {
        warn!(invitee = %invite.invitee.user_id, "invite write failed, evicting client");
        state.evict_client(&invite.invitee.user_id).await;
    }
}

pub async fn handle_query_members(
    state: &Arc<NodeState>,
    reply_to: &crate::wire::FrameWriter,
    query: QueryGroupMembers,
) {
    let reply = {
        let groups = state.groups.read().await;
        match groups.get(&query.group.group_id) {
            Some(group) => GroupMembers {
                group: GroupRef::new(
                    query.group.group_id.clone(),
                    state.config.server_id.clone(),
                ),
                result: GroupOpResult::Success,
                users: group.member_refs(),
            },
            None => GroupMembers {
                group: query.group.clone(),
                result: GroupOpResult::NotFound,
                users: Vec::new(),
            },
        }
    };
    if reply_to.send(&Packet::GroupMembers(reply)).await.is_err() {
        debug!(group_id = %query.group.group_id, "group members reply failed");
    }
}

pub async fn handle_join(state: &Arc<NodeState>, join: JoinGroup) {
    let outcome = {
        let mut groups = state.groups.write().await;
        apply_join(&mut groups, &join)
    };
    match outcome.result {
        GroupOpResult::NotFound => {
            warn!(group_id = %join.group.group_id, "join for unknown group dropped");
        }
        _ => {
            info!(
                group_id = %join.group.group_id,
                user_id = %join.user.user_id,
                "user joined group"
            );
            if outcome.membership_changed {
                push_members(state, &join.group.group_id).await;
            }
        }
    }
}

pub async fn handle_leave(state: &Arc<NodeState>, leave: LeaveGroup) {
    let outcome = {
        let mut groups = state.groups.write().await;
        apply_leave(&mut groups, &leave)
    };
    match outcome.result {
        GroupOpResult::NotFound => {
            warn!(group_id = %leave.group.group_id, "leave for unknown group dropped");
        }
        _ => {
            info!(
                group_id = %leave.group.group_id,
                user_id = %leave.user.user_id,
                "user left group"
            );
            if outcome.membership_changed {
                // push_members handles the deleted-group case by emitting an
                // empty membership snapshot to nobody.
                push_members(state, &leave.group.group_id).await;
            }
        }
    }
}

/// Push the current membership to every local member and notify observers.
pub async fn push_members(state: &Arc<NodeState>, group_id: &str) {
    let members = {
        let groups = state.groups.read().await;
        groups.get(group_id).map(Group::member_refs).unwrap_or_default()
    };

    let group_ref = GroupRef::new(group_id, state.config.server_id.clone());
    state.emit(NodeEvent::MembershipChanged {
        group: group_ref.clone(),
        members: members.clone(),
    });

    let snapshot = Packet::GroupMembers(GroupMembers {
        group: group_ref,
        result: GroupOpResult::Success,
        users: members.clone(),
    });
    for member in members {
        if let Some(session) = state.client(&member.user_id).await {
            if session.writer.send(&snapshot).await.is_err() {
                warn!(user_id = %member.user_id, "membership push failed, evicting client");
                state.evict_client(&member.user_id).await;
            }
        }
    }
}
