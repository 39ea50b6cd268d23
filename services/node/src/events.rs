use cm_protocol::{GroupRef, UserRef};
use tokio::sync::broadcast;

/// Capacity of the observer channel.  Slow observers miss events rather
/// than back-pressuring the node.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Observable node happenings: session lifecycle, peer lifecycle, and
/// group membership changes.  Log output goes through `tracing`, not here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    ClientConnected { user: UserRef },
    ClientDisconnected { user: UserRef },
    PeerConnected { server_id: String },
    PeerDisconnected { server_id: String },
    MembershipChanged {
        group: GroupRef,
        members: Vec<UserRef>,
    },
    ReminderFired { target: String },
}

pub fn event_channel() -> broadcast::Sender<NodeEvent> {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}
