// cm-protocol: chat federation wire protocol — frame codec and typed
// message schema.
//
// Every message travels as a `PURPOSE LENGTH payload` frame (see [`frame`]);
// the purpose token selects the payload type.  Payloads are JSON with stable
// field names, so independently built nodes interoperate as long as they
// agree on this crate's schema.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod frame;

pub use frame::{Frame, FrameError, FrameParser, decode_datagram};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// A user within the federation.  `user_id` is unique only within its home
/// server; the pair is globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: String,
    pub server_id: String,
}

impl UserRef {
    pub fn new(user_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        UserRef {
            user_id: user_id.into(),
            server_id: server_id.into(),
        }
    }
}

/// A group within the federation.  `server_id` names the owning server; the
/// group's state lives only there.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupRef {
    pub group_id: String,
    pub server_id: String,
}

impl GroupRef {
    pub fn new(group_id: impl Into<String>, server_id: impl Into<String>) -> Self {
        GroupRef {
            group_id: group_id.into(),
            server_id: server_id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery and handshakes
// ---------------------------------------------------------------------------

/// One advertised service: a feature name plus the TCP port that serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub port: u16,
}

/// Feature names every node advertises.
pub mod features {
    pub const MESSAGES: &str = "MESSAGES";
    pub const TRANSLATION: &str = "TRANSLATION";
    pub const REMINDER: &str = "REMINDER";
}

/// Broadcast/unicast announcement of a server's identity and services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAnnounce {
    pub server_id: String,
    pub features: Vec<Feature>,
}

/// First frame of a client connection: the identity claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectClient {
    pub user: UserRef,
}

/// First frame of a server-to-server connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectServer {
    pub server_id: String,
    pub features: Vec<String>,
}

/// Result code carried by `CONNECTED`.
///
/// `IsAlreadyConnected` rejects a duplicate client identity;
/// `AlreadyConnected` rejects a duplicate peer session (mutual-dial tie
/// break).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectResult {
    Connected,
    IsAlreadyConnected,
    AlreadyConnected,
}

/// Reply to either connect handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    pub result: ConnectResult,
}

// ---------------------------------------------------------------------------
// Chat messages
// ---------------------------------------------------------------------------

/// Supported translation target languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Language {
    De,
    En,
    Zh,
    Tr,
}

/// Translation content: the server fills `translated_text` in transit when
/// it is empty and `original_text` is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub target_lang: Language,
    pub original_text: String,
    #[serde(default)]
    pub translated_text: String,
}

/// Message body: plain text or a translation exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Translation(Translation),
}

/// Message destination: a single user or a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    User(UserRef),
    Group(GroupRef),
}

/// A routed chat message.  The snowflake is chosen by the sender and is
/// opaque to servers; it only correlates the eventual `MESSAGE_ACK`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub snowflake: u64,
    pub author: UserRef,
    pub recipient: Recipient,
    pub content: Content,
}

/// Per-recipient delivery status inside a `MESSAGE_ACK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEntry {
    pub user: UserRef,
    pub status: AckStatus,
}

/// Delivery acknowledgement, routed back to the message source by snowflake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub snowflake: u64,
    pub statuses: Vec<AckEntry>,
}

// ---------------------------------------------------------------------------
// User search
// ---------------------------------------------------------------------------

/// Federated user search.  `handle` is requester-chosen and correlates the
/// one-or-more `SEARCH_USERS_RESP` replies (one per answering server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchUsers {
    pub query: String,
    pub handle: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchUsersResp {
    pub handle: u64,
    pub users: Vec<UserRef>,
}

// ---------------------------------------------------------------------------
// Group operations
// ---------------------------------------------------------------------------

/// Result code shared by the group replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupOpResult {
    Success,
    NotFound,
    UnknownError,
}

/// Create, update, or delete a group.
///
/// Create-or-update semantics: a new group starts with `members := admins`;
/// an existing group gets `display_name` and `admins` overwritten while the
/// member set is retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyGroup {
    pub handle: u64,
    pub group_id: String,
    pub display_name: String,
    #[serde(default)]
    pub delete_group: bool,
    pub admins: Vec<UserRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyGroupResp {
    pub handle: u64,
    pub result: GroupOpResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteGroup {
    pub handle: u64,
    pub group_id: String,
    pub invitee: UserRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyGroupInvite {
    pub handle: u64,
    pub group: GroupRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinGroup {
    pub group: GroupRef,
    pub user: UserRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveGroup {
    pub group: GroupRef,
    pub user: UserRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryGroupMembers {
    pub group: GroupRef,
}

/// Membership snapshot; pushed to every local member after a change and
/// sent in reply to `QUERY_GROUP_MEMBERS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembers {
    pub group: GroupRef,
    pub result: GroupOpResult,
    pub users: Vec<UserRef>,
}

// ---------------------------------------------------------------------------
// Reminders
// ---------------------------------------------------------------------------

/// Schedule a reminder.  A session may only target its own user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReminder {
    pub user: UserRef,
    pub event: String,
    pub countdown_seconds: u64,
}

/// A fired reminder, delivered to the target user (possibly via their home
/// server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub user: UserRef,
    pub content: String,
}

// ---------------------------------------------------------------------------
// Translation service
// ---------------------------------------------------------------------------

/// Payload of both `TRANSLATE` and `TRANSLATED`; the reply carries the same
/// fields with `translated_text` filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub target_lang: Language,
    pub original_text: String,
    #[serde(default)]
    pub translated_text: String,
}

// ---------------------------------------------------------------------------
// Purpose tokens
// ---------------------------------------------------------------------------

/// The closed set of purpose tokens on the wire.
pub mod purposes {
    pub const DISCOVER_SERVER: &str = "DISCOVER_SERVER";
    pub const SERVER_ANNOUNCE: &str = "SERVER_ANNOUNCE";
    pub const CONNECT_CLIENT: &str = "CONNECT_CLIENT";
    pub const CONNECT_SERVER: &str = "CONNECT_SERVER";
    pub const CONNECTED: &str = "CONNECTED";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
    pub const MESSAGE: &str = "MESSAGE";
    pub const MESSAGE_ACK: &str = "MESSAGE_ACK";
    pub const SEARCH_USERS: &str = "SEARCH_USERS";
    pub const SEARCH_USERS_RESP: &str = "SEARCH_USERS_RESP";
    pub const MODIFY_GROUP: &str = "MODIFY_GROUP";
    pub const MODIFY_GROUP_RESP: &str = "MODIFY_GROUP_RESP";
    pub const INVITE_GROUP: &str = "INVITE_GROUP";
    pub const NOTIFY_GROUP_INVITE: &str = "NOTIFY_GROUP_INVITE";
    pub const JOIN_GROUP: &str = "JOIN_GROUP";
    pub const LEAVE_GROUP: &str = "LEAVE_GROUP";
    pub const QUERY_GROUP_MEMBERS: &str = "QUERY_GROUP_MEMBERS";
    pub const GROUP_MEMBERS: &str = "GROUP_MEMBERS";
    pub const SET_REMINDER: &str = "SET_REMINDER";
    pub const REMINDER: &str = "REMINDER";
    pub const TRANSLATE: &str = "TRANSLATE";
    pub const TRANSLATED: &str = "TRANSLATED";
}

// ---------------------------------------------------------------------------
// Packet: purpose-discriminated union
// ---------------------------------------------------------------------------

/// Errors turning a [`Frame`] into a [`Packet`] or back.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown purpose {0:?}")]
    UnknownPurpose(String),
    #[error("invalid {purpose} payload: {source}")]
    Payload {
        purpose: &'static str,
        source: serde_json::Error,
    },
}

/// Every message of the protocol as a typed value.  The frame's purpose
/// token is the discriminant; decode once at the frame boundary and
/// dispatch on the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    DiscoverServer,
    ServerAnnounce(ServerAnnounce),
    ConnectClient(ConnectClient),
    ConnectServer(ConnectServer),
    Connected(Connected),
    Ping,
    Pong,
    Message(ChatMessage),
    MessageAck(MessageAck),
    SearchUsers(SearchUsers),
    SearchUsersResp(SearchUsersResp),
    ModifyGroup(ModifyGroup),
    ModifyGroupResp(ModifyGroupResp),
    InviteGroup(InviteGroup),
    NotifyGroupInvite(NotifyGroupInvite),
    JoinGroup(JoinGroup),
    LeaveGroup(LeaveGroup),
    QueryGroupMembers(QueryGroupMembers),
    GroupMembers(GroupMembers),
    SetReminder(SetReminder),
    Reminder(Reminder),
    Translate(TranslationRequest),
    Translated(TranslationRequest),
}

impl Packet {
    /// The wire purpose token for this packet.
    pub fn purpose(&self) -> &'static str {
        use purposes as p;
        match self {
            Packet::DiscoverServer => p::DISCOVER_SERVER,
            Packet::ServerAnnounce(_) => p::SERVER_ANNOUNCE,
            Packet::ConnectClient(_) => p::CONNECT_CLIENT,
            Packet::ConnectServer(_) => p::CONNECT_SERVER,
            Packet::Connected(_) => p::CONNECTED,
            Packet::Ping => p::PING,
            Packet::Pong => p::PONG,
            Packet::Message(_) => p::MESSAGE,
            Packet::MessageAck(_) => p::MESSAGE_ACK,
            Packet::SearchUsers(_) => p::SEARCH_USERS,
            Packet::SearchUsersResp(_) => p::SEARCH_USERS_RESP,
            Packet::ModifyGroup(_) => p::MODIFY_GROUP,
            Packet::ModifyGroupResp(_) => p::MODIFY_GROUP_RESP,
            Packet::InviteGroup(_) => p::INVITE_GROUP,
            Packet::NotifyGroupInvite(_) => p::NOTIFY_GROUP_INVITE,
            Packet::JoinGroup(_) => p::JOIN_GROUP,
            Packet::LeaveGroup(_) => p::LEAVE_GROUP,
            Packet::QueryGroupMembers(_) => p::QUERY_GROUP_MEMBERS,
            Packet::GroupMembers(_) => p::GROUP_MEMBERS,
            Packet::SetReminder(_) => p::SET_REMINDER,
            Packet::Reminder(_) => p::REMINDER,
            Packet::Translate(_) => p::TRANSLATE,
            Packet::Translated(_) => p::TRANSLATED,
        }
    }

    /// Serialize into a frame ready for the wire.
    ///
    /// Serialization of these types cannot fail: every payload is a plain
    /// struct of strings, integers, and unit enums.
    pub fn to_frame(&self) -> Frame {
        fn body<T: Serialize>(value: &T) -> Vec<u8> {
            serde_json::to_vec(value).unwrap_or_default()
        }
        let payload = match self {
            Packet::DiscoverServer | Packet::Ping | Packet::Pong => Vec::new(),
            Packet::ServerAnnounce(v) => body(v),
            Packet::ConnectClient(v) => body(v),
            Packet::ConnectServer(v) => body(v),
            Packet::Connected(v) => body(v),
            Packet::Message(v) => body(v),
            Packet::MessageAck(v) => body(v),
            Packet::SearchUsers(v) => body(v),
            Packet::SearchUsersResp(v) => body(v),
            Packet::ModifyGroup(v) => body(v),
            Packet::ModifyGroupResp(v) => body(v),
            Packet::InviteGroup(v) => body(v),
            Packet::NotifyGroupInvite(v) => body(v),
            Packet::JoinGroup(v) => body(v),
            Packet::LeaveGroup(v) => body(v),
            Packet::QueryGroupMembers(v) => body(v),
            Packet::GroupMembers(v) => body(v),
            Packet::SetReminder(v) => body(v),
            Packet::Reminder(v) => body(v),
            Packet::Translate(v) => body(v),
            Packet::Translated(v) => body(v),
        };
        Frame::new(self.purpose(), payload)
    }

    /// Encode straight to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        self.to_frame().encode()
    }

    /// Decode a frame into a typed packet.
    ///
    /// Purposes outside the closed set yield [`DecodeError::UnknownPurpose`];
    /// callers log and ignore those per the protocol contract.
    pub fn decode(frame: &Frame) -> Result<Packet, DecodeError> {
        fn parse<T: for<'de> Deserialize<'de>>(
            purpose: &'static str,
            payload: &[u8],
        ) -> Result<T, DecodeError> {
            serde_json::from_slice(payload).map_err(|source| DecodeError::Payload { purpose, source })
        }

        use purposes as p;
        let payload = frame.payload.as_slice();
        let packet = match frame.purpose.as_str() {
            p::DISCOVER_SERVER => Packet::DiscoverServer,
            p::PING => Packet::Ping,
            p::PONG => Packet::Pong,
            p::SERVER_ANNOUNCE => Packet::ServerAnnounce(parse(p::SERVER_ANNOUNCE, payload)?),
            p::CONNECT_CLIENT => Packet::ConnectClient(parse(p::CONNECT_CLIENT, payload)?),
            p::CONNECT_SERVER => Packet::ConnectServer(parse(p::CONNECT_SERVER, payload)?),
            p::CONNECTED => Packet::Connected(parse(p::CONNECTED, payload)?),
            p::MESSAGE => Packet::Message(parse(p::MESSAGE, payload)?),
            p::MESSAGE_ACK => Packet::MessageAck(parse(p::MESSAGE_ACK, payload)?),
            p::SEARCH_USERS => Packet::SearchUsers(parse(p::SEARCH_USERS, payload)?),
            p::SEARCH_USERS_RESP => {
                Packet::SearchUsersResp(parse(p::SEARCH_USERS_RESP, payload)?)
            }
            p::MODIFY_GROUP => Packet::ModifyGroup(parse(p::MODIFY_GROUP, payload)?),
            p::MODIFY_GROUP_RESP => {
                Packet::ModifyGroupResp(parse(p::MODIFY_GROUP_RESP, payload)?)
            }
            p::INVITE_GROUP => Packet::InviteGroup(parse(p::INVITE_GROUP, payload)?),
            p::NOTIFY_GROUP_INVITE => {
                Packet::NotifyGroupInvite(parse(p::NOTIFY_GROUP_INVITE, payload)?)
            }
            p::JOIN_GROUP => Packet::JoinGroup(parse(p::JOIN_GROUP, payload)?),
            p::LEAVE_GROUP => Packet::LeaveGroup(parse(p::LEAVE_GROUP, payload)?),
            p::QUERY_GROUP_MEMBERS => {
                Packet::QueryGroupMembers(parse(p::QUERY_GROUP_MEMBERS, payload)?)
            }
            p::GROUP_MEMBERS => Packet::GroupMembers(parse(p::GROUP_MEMBERS, payload)?),
            p::SET_REMINDER => Packet::SetReminder(parse(p::SET_REMINDER, payload)?),
            p::REMINDER => Packet::Reminder(parse(p::REMINDER, payload)?),
            p::TRANSLATE => Packet::Translate(parse(p::TRANSLATE, payload)?),
            p::TRANSLATED => Packet::Translated(parse(p::TRANSLATED, payload)?),
            other => return Err(DecodeError::UnknownPurpose(other.to_owned())),
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let frame = packet.to_frame();
        let mut parser = FrameParser::new();
        parser.feed(&frame.encode());
        let reframed = parser.next_frame().expect("parse").expect("one frame");
        assert_eq!(reframed, frame);
        assert_eq!(Packet::decode(&reframed).expect("decode"), packet);
    }

    #[test]
    fn empty_payload_packets_roundtrip() {
        roundtrip(Packet::DiscoverServer);
        roundtrip(Packet::Ping);
        roundtrip(Packet::Pong);
    }

    #[test]
    fn handshake_packets_roundtrip() {
        roundtrip(Packet::ServerAnnounce(ServerAnnounce {
            server_id: "S1".to_owned(),
            features: vec![
                Feature {
                    name: features::MESSAGES.to_owned(),
                    port: 9998,
                },
                Feature {
                    name: features::REMINDER.to_owned(),
                    port: 9998,
                },
            ],
        }));
        roundtrip(Packet::ConnectClient(ConnectClient {
            user: UserRef::new("alice", "S1"),
        }));
        roundtrip(Packet::ConnectServer(ConnectServer {
            server_id: "S2".to_owned(),
            features: vec![features::MESSAGES.to_owned()],
        }));
        roundtrip(Packet::Connected(Connected {
            result: ConnectResult::IsAlreadyConnected,
        }));
    }

    #[test]
    fn chat_message_variants_roundtrip() {
        roundtrip(Packet::Message(ChatMessage {
            snowflake: 7,
            author: UserRef::new("a", "S1"),
            recipient: Recipient::User(UserRef::new("b", "S2")),
            content: Content::Text("hey".to_owned()),
        }));
        roundtrip(Packet::Message(ChatMessage {
            snowflake: 8,
            author: UserRef::new("a", "S1"),
            recipient: Recipient::Group(GroupRef::new("g1", "S1")),
            content: Content::Translation(Translation {
                target_lang: Language::De,
                original_text: "hello".to_owned(),
                translated_text: String::new(),
            }),
        }));
        roundtrip(Packet::MessageAck(MessageAck {
            snowflake: 7,
            statuses: vec![AckEntry {
                user: UserRef::new("b", "S2"),
                status: AckStatus::Delivered,
            }],
        }));
    }

    #[test]
    fn group_and_search_packets_roundtrip() {
        roundtrip(Packet::ModifyGroup(ModifyGroup {
            handle: 11,
            group_id: "g1".to_owned(),
            display_name: "Group One".to_owned(),
            delete_group: false,
            admins: vec![UserRef::new("a", "S1")],
        }));
        roundtrip(Packet::GroupMembers(GroupMembers {
            group: GroupRef::new("g1", "S1"),
            result: GroupOpResult::Success,
            users: vec![UserRef::new("a", "S1"), UserRef::new("b", "S1")],
        }));
        roundtrip(Packet::SearchUsers(SearchUsers {
            query: "al".to_owned(),
            handle: 42,
        }));
        roundtrip(Packet::SearchUsersResp(SearchUsersResp {
            handle: 42,
            users: vec![UserRef::new("alice", "S1")],
        }));
    }

    #[test]
    fn reminder_and_translate_packets_roundtrip() {
        roundtrip(Packet::SetReminder(SetReminder {
            user: UserRef::new("a", "S1"),
            event: "lunch".to_owned(),
            countdown_seconds: 2,
        }));
        roundtrip(Packet::Reminder(Reminder {
            user: UserRef::new("a", "S1"),
            content: "lunch".to_owned(),
        }));
        roundtrip(Packet::Translate(TranslationRequest {
            target_lang: Language::Zh,
            original_text: "good morning".to_owned(),
            translated_text: String::new(),
        }));
    }

    #[test]
    fn recipient_and_content_use_external_tags() {
        let message = ChatMessage {
            snowflake: 1,
            author: UserRef::new("a", "S1"),
            recipient: Recipient::User(UserRef::new("b", "S1")),
            content: Content::Text("hi".to_owned()),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&Packet::Message(message).to_frame().payload).expect("json");
        assert!(json["recipient"]["user"].is_object());
        assert_eq!(json["content"]["text"], "hi");
    }

    #[test]
    fn language_codes_serialize_uppercase() {
        let json = serde_json::to_string(&Language::De).expect("serialize");
        assert_eq!(json, "\"DE\"");
        let back: Language = serde_json::from_str("\"TR\"").expect("deserialize");
        assert_eq!(back, Language::Tr);
    }

    #[test]
    fn translated_text_field_defaults_to_empty() {
        let json = r#"{"target_lang":"EN","original_text":"hallo"}"#;
        let req: TranslationRequest = serde_json::from_str(json).expect("deserialize");
        assert_eq!(req.translated_text, "");
    }

    #[test]
    fn unknown_purpose_is_reported_not_panicked() {
        let frame = Frame::new("FUTURE_THING", b"{}".to_vec());
        assert!(matches!(
            Packet::decode(&frame),
            Err(DecodeError::UnknownPurpose(p)) if p == "FUTURE_THING"
        ));
    }

    #[test]
    fn bad_payload_reports_its_purpose() {
        let frame = Frame::new(purposes::MESSAGE, b"not json".to_vec());
        match Packet::decode(&frame) {
            Err(DecodeError::Payload { purpose, .. }) => {
                assert_eq!(purpose, purposes::MESSAGE);
            }
            other => panic!("expected payload error, got {other:?}"),
        }
    }
}
