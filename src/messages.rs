use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::history::ChatRecord;
use crate::room::{Role, Room};

/// Inbound frame: an event plus an optional correlation id. Replies that
/// answer a tagged request echo the tag, standing in for the original
/// protocol's per-event acknowledgment callbacks.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub tag: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    Login {
        username: String,
        #[serde(default)]
        colour: Option<String>,
    },
    Logout {
        username: String,
    },
    RequestUserList,
    CreateRoom {
        username: String,
    },
    Invite {
        room_id: String,
        target_user: String,
        by_user: String,
    },
    JoinRoom {
        room_id: String,
        username: String,
    },
    RequestJoin {
        username: String,
        room_id: String,
    },
    LetUserJoin {
        room_id: String,
        username: String,
        by_host: String,
    },
    LeaveRoom {
        username: String,
        room_id: String,
    },
    RenameRoom {
        room_id: String,
        new_name: String,
        by_user: String,
    },
    CloseRoom {
        room_id: String,
        by_user: String,
    },
    /// Lobby chat when `room_id` is absent, room chat otherwise.
    ChatMessage {
        username: String,
        #[serde(default)]
        colour: Option<String>,
        #[serde(default)]
        room_id: Option<String>,
        body: String,
    },
    Whisper {
        from_user: String,
        to_user: String,
        body: String,
    },
    RequestChatHistory {
        room_id: String,
    },
    GetRoomUsers {
        room_id: String,
    },
    GetRoomData {
        room_id: String,
    },
    GetRoomList,
    StartGame {
        room_id: String,
        by_user: String,
    },
    EndGame {
        room_id: String,
        by_user: String,
    },
    KickUser {
        room_id: String,
        target_user: String,
        by_user: String,
    },
    SetGuestInvite {
        room_id: String,
        enabled: bool,
        by_user: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ConnectionStatus {
        username: String,
        message: String,
    },
    /// Generic success/failure reply carrying a human-readable message.
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<u64>,
        ok: bool,
        message: String,
    },
    UserList {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<u64>,
        users: BTreeMap<String, bool>,
    },
    RoomCreated {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<u64>,
        room_id: String,
        room: Room,
    },
    /// Delivered to the invited user's connection only.
    Invitation {
        room_id: String,
        room_name: String,
        invited_user: String,
        by_user: String,
    },
    /// Actionable prompt on the Host's connection.
    JoinRequested {
        room_id: String,
        username: String,
    },
    JoinResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<u64>,
        room_exists: bool,
        invitation: bool,
        message: String,
    },
    /// Room-scoped notice text, terminal markup included.
    GameMessage {
        room_id: String,
        body: String,
    },
    ChatMessage {
        #[serde(skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        colour: Option<String>,
        body: String,
        timestamp_ms: i64,
    },
    Whisper {
        from_user: String,
        body: String,
    },
    ChatHistory {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<u64>,
        room_id: String,
        messages: Vec<ChatRecord>,
    },
    RoomUsers {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<u64>,
        room_id: String,
        users: BTreeMap<String, Role>,
    },
    RoomData {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<u64>,
        room: Room,
    },
    RoomList {
        #[serde(skip_serializing_if = "Option::is_none")]
        tag: Option<u64>,
        rooms: BTreeMap<String, Room>,
    },
    /// Pushed to members so clients refresh their header.
    RoomRenamed {
        room_id: String,
        name: String,
    },
    /// Eviction/redirect notice: the room is gone or the member was removed.
    RoomClosed {
        room_id: String,
        message: String,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_create_room_decodes() {
        let frame = r#"{"event":"createRoom","tag":7,"username":"sjur"}"#;
        let envelope: ClientEnvelope = serde_json::from_str(frame).unwrap();
        assert_eq!(envelope.tag, Some(7));
        assert!(matches!(
            envelope.event,
            ClientEvent::CreateRoom { username } if username == "sjur"
        ));
    }

    #[test]
    fn chat_message_without_room_targets_lobby() {
        let frame = r#"{"event":"chatMessage","username":"sjur","body":"hi"}"#;
        let envelope: ClientEnvelope = serde_json::from_str(frame).unwrap();
        assert!(envelope.tag.is_none());
        match envelope.event {
            ClientEvent::ChatMessage {
                room_id, colour, ..
            } => {
                assert!(room_id.is_none());
                assert!(colour.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let frame = r#"{"event":"fireMissiles"}"#;
        assert!(serde_json::from_str::<ClientEnvelope>(frame).is_err());
    }

    #[test]
    fn server_events_use_camel_case_wire_names() {
        let reply = ServerEvent::JoinResult {
            tag: Some(3),
            room_exists: true,
            invitation: false,
            message: "Waiting for the host.".to_string(),
        };
        let value: serde_json::Value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["event"], "joinResult");
        assert_eq!(value["roomExists"], true);
        assert_eq!(value["invitation"], false);
        assert_eq!(value["tag"], 3);
    }

    #[test]
    fn untagged_ack_omits_tag_field() {
        let ack = ServerEvent::Ack {
            tag: None,
            ok: true,
            message: "done".to_string(),
        };
        let value: serde_json::Value = serde_json::to_value(&ack).unwrap();
        assert!(value.get("tag").is_none());
    }
}
