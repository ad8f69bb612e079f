//! The wire frame envelope: the tagged-union JSON protocol crossing every
//! chat socket. Inbound and outbound are modeled as separate enums because
//! the two directions accept/emit disjoint `type` sets.

use serde::{Deserialize, Serialize};

use crate::model::{ChatRecordView, PublicUserProfile};

/// Frames a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Message { content: String },
    JoinRoom { room_id: i64 },
    LeaveRoom,
}

/// Frames the server may emit.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message {
        room_id: i64,
        data: ChatRecordView,
    },
    UserJoined {
        room_id: i64,
        data: UserJoinedPayload,
    },
    UserLeft {
        room_id: i64,
        data: UserLeftPayload,
    },
    OnlineUsers {
        room_id: i64,
        data: OnlineUsersPayload,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct UserJoinedPayload {
    pub user: PublicUserProfile,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserLeftPayload {
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OnlineUsersPayload {
    pub users: Vec<PublicUserProfile>,
}

impl OutboundFrame {
    /// Serialize once so a single fan-out pays one JSON-encoding cost.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_message_parses() {
        let raw = r#"{"type":"message","room_id":1,"content":"hi"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        match frame {
            InboundFrame::Message { content } => assert_eq!(content, "hi"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn inbound_join_room_parses() {
        let raw = r#"{"type":"join_room","room_id":7}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        match frame {
            InboundFrame::JoinRoom { room_id } => assert_eq!(room_id, 7),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn inbound_leave_room_parses() {
        let raw = r#"{"type":"leave_room"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, InboundFrame::LeaveRoom));
    }

    #[test]
    fn inbound_invalid_type_errors() {
        let raw = r#"{"type":"bogus"}"#;
        assert!(serde_json::from_str::<InboundFrame>(raw).is_err());
    }

    #[test]
    fn outbound_user_left_serializes() {
        let frame = OutboundFrame::UserLeft {
            room_id: 1,
            data: UserLeftPayload { user_id: 42 },
        };
        let json = frame.to_json().unwrap();
        assert!(json.contains(r#""type":"user_left""#));
        assert!(json.contains(r#""user_id":42"#));
    }
}
