use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Attachment, GroupId, MessageView, UserId};

/// Frames a client sends over its live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Bind the connection to a user and enter their personal room.
    #[serde(rename_all = "camelCase")]
    Join { user_id: UserId },

    /// Enter a group room.
    #[serde(rename_all = "camelCase")]
    JoinGroup { group_id: GroupId },

    /// Direct message from the joined user.
    #[serde(rename_all = "camelCase")]
    Message {
        receiver_id: UserId,
        #[serde(default)]
        body: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },

    /// Group message from the joined user.
    #[serde(rename_all = "camelCase")]
    GroupMessage {
        group_id: GroupId,
        #[serde(default)]
        body: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
}

/// Frames pushed from the server to a live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ServerFrame {
    Joined {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    GroupJoined {
        #[serde(rename = "groupId")]
        group_id: GroupId,
    },
    Message(MessageView),
    GroupMessage(MessageView),
    Sent(SendReceipt),
    Error {
        message: String,
    },
}

/// Acknowledgement of a durably stored send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Delivery announcement carried on the broadcast bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    /// Instance id of the publishing process.
    pub origin: String,
    pub event: BusEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BusEvent {
    /// One direct message, delivered to the receiver's personal room.
    Direct { message: MessageView },
    /// One group message, delivered to the group room.
    Group { message: MessageView },
    /// Operator broadcast: one stored message per recipient.
    Broadcast { messages: Vec<MessageView> },
}

impl BusEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_wire_shape() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"joinGroup","groupId":"chem-101"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::JoinGroup { group_id } if group_id.as_str() == "chem-101"));

        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"message","receiverId":"bob","body":"hi"}"#).unwrap();
        match frame {
            ClientFrame::Message {
                receiver_id,
                body,
                attachments,
            } => {
                assert_eq!(receiver_id.as_str(), "bob");
                assert_eq!(body, "hi");
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_server_frame_wire_shape() {
        let frame = ServerFrame::Joined {
            user_id: UserId::parse("alice").unwrap(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "joined");
        assert_eq!(json["payload"]["userId"], "alice");
    }

    #[test]
    fn test_bus_envelope_json() {
        let view = MessageView {
            id: Uuid::now_v7(),
            sender_id: UserId::parse("admin1").unwrap(),
            receiver_id: Some(UserId::parse("x").unwrap()),
            group_id: None,
            content: "update".into(),
            attachments: vec![],
            is_broadcast: true,
            created_at: Utc::now(),
        };
        let envelope = BusEnvelope {
            origin: "node-a".into(),
            event: BusEvent::Broadcast {
                messages: vec![view.clone()],
            },
        };

        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"kind\":\"broadcast\""));
        let restored = BusEnvelope::from_json(&json).unwrap();
        assert_eq!(restored, envelope);
    }
}
