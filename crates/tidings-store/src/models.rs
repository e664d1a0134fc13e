//! Domain model structs persisted in the message log database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the API layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tidings_shared::{Attachment, GroupId, MessageView, Role, UserId};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A directory entry: who someone is and what they may do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub role: Role,
    pub display_name: String,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A named group conversation. The admin is always a member at creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub admin_id: UserId,
    pub members: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn has_member(&self, user: &UserId) -> bool {
        self.members.iter().any(|m| m == user)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A stored message. Immutable after append except for `is_read`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique, time-ordered message identifier.
    pub id: Uuid,
    pub sender_id: UserId,
    /// Set for direct messages; exclusive with `group_id`.
    pub receiver_id: Option<UserId>,
    /// Set for group messages; exclusive with `receiver_id`.
    pub group_id: Option<GroupId>,
    /// May be empty when attachments are present.
    pub body: String,
    pub attachments: Vec<Attachment>,
    /// Only meaningful for direct messages.
    pub is_read: bool,
    pub is_broadcast: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Read projection without mutable read state.
    pub fn view(&self) -> MessageView {
        MessageView {
            id: self.id,
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            group_id: self.group_id.clone(),
            content: self.body.clone(),
            attachments: self.attachments.clone(),
            is_broadcast: self.is_broadcast,
            created_at: self.created_at,
        }
    }

    pub fn into_view(self) -> MessageView {
        MessageView {
            id: self.id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            group_id: self.group_id,
            content: self.body,
            attachments: self.attachments,
            is_broadcast: self.is_broadcast,
            created_at: self.created_at,
        }
    }
}

/// A message about to be appended; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub is_broadcast: bool,
}

impl NewMessage {
    pub fn direct(sender: UserId, receiver: UserId, body: impl Into<String>) -> Self {
        Self {
            sender_id: sender,
            receiver_id: Some(receiver),
            group_id: None,
            body: body.into(),
            attachments: Vec::new(),
            is_broadcast: false,
        }
    }

    pub fn group(sender: UserId, group: GroupId, body: impl Into<String>) -> Self {
        Self {
            sender_id: sender,
            receiver_id: None,
            group_id: Some(group),
            body: body.into(),
            attachments: Vec::new(),
            is_broadcast: false,
        }
    }

    pub fn broadcast(sender: UserId, receiver: UserId, body: impl Into<String>) -> Self {
        Self {
            is_broadcast: true,
            ..Self::direct(sender, receiver, body)
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}
