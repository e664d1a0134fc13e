//! # tidings-shared
//!
//! Types shared by the tidings store and server: validated identifiers,
//! the conversation key deriver, the message read projection, and the
//! JSON frames exchanged over WebSockets and the broadcast bus.

pub mod constants;
pub mod conversation;
pub mod error;
pub mod protocol;
pub mod types;

pub use conversation::ConversationKey;
pub use error::ValidationError;
pub use types::{Attachment, AttachmentKind, GroupId, MessageView, Role, UserId};
