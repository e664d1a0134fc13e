//! Messaging operations shared by the HTTP routes and the live transport.
//!
//! Order of effects on send: validate, authorize, append to the durable log,
//! extend the cached window, publish on the bus. Only an appended message
//! reaches the cache or the bus; a failed append fails the send.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tidings_shared::constants::{
    DEFAULT_PAGE_LIMIT, DELIVERY_TOPIC, MAX_PAGE_LIMIT, ROLLING_CACHE_CAP,
};
use tidings_shared::protocol::{BusEnvelope, BusEvent, SendReceipt};
use tidings_shared::types::check_message_shape;
use tidings_shared::{Attachment, ConversationKey, GroupId, MessageView, UserId, ValidationError};
use tidings_store::{Group, Message, NewMessage, User};

use crate::bus::BroadcastBus;
use crate::cache::{Cached, RecentWindows};
use crate::directory::Directory;
use crate::error::{NotFoundAs, ServerError};
use crate::inbox::{build_inbox, InboxPage};
use crate::message_log::MessageLog;
use crate::signer::{sign_views, UrlSigner};

const MAX_GROUP_NAME_CHARS: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub sender_id: UserId,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Whose thread a page request addresses.
#[derive(Debug, Clone)]
pub enum Thread {
    Partner(UserId),
    Group(GroupId),
}

#[derive(Debug, Clone)]
pub struct PageRequest {
    pub viewer_id: UserId,
    pub thread: Thread,
    pub cursor: Option<Uuid>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    pub next_cursor: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub sender_id: UserId,
    pub recipient_ids: Vec<UserId>,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateGroupRequest {
    pub admin_id: UserId,
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

/// How a direct-thread request resolves once roles are known.
enum Source {
    Cached(ConversationKey),
    Consolidated { student: UserId },
}

#[derive(Clone)]
pub struct Messenger {
    log: MessageLog,
    windows: RecentWindows,
    bus: Arc<dyn BroadcastBus>,
    directory: Arc<dyn Directory>,
    signer: Arc<dyn UrlSigner>,
    instance_id: String,
    max_payload_bytes: usize,
}

impl Messenger {
    pub fn new(
        log: MessageLog,
        windows: RecentWindows,
        bus: Arc<dyn BroadcastBus>,
        directory: Arc<dyn Directory>,
        signer: Arc<dyn UrlSigner>,
        instance_id: String,
        max_payload_bytes: usize,
    ) -> Self {
        Self {
            log,
            windows,
            bus,
            directory,
            signer,
            instance_id,
            max_payload_bytes,
        }
    }

    pub fn windows(&self) -> &RecentWindows {
        &self.windows
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    pub async fn send(&self, req: SendRequest) -> Result<SendReceipt, ServerError> {
        check_message_shape(
            req.receiver_id.as_ref(),
            req.group_id.as_ref(),
            &req.body,
            &req.attachments,
        )?;
        self.check_size(&req.body, &req.attachments)?;

        if let Some(receiver) = &req.receiver_id {
            if self.directory.lookup(receiver).await?.is_none() {
                return Err(ServerError::NotFound(format!("user {receiver}")));
            }
        }
        if let Some(group) = &req.group_id {
            self.ensure_member(group, &req.sender_id).await?;
        }

        let new = NewMessage {
            sender_id: req.sender_id,
            receiver_id: req.receiver_id,
            group_id: req.group_id,
            body: req.body,
            attachments: req.attachments,
            is_broadcast: false,
        };
        let stored = self.log.write(move |db| db.append(new)).await?;
        let view = stored.into_view();
        info!(
            message_id = %view.id,
            sender = %view.sender_id,
            "message stored"
        );

        self.windows.record(&view).await;

        let receipt = SendReceipt {
            message_id: view.id,
            created_at: view.created_at,
        };
        let mut outgoing = vec![view];
        sign_views(self.signer.as_ref(), &mut outgoing);
        let event = match outgoing.pop() {
            Some(message) if message.group_id.is_some() => BusEvent::Group { message },
            Some(message) => BusEvent::Direct { message },
            None => return Ok(receipt),
        };
        self.publish(event).await;

        Ok(receipt)
    }

    fn check_size(&self, body: &str, attachments: &[Attachment]) -> Result<(), ServerError> {
        let attachment_bytes = serde_json::to_vec(attachments)
            .map_err(|e| ServerError::Validation(e.to_string()))?
            .len();
        let size = body.len() + attachment_bytes;
        if size > self.max_payload_bytes {
            return Err(ValidationError::PayloadTooLarge {
                size,
                max: self.max_payload_bytes,
            }
            .into());
        }
        Ok(())
    }

    async fn ensure_member(&self, group: &GroupId, user: &UserId) -> Result<(), ServerError> {
        let (group_id, user_id) = (group.clone(), user.clone());
        let group_ref = group.clone();
        let is_member = self
            .log
            .read(move |db| {
                db.get_group(&group_id)?;
                db.is_group_member(&group_id, &user_id)
            })
            .await
            .not_found_as(|| format!("group {group_ref}"))?;
        if !is_member {
            return Err(ServerError::Forbidden(format!(
                "{user} is not a member of group {group}"
            )));
        }
        Ok(())
    }

    async fn publish(&self, event: BusEvent) {
        let envelope = BusEnvelope {
            origin: self.instance_id.clone(),
            event,
        };
        if let Err(e) = self.bus.publish(DELIVERY_TOPIC, &envelope).await {
            warn!(error = %e, "live delivery publish failed");
        }
    }

    // ------------------------------------------------------------------
    // Fetch page
    // ------------------------------------------------------------------

    pub async fn fetch_page(&self, req: PageRequest) -> Result<MessagePage, ServerError> {
        let limit = req
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);

        let source = match &req.thread {
            Thread::Group(group) => {
                self.ensure_member(group, &req.viewer_id).await?;
                Source::Cached(ConversationKey::group(group))
            }
            Thread::Partner(partner) => self.resolve_direct(&req.viewer_id, partner).await?,
        };

        let mut messages = match source {
            Source::Cached(key) => self.cached_page(key, req.cursor, limit).await?,
            Source::Consolidated { student } => {
                let admins = self.directory.admin_ids().await?;
                let cursor = req.cursor;
                self.log
                    .read(move |db| {
                        db.page_for_admin_consolidated(&admins, &student, cursor, limit)
                    })
                    .await
                    .not_found_as(|| "cursor message".to_string())?
                    .into_iter()
                    .map(Message::into_view)
                    .collect()
            }
        };

        let next_cursor = if messages.len() == limit {
            messages.last().map(|m| m.id)
        } else {
            None
        };
        sign_views(self.signer.as_ref(), &mut messages);

        Ok(MessagePage {
            messages,
            next_cursor,
        })
    }

    async fn resolve_direct(&self, viewer: &UserId, partner: &UserId) -> Result<Source, ServerError> {
        let viewer_is_admin = self.is_admin(viewer).await?;

        if partner.is_support() {
            if viewer_is_admin {
                return Err(ServerError::Validation(
                    "administrators address students directly".to_string(),
                ));
            }
            return Ok(Source::Consolidated {
                student: viewer.clone(),
            });
        }

        if viewer_is_admin && !self.is_admin(partner).await? {
            return Ok(Source::Consolidated {
                student: partner.clone(),
            });
        }
        Ok(Source::Cached(ConversationKey::direct(viewer, partner)))
    }

    async fn is_admin(&self, id: &UserId) -> Result<bool, ServerError> {
        Ok(self
            .directory
            .lookup(id)
            .await?
            .is_some_and(|u: User| u.role.is_admin()))
    }

    /// Newest-first page for a single conversation key, answered from the
    /// rolling cache when the window can prove it holds the whole answer.
    async fn cached_page(
        &self,
        key: ConversationKey,
        cursor: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<MessageView>, ServerError> {
        let mut fill_version = None;
        if cursor.is_none() {
            match self.windows.window(&key).await {
                // A window shorter than the cap is the entire history.
                Cached::Hit(mut window)
                    if window.len() >= limit || window.len() < ROLLING_CACHE_CAP =>
                {
                    debug!(key = %key, cached = window.len(), "page served from cache");
                    window.truncate(limit);
                    return Ok(window);
                }
                Cached::Miss(version) => fill_version = Some(version),
                Cached::Hit(_) | Cached::Unavailable => {}
            }
        }

        let fetch = if cursor.is_none() {
            limit.max(ROLLING_CACHE_CAP)
        } else {
            limit
        };
        let query_key = key.clone();
        let mut page: Vec<MessageView> = self
            .log
            .read(move |db| db.page_by_conversation(&query_key, cursor, fetch))
            .await
            .not_found_as(|| "cursor message".to_string())?
            .into_iter()
            .map(Message::into_view)
            .collect();

        if let Some(version) = fill_version {
            let window_len = page.len().min(ROLLING_CACHE_CAP);
            self.windows.fill(&key, version, &page[..window_len]).await;
        }
        page.truncate(limit);
        Ok(page)
    }

    // ------------------------------------------------------------------
    // Read state
    // ------------------------------------------------------------------

    pub async fn mark_read(&self, viewer: &UserId, partner: &UserId) -> Result<usize, ServerError> {
        let source = self.resolve_direct(viewer, partner).await?;
        let (senders, receivers) = match source {
            Source::Consolidated { student } if student == *viewer => {
                (self.directory.admin_ids().await?, vec![student])
            }
            Source::Consolidated { student } => (vec![student], self.directory.admin_ids().await?),
            Source::Cached(_) => (vec![partner.clone()], vec![viewer.clone()]),
        };

        let updated = self
            .log
            .write(move |db| db.mark_read_between(&senders, &receivers))
            .await?;
        debug!(viewer = %viewer, partner = %partner, updated, "marked read");
        Ok(updated)
    }

    pub async fn inbox(
        &self,
        viewer: &UserId,
        page: usize,
        limit: usize,
    ) -> Result<InboxPage, ServerError> {
        build_inbox(&self.log, self.directory.as_ref(), viewer, page, limit).await
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    /// Store one message per recipient and announce them with one publish.
    pub async fn broadcast(&self, req: BroadcastRequest) -> Result<usize, ServerError> {
        if !self.is_admin(&req.sender_id).await? {
            return Err(ServerError::Forbidden(
                "only administrators may broadcast".to_string(),
            ));
        }
        if req.body.trim().is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        self.check_size(&req.body, &[])?;
        if req.recipient_ids.is_empty() {
            return Err(ServerError::Validation(
                "broadcast needs at least one recipient".to_string(),
            ));
        }

        let mut wanted: Vec<UserId> = Vec::with_capacity(req.recipient_ids.len());
        for id in req.recipient_ids {
            if id != req.sender_id && !wanted.contains(&id) {
                wanted.push(id);
            }
        }
        let known: Vec<UserId> = self
            .directory
            .lookup_many(&wanted)
            .await?
            .into_iter()
            .map(|u| u.id)
            .collect();
        let recipients: Vec<UserId> = wanted.into_iter().filter(|id| known.contains(id)).collect();
        if recipients.is_empty() {
            return Ok(0);
        }

        let sender = req.sender_id;
        let body = req.body;
        let batch: Vec<NewMessage> = recipients
            .iter()
            .map(|r| NewMessage::broadcast(sender.clone(), r.clone(), body.clone()))
            .collect();
        let stored = self.log.write(move |db| db.append_batch(batch)).await?;
        let views: Vec<MessageView> = stored.into_iter().map(Message::into_view).collect();

        for view in &views {
            self.windows.record(view).await;
        }
        let accepted = views.len();
        info!(sender = %sender, accepted, "broadcast stored");
        self.publish(BusEvent::Broadcast { messages: views }).await;

        Ok(accepted)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    pub async fn create_group(&self, req: CreateGroupRequest) -> Result<Group, ServerError> {
        let name = req.name.trim().to_string();
        if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_CHARS {
            return Err(ServerError::Validation(format!(
                "group name must be 1 to {MAX_GROUP_NAME_CHARS} characters"
            )));
        }
        let id = GroupId::generate();
        let admin = req.admin_id;
        let members = req.member_ids;
        self.log
            .write(move |db| db.create_group(id, &name, &admin, &members))
            .await
    }

    pub async fn join_group(&self, group: &GroupId, user: &UserId) -> Result<bool, ServerError> {
        let (group_id, user_id) = (group.clone(), user.clone());
        self.log
            .write(move |db| db.join_group(&group_id, &user_id))
            .await
            .not_found_as(|| format!("group {group}"))
    }

    pub async fn leave_group(&self, group: &GroupId, user: &UserId) -> Result<bool, ServerError> {
        let (group_id, user_id) = (group.clone(), user.clone());
        let existing = self
            .log
            .read(move |db| db.get_group(&group_id))
            .await
            .not_found_as(|| format!("group {group}"))?;
        if existing.admin_id == *user {
            return Err(ServerError::Forbidden(
                "the group admin cannot leave their own group".to_string(),
            ));
        }
        let group_id = group.clone();
        self.log
            .write(move |db| db.leave_group(&group_id, &user_id))
            .await
            .not_found_as(|| format!("group {group}"))
    }
}
