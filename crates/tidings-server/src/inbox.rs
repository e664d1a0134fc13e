//! Per-viewer inbox: one row per conversation partner or group, newest
//! activity first.
//!
//! Administrators share a single view over every student conversation, and
//! non-administrators see every administrator folded into one synthetic
//! "support" partner. Both cases run through the same grouping pass; the only
//! branch is `viewer_is_admin`.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use tidings_shared::constants::{MAX_PAGE_LIMIT, PREVIEW_CHARS, SUPPORT_DISPLAY_NAME};
use tidings_shared::{GroupId, Role, UserId};
use tidings_store::{Message, User};

use crate::directory::Directory;
use crate::error::ServerError;
use crate::message_log::MessageLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartnerKind {
    User,
    Support,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerSummary {
    pub kind: PartnerKind,
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// For the support row: the administrator of the latest exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representative_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    pub partner: PartnerSummary,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub last_sender_id: UserId,
    pub is_broadcast: bool,
    pub unread_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxPage {
    pub entries: Vec<InboxEntry>,
    pub total_count: usize,
    pub total_unread: usize,
    pub page: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Partner {
    User(UserId),
    Support,
    Group(GroupId),
}

#[derive(Debug)]
struct Row {
    partner: Partner,
    representative: Option<UserId>,
    last: Message,
}

/// Group newest-first direct messages by partner. The input holds the latest
/// message of each conversation; several conversations can fold into one
/// partner, and rows come out in first-seen order, so each row's message is
/// its most recent one.
fn group_direct(
    messages: Vec<Message>,
    viewer: &UserId,
    admins: &HashSet<UserId>,
    viewer_is_admin: bool,
) -> Vec<Row> {
    let mut rows: Vec<Row> = Vec::new();
    let mut index: HashMap<Partner, usize> = HashMap::new();

    for message in messages {
        let Some(receiver) = message.receiver_id.clone() else {
            continue;
        };
        let sender = message.sender_id.clone();

        let (partner, representative) = if viewer_is_admin {
            match (admins.contains(&sender), admins.contains(&receiver)) {
                (true, false) => (Partner::User(receiver), None),
                (false, true) => (Partner::User(sender), None),
                // Between two administrators: only shown to the two of them.
                (true, true) if sender == *viewer => (Partner::User(receiver), None),
                (true, true) if receiver == *viewer => (Partner::User(sender), None),
                _ => continue,
            }
        } else {
            let other = if sender == *viewer { receiver } else { sender };
            if admins.contains(&other) {
                (Partner::Support, Some(other))
            } else {
                (Partner::User(other), None)
            }
        };

        if index.contains_key(&partner) {
            continue;
        }
        index.insert(partner.clone(), rows.len());
        rows.push(Row {
            partner,
            representative,
            last: message,
        });
    }
    rows
}

/// Merge direct and group rows by last activity, newest first. The sort is
/// stable, so ties keep grouping order.
fn merge_rows(mut direct: Vec<Row>, groups: Vec<Message>) -> Vec<Row> {
    direct.extend(groups.into_iter().filter_map(|m| {
        let group = m.group_id.clone()?;
        Some(Row {
            partner: Partner::Group(group),
            representative: None,
            last: m,
        })
    }));
    direct.sort_by(|a, b| b.last.created_at.cmp(&a.last.created_at));
    direct
}

/// Which unread count a row shows, as (senders, receivers).
fn unread_query(
    row: &Row,
    viewer: &UserId,
    admins: &[UserId],
    viewer_is_admin: bool,
) -> Option<(Vec<UserId>, Vec<UserId>)> {
    match &row.partner {
        Partner::Group(_) => None,
        Partner::Support => Some((admins.to_vec(), vec![viewer.clone()])),
        Partner::User(partner) if viewer_is_admin && !admins.contains(partner) => {
            Some((vec![partner.clone()], admins.to_vec()))
        }
        Partner::User(partner) => Some((vec![partner.clone()], vec![viewer.clone()])),
    }
}

pub fn preview(message: &Message) -> String {
    if message.body.trim().is_empty() {
        if let Some(first) = message.attachments.first() {
            return format!("[attachment] {}", first.file_name);
        }
    }
    message.body.chars().take(PREVIEW_CHARS).collect()
}

pub async fn build_inbox(
    log: &MessageLog,
    directory: &dyn Directory,
    viewer: &UserId,
    page: usize,
    limit: usize,
) -> Result<InboxPage, ServerError> {
    let profile = directory
        .lookup(viewer)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("user {viewer}")))?;
    let viewer_is_admin = profile.role.is_admin();
    let admins = directory.admin_ids().await?;
    let admin_set: HashSet<UserId> = admins.iter().cloned().collect();

    let page = page.max(1);
    let limit = limit.clamp(1, MAX_PAGE_LIMIT);

    let (direct, group_latest, group_names) = log
        .read({
            let viewer = viewer.clone();
            let involved = if viewer_is_admin {
                admins.clone()
            } else {
                vec![viewer.clone()]
            };
            move |db| {
                let direct = db.latest_direct_per_conversation(&involved)?;
                let latest = db.latest_group_messages_for_member(&viewer)?;
                let names: HashMap<GroupId, String> = db
                    .groups_for_user(&viewer)?
                    .into_iter()
                    .map(|g| (g.id, g.name))
                    .collect();
                Ok((direct, latest, names))
            }
        })
        .await?;

    let rows = merge_rows(
        group_direct(direct, viewer, &admin_set, viewer_is_admin),
        group_latest,
    );

    let queries: Vec<_> = rows
        .iter()
        .map(|row| unread_query(row, viewer, &admins, viewer_is_admin))
        .collect();
    let unread: Vec<usize> = log
        .read(move |db| {
            queries
                .iter()
                .map(|q| match q {
                    Some((senders, receivers)) => db.count_unread_between(senders, receivers),
                    None => Ok(0),
                })
                .collect()
        })
        .await?;

    let total_count = rows.len();
    let total_unread = unread.iter().sum();
    let total_pages = total_count.div_ceil(limit);

    let visible: Vec<(Row, usize)> = rows
        .into_iter()
        .zip(unread)
        .skip((page - 1).saturating_mul(limit))
        .take(limit)
        .collect();

    let lookup_ids: Vec<UserId> = visible
        .iter()
        .filter_map(|(row, _)| match &row.partner {
            Partner::User(id) => Some(id.clone()),
            _ => None,
        })
        .collect();
    let profiles: HashMap<UserId, User> = directory
        .lookup_many(&lookup_ids)
        .await?
        .into_iter()
        .map(|u| (u.id.clone(), u))
        .collect();

    let entries = visible
        .into_iter()
        .map(|(row, unread_count)| {
            let partner = summarize(&row, &profiles, &group_names);
            InboxEntry {
                partner,
                last_message: preview(&row.last),
                last_message_at: row.last.created_at,
                last_sender_id: row.last.sender_id,
                is_broadcast: row.last.is_broadcast,
                unread_count,
            }
        })
        .collect();

    Ok(InboxPage {
        entries,
        total_count,
        total_unread,
        page,
        total_pages,
    })
}

fn summarize(
    row: &Row,
    profiles: &HashMap<UserId, User>,
    group_names: &HashMap<GroupId, String>,
) -> PartnerSummary {
    match &row.partner {
        Partner::Support => PartnerSummary {
            kind: PartnerKind::Support,
            id: UserId::support().to_string(),
            name: SUPPORT_DISPLAY_NAME.to_string(),
            role: Some(Role::Admin),
            avatar_url: None,
            phone: None,
            representative_id: row.representative.clone(),
        },
        Partner::Group(group) => PartnerSummary {
            kind: PartnerKind::Group,
            id: group.to_string(),
            name: group_names
                .get(group)
                .cloned()
                .unwrap_or_else(|| group.to_string()),
            role: None,
            avatar_url: None,
            phone: None,
            representative_id: None,
        },
        Partner::User(id) => {
            let profile = profiles.get(id);
            PartnerSummary {
                kind: PartnerKind::User,
                id: id.to_string(),
                name: profile
                    .map(|p| p.display_name.clone())
                    .unwrap_or_else(|| id.to_string()),
                role: profile.map(|p| p.role),
                avatar_url: profile.and_then(|p| p.avatar_url.clone()),
                phone: profile.and_then(|p| p.phone.clone()),
                representative_id: None,
            }
        }
    }
}
