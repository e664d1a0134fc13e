//! Append-only message log.
//!
//! Total order inside a conversation is `(created_at, id)`, newest first on
//! every read. A cursor names a message id; "before" means strictly earlier
//! in that order, so equal timestamps never produce gaps or repeats. Ids are
//! hyphenated lowercase UUIDs, whose text order matches [`Uuid`]'s `Ord`, so
//! callers can reproduce the order without the database.

use rusqlite::types::Value;
use rusqlite::{params, Connection};
use uuid::Uuid;

use tidings_shared::types::check_message_shape;
use tidings_shared::{ConversationKey, UserId};

use crate::database::{
    conversion_err, decode_ts, encode_ts, not_found, now_micros, placeholders, Database,
};
use crate::error::Result;
use crate::models::{Message, NewMessage};

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, group_id, body, attachments, is_read, is_broadcast, created_at";

/// Where a message sits in the log's total order.
#[derive(Debug, Clone)]
struct Position {
    created_at: String,
    id: String,
}

impl Database {
    // ------------------------------------------------------------------
    // Append
    // ------------------------------------------------------------------

    /// Validate and store one message, assigning its id and timestamp.
    pub fn append(&self, new: NewMessage) -> Result<Message> {
        let message = prepare(new)?;
        insert_message(self.conn(), &message)?;

        tracing::debug!(
            message_id = %message.id,
            sender = %message.sender_id,
            "appended message"
        );
        Ok(message)
    }

    /// Store several messages in one transaction; all or nothing.
    pub fn append_batch(&self, batch: Vec<NewMessage>) -> Result<Vec<Message>> {
        let prepared = batch
            .into_iter()
            .map(prepare)
            .collect::<Result<Vec<_>>>()?;

        let tx = self.conn().unchecked_transaction()?;
        for message in &prepared {
            insert_message(&tx, message)?;
        }
        tx.commit()?;

        tracing::debug!(count = prepared.len(), "appended message batch");
        Ok(prepared)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// Newest-first page of one conversation. Returns fewer than `limit`
    /// rows (possibly none) at the start of history.
    pub fn page_by_conversation(
        &self,
        key: &ConversationKey,
        before: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let cursor = before.map(|id| self.position(id)).transpose()?;

        let (filter, values) = match key {
            ConversationKey::Direct { low, high } => (
                "group_id IS NULL AND ((sender_id = ? AND receiver_id = ?) \
                 OR (sender_id = ? AND receiver_id = ?))"
                    .to_string(),
                vec![text(low), text(high), text(high), text(low)],
            ),
            ConversationKey::Group(group) => {
                ("group_id = ?".to_string(), vec![Value::Text(group.to_string())])
            }
        };

        self.query_page(filter, values, cursor, limit)
    }

    /// Newest-first page of everything exchanged between `student` and any
    /// account in `admins`, merged into a single thread.
    pub fn page_for_admin_consolidated(
        &self,
        admins: &[UserId],
        student: &UserId,
        before: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let cursor = before.map(|id| self.position(id)).transpose()?;
        if admins.is_empty() {
            return Ok(Vec::new());
        }

        let list = placeholders(admins.len());
        let filter = format!(
            "group_id IS NULL AND ((sender_id IN ({list}) AND receiver_id = ?) \
             OR (sender_id = ? AND receiver_id IN ({list})))"
        );
        let mut values: Vec<Value> = admins.iter().map(text).collect();
        values.push(text(student));
        values.push(text(student));
        values.extend(admins.iter().map(text));

        self.query_page(filter, values, cursor, limit)
    }

    /// The latest message of every direct conversation touching any of
    /// `ids`, newest first. One row per unordered participant pair.
    pub fn latest_direct_per_conversation(&self, ids: &[UserId]) -> Result<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let list = placeholders(ids.len());
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS}, ROW_NUMBER() OVER (
                     PARTITION BY min(sender_id, receiver_id), max(sender_id, receiver_id)
                     ORDER BY created_at DESC, id DESC
                 ) AS rn
                 FROM messages
                 WHERE group_id IS NULL AND (sender_id IN ({list}) OR receiver_id IN ({list}))
             )
             WHERE rn = 1
             ORDER BY created_at DESC, id DESC"
        );
        let values = ids.iter().chain(ids.iter()).map(text).collect();
        self.query_messages(&sql, values)
    }

    /// The latest message of every group `user` belongs to, newest first.
    pub fn latest_group_messages_for_member(&self, user: &UserId) -> Result<Vec<Message>> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM (
                 SELECT {MESSAGE_COLUMNS}, ROW_NUMBER() OVER (
                     PARTITION BY group_id ORDER BY created_at DESC, id DESC
                 ) AS rn
                 FROM messages
                 WHERE group_id IN (SELECT group_id FROM group_members WHERE user_id = ?)
             )
             WHERE rn = 1
             ORDER BY created_at DESC, id DESC"
        );
        self.query_messages(&sql, vec![text(user)])
    }

    // ------------------------------------------------------------------
    // Read state
    // ------------------------------------------------------------------

    /// Mark everything `sender` sent to `receiver` as read. Idempotent:
    /// a repeat call updates nothing.
    pub fn mark_read(&self, sender: &UserId, receiver: &UserId) -> Result<usize> {
        self.mark_read_between(std::slice::from_ref(sender), std::slice::from_ref(receiver))
    }

    /// Bulk form of [`Database::mark_read`] over sets of senders and receivers.
    pub fn mark_read_between(&self, senders: &[UserId], receivers: &[UserId]) -> Result<usize> {
        if senders.is_empty() || receivers.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE messages SET is_read = 1
             WHERE is_read = 0 AND group_id IS NULL
               AND sender_id IN ({}) AND receiver_id IN ({})",
            placeholders(senders.len()),
            placeholders(receivers.len()),
        );
        let values: Vec<Value> = senders.iter().chain(receivers.iter()).map(text).collect();
        let updated = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(updated)
    }

    pub fn count_unread(&self, sender: &UserId, receiver: &UserId) -> Result<usize> {
        self.count_unread_between(std::slice::from_ref(sender), std::slice::from_ref(receiver))
    }

    /// Unread direct messages from any of `senders` to any of `receivers`.
    pub fn count_unread_between(&self, senders: &[UserId], receivers: &[UserId]) -> Result<usize> {
        if senders.is_empty() || receivers.is_empty() {
            return Ok(0);
        }
        let broadcast_filter = if self.broadcast_counts_unread() {
            ""
        } else {
            " AND is_broadcast = 0"
        };
        let sql = format!(
            "SELECT COUNT(*) FROM messages
             WHERE is_read = 0 AND group_id IS NULL
               AND sender_id IN ({}) AND receiver_id IN ({}){broadcast_filter}",
            placeholders(senders.len()),
            placeholders(receivers.len()),
        );
        let values: Vec<Value> = senders.iter().chain(receivers.iter()).map(text).collect();
        let count: i64 = self
            .conn()
            .query_row(&sql, rusqlite::params_from_iter(values), |row| row.get(0))?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn position(&self, id: Uuid) -> Result<Position> {
        self.conn()
            .query_row(
                "SELECT created_at, id FROM messages WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok(Position {
                        created_at: row.get(0)?,
                        id: row.get(1)?,
                    })
                },
            )
            .map_err(not_found)
    }

    fn query_page(
        &self,
        filter: String,
        mut values: Vec<Value>,
        cursor: Option<Position>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {filter}");
        if let Some(pos) = cursor {
            sql.push_str(" AND (created_at < ? OR (created_at = ? AND id < ?))");
            values.push(Value::Text(pos.created_at.clone()));
            values.push(Value::Text(pos.created_at));
            values.push(Value::Text(pos.id));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        values.push(Value::Integer(limit as i64));

        self.query_messages(&sql, values)
    }

    fn query_messages(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

fn text(id: impl ToString) -> Value {
    Value::Text(id.to_string())
}

fn prepare(new: NewMessage) -> Result<Message> {
    check_message_shape(
        new.receiver_id.as_ref(),
        new.group_id.as_ref(),
        &new.body,
        &new.attachments,
    )?;

    Ok(Message {
        id: Uuid::now_v7(),
        sender_id: new.sender_id,
        receiver_id: new.receiver_id,
        group_id: new.group_id,
        body: new.body,
        attachments: new.attachments,
        is_read: false,
        is_broadcast: new.is_broadcast,
        created_at: now_micros(),
    })
}

fn insert_message(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages
             (id, sender_id, receiver_id, group_id, body, attachments, is_read, is_broadcast, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.id.to_string(),
            message.sender_id.as_str(),
            message.receiver_id.as_ref().map(|r| r.as_str()),
            message.group_id.as_ref().map(|g| g.as_str()),
            message.body,
            serde_json::to_string(&message.attachments)?,
            message.is_read,
            message.is_broadcast,
            encode_ts(&message.created_at),
        ],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let sender: String = row.get(1)?;
    let receiver: Option<String> = row.get(2)?;
    let group: Option<String> = row.get(3)?;
    let body: String = row.get(4)?;
    let attachments_json: String = row.get(5)?;
    let is_read: bool = row.get(6)?;
    let is_broadcast: bool = row.get(7)?;
    let ts_str: String = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_err(0, e))?;
    let sender_id = UserId::parse(sender).map_err(|e| conversion_err(1, e))?;
    let receiver_id = receiver
        .map(UserId::parse)
        .transpose()
        .map_err(|e| conversion_err(2, e))?;
    let group_id = group
        .map(tidings_shared::GroupId::parse)
        .transpose()
        .map_err(|e| conversion_err(3, e))?;
    let attachments = serde_json::from_str(&attachments_json).map_err(|e| conversion_err(5, e))?;
    let created_at = decode_ts(&ts_str).map_err(|e| conversion_err(8, e))?;

    Ok(Message {
        id,
        sender_id,
        receiver_id,
        group_id,
        body,
        attachments,
        is_read,
        is_broadcast,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tidings_shared::{Attachment, AttachmentKind, GroupId, ValidationError};

    use super::*;
    use crate::error::StoreError;

    fn user(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn append_then_newest_first() {
        let db = db();
        let (a, b) = (user("alice"), user("bob"));

        db.append(NewMessage::direct(a.clone(), b.clone(), "first")).unwrap();
        let latest = db.append(NewMessage::direct(b.clone(), a.clone(), "hi")).unwrap();

        let page = db
            .page_by_conversation(&ConversationKey::direct(&a, &b), None, 10)
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, latest.id);
        assert_eq!(page[0].body, "hi");
        assert_eq!(page[1].body, "first");
        assert_eq!(db.get_message(latest.id).unwrap(), latest);
    }

    #[test]
    fn append_rejects_bad_shapes() {
        let db = db();
        let mut both = NewMessage::direct(user("a"), user("b"), "x");
        both.group_id = Some(GroupId::parse("g").unwrap());
        assert!(matches!(
            db.append(both),
            Err(StoreError::Validation(ValidationError::AmbiguousTarget))
        ));

        assert!(matches!(
            db.append(NewMessage::direct(user("a"), user("b"), "")),
            Err(StoreError::Validation(ValidationError::EmptyMessage))
        ));

        let with_file = NewMessage::direct(user("a"), user("b"), "").with_attachments(vec![
            Attachment {
                kind: AttachmentKind::Image,
                url: "uploads/cat.png".into(),
                file_name: "cat.png".into(),
                size_bytes: 42,
                media_type: "image/png".into(),
            },
        ]);
        let stored = db.append(with_file).unwrap();
        assert_eq!(db.get_message(stored.id).unwrap().attachments.len(), 1);
    }

    #[test]
    fn cursor_walk_has_no_gaps_or_repeats() {
        let db = db();
        let (a, b) = (user("alice"), user("bob"));
        for i in 0..23 {
            let (from, to) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
            db.append(NewMessage::direct(from.clone(), to.clone(), format!("m{i}")))
                .unwrap();
        }
        // Collapse every timestamp so ordering rests on the id alone.
        db.conn()
            .execute(
                "UPDATE messages SET created_at = '2024-05-01T12:00:00.000000Z'",
                [],
            )
            .unwrap();

        let key = ConversationKey::direct(&a, &b);
        let mut cursor = None;
        let mut walked = Vec::new();
        loop {
            let page = db.page_by_conversation(&key, cursor, 5).unwrap();
            walked.extend(page.iter().map(|m| m.body.clone()));
            if page.len() < 5 {
                break;
            }
            cursor = page.last().map(|m| m.id);
        }

        let mut all = db.page_by_conversation(&key, None, 100).unwrap();
        all.sort_by(|x, y| y.id.cmp(&x.id));
        let expected: Vec<String> = all.into_iter().map(|m| m.body).collect();
        assert_eq!(walked, expected);
        assert_eq!(walked.iter().collect::<HashSet<_>>().len(), 23);
    }

    #[test]
    fn cursor_at_oldest_returns_nothing() {
        let db = db();
        let (a, b) = (user("alice"), user("bob"));
        let oldest = db.append(NewMessage::direct(a.clone(), b.clone(), "one")).unwrap();
        db.append(NewMessage::direct(a.clone(), b.clone(), "two")).unwrap();

        let page = db
            .page_by_conversation(&ConversationKey::direct(&a, &b), Some(oldest.id), 10)
            .unwrap();
        assert!(page.is_empty());

        assert!(matches!(
            db.page_by_conversation(&ConversationKey::direct(&a, &b), Some(Uuid::now_v7()), 10),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn mark_read_is_idempotent() {
        let db = db();
        let (a, b) = (user("alice"), user("bob"));
        db.append(NewMessage::direct(a.clone(), b.clone(), "1")).unwrap();
        db.append(NewMessage::direct(a.clone(), b.clone(), "2")).unwrap();
        db.append(NewMessage::direct(b.clone(), a.clone(), "reply")).unwrap();

        assert_eq!(db.count_unread(&a, &b).unwrap(), 2);
        assert_eq!(db.mark_read(&a, &b).unwrap(), 2);
        assert_eq!(db.mark_read(&a, &b).unwrap(), 0);
        assert_eq!(db.count_unread(&a, &b).unwrap(), 0);
        // The other direction is untouched.
        assert_eq!(db.count_unread(&b, &a).unwrap(), 1);
    }

    #[test]
    fn broadcast_unread_policy() {
        let mut db = db();
        let (admin, x) = (user("admin1"), user("x"));
        db.append_batch(vec![NewMessage::broadcast(admin.clone(), x.clone(), "update")])
            .unwrap();
        db.append(NewMessage::direct(admin.clone(), x.clone(), "personal")).unwrap();

        assert_eq!(db.count_unread(&admin, &x).unwrap(), 2);
        db.set_broadcast_counts_unread(false);
        assert_eq!(db.count_unread(&admin, &x).unwrap(), 1);
    }

    #[test]
    fn consolidated_page_merges_admins() {
        let db = db();
        let admins = vec![user("admin1"), user("admin2")];
        let (s, other) = (user("student1"), user("student2"));

        db.append(NewMessage::direct(admins[0].clone(), s.clone(), "from a1")).unwrap();
        db.append(NewMessage::direct(s.clone(), admins[1].clone(), "to a2")).unwrap();
        db.append(NewMessage::direct(admins[1].clone(), other.clone(), "elsewhere")).unwrap();
        db.append(NewMessage::direct(admins[0].clone(), admins[1].clone(), "staff")).unwrap();

        let page = db.page_for_admin_consolidated(&admins, &s, None, 10).unwrap();
        let bodies: Vec<_> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["to a2", "from a1"]);

        let older = db
            .page_for_admin_consolidated(&admins, &s, Some(page[0].id), 10)
            .unwrap();
        assert_eq!(older.len(), 1);
        assert!(db.page_for_admin_consolidated(&[], &s, None, 10).unwrap().is_empty());
    }

    #[test]
    fn batch_is_atomic() {
        let db = db();
        let good = NewMessage::broadcast(user("admin1"), user("x"), "update");
        let bad = NewMessage::broadcast(user("admin1"), user("y"), "");
        assert!(db.append_batch(vec![good, bad]).is_err());

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let db = db();
        let (a, b) = (user("alice"), user("bob"));
        let mut ids: Vec<Uuid> = (0..6)
            .map(|i| {
                db.append(NewMessage::direct(a.clone(), b.clone(), format!("m{i}")))
                    .unwrap()
                    .id
            })
            .collect();
        db.conn()
            .execute(
                "UPDATE messages SET created_at = '2024-05-01T12:00:00.000000Z'",
                [],
            )
            .unwrap();

        let page = db
            .page_by_conversation(&ConversationKey::direct(&a, &b), None, 10)
            .unwrap();
        ids.sort();
        ids.reverse();
        assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), ids);
    }

    #[test]
    fn latest_direct_keeps_one_row_per_pair() {
        let db = db();
        let (admin, s1, s2) = (user("admin1"), user("s1"), user("s2"));
        db.append(NewMessage::direct(s1.clone(), admin.clone(), "old")).unwrap();
        db.append(NewMessage::direct(admin.clone(), s2.clone(), "hello s2")).unwrap();
        db.append(NewMessage::direct(admin.clone(), s1.clone(), "reply s1")).unwrap();
        db.append(NewMessage::direct(s2.clone(), user("s3"), "unrelated")).unwrap();

        let latest = db.latest_direct_per_conversation(&[admin.clone()]).unwrap();
        let bodies: Vec<_> = latest.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["reply s1", "hello s2"]);
        assert!(db.latest_direct_per_conversation(&[]).unwrap().is_empty());
    }
}
