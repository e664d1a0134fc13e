//! CRUD operations for [`Group`] records and their membership.
//!
//! Membership changes are single-row statements against `group_members`, so
//! concurrent join/leave/send never race through a read-modify-write.

use rusqlite::{params, ErrorCode};

use tidings_shared::{GroupId, UserId};

use crate::database::{conversion_err, decode_ts, encode_ts, not_found, now_micros, Database};
use crate::error::{Result, StoreError};
use crate::models::Group;

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a group. The admin is always inserted as a member.
    pub fn create_group(
        &self,
        id: GroupId,
        name: &str,
        admin: &UserId,
        members: &[UserId],
    ) -> Result<Group> {
        let created_at = now_micros();
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO chat_groups (id, name, admin_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.as_str(), name, admin.as_str(), encode_ts(&created_at)],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if err.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(format!("group name '{name}' is already taken"))
            }
            other => StoreError::Sqlite(other),
        })?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for member in std::iter::once(admin).chain(members.iter()) {
                stmt.execute(params![id.as_str(), member.as_str(), encode_ts(&created_at)])?;
            }
        }
        tx.commit()?;

        tracing::info!(group = %id, name, admin = %admin, "group created");
        self.get_group(&id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_group(&self, id: &GroupId) -> Result<Group> {
        let (name, admin, created): (String, String, String) = self
            .conn()
            .query_row(
                "SELECT name, admin_id, created_at FROM chat_groups WHERE id = ?1",
                params![id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .map_err(not_found)?;

        let admin_id = UserId::parse(admin).map_err(|e| conversion_err(1, e))?;
        let created_at = decode_ts(&created).map_err(|e| conversion_err(2, e))?;

        Ok(Group {
            id: id.clone(),
            name,
            admin_id,
            members: self.group_members(id)?,
            created_at,
        })
    }

    pub fn group_members(&self, id: &GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY joined_at, user_id",
        )?;
        let rows = stmt.query_map(params![id.as_str()], |row| {
            let raw: String = row.get(0)?;
            UserId::parse(raw).map_err(|e| conversion_err(0, e))
        })?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    pub fn is_group_member(&self, id: &GroupId, user: &UserId) -> Result<bool> {
        let found: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![id.as_str(), user.as_str()],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    /// Groups `user` currently belongs to, by name.
    pub fn groups_for_user(&self, user: &UserId) -> Result<Vec<Group>> {
        let ids: Vec<String> = {
            let mut stmt = self.conn().prepare(
                "SELECT g.id FROM chat_groups g
                 JOIN group_members gm ON gm.group_id = g.id
                 WHERE gm.user_id = ?1
                 ORDER BY g.name",
            )?;
            let rows = stmt.query_map(params![user.as_str()], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        ids.into_iter()
            .map(|raw| {
                let id = GroupId::parse(raw)?;
                self.get_group(&id)
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Add `user` to the group. Returns `false` if already a member.
    pub fn join_group(&self, id: &GroupId, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at)
             SELECT id, ?2, ?3 FROM chat_groups WHERE id = ?1",
            params![id.as_str(), user.as_str(), encode_ts(&now_micros())],
        )?;
        if affected == 0 && !self.group_exists(id)? {
            return Err(StoreError::NotFound);
        }
        Ok(affected > 0)
    }

    /// Remove `user` from the group. Returns `false` if not a member.
    pub fn leave_group(&self, id: &GroupId, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![id.as_str(), user.as_str()],
        )?;
        if affected == 0 && !self.group_exists(id)? {
            return Err(StoreError::NotFound);
        }
        Ok(affected > 0)
    }

    fn group_exists(&self, id: &GroupId) -> Result<bool> {
        let found: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM chat_groups WHERE id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }
}
