//! Local user directory: role, phone and display data per user id.

use rusqlite::params;
use rusqlite::types::Value;

use tidings_shared::{Role, UserId};

use crate::database::{conversion_err, decode_ts, encode_ts, not_found, placeholders, Database};
use crate::error::Result;
use crate::models::User;

const USER_COLUMNS: &str = "id, role, display_name, phone, avatar_url, created_at";

impl Database {
    /// Insert or replace a directory entry.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, role, display_name, phone, avatar_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 role = excluded.role,
                 display_name = excluded.display_name,
                 phone = excluded.phone,
                 avatar_url = excluded.avatar_url",
            params![
                user.id.as_str(),
                user.role.as_str(),
                user.display_name,
                user.phone,
                user.avatar_url,
                encode_ts(&user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: &UserId) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.as_str()],
                row_to_user,
            )
            .map_err(not_found)
    }

    /// Batch lookup. Unknown ids are skipped.
    pub fn get_users(&self, ids: &[UserId]) -> Result<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id IN ({})",
            placeholders(ids.len())
        );
        let values: Vec<Value> = ids.iter().map(|id| Value::Text(id.to_string())).collect();

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    /// Every administrator account.
    pub fn admin_ids(&self) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM users WHERE role = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![Role::Admin.as_str()], |row| {
            let raw: String = row.get(0)?;
            UserId::parse(raw).map_err(|e| conversion_err(0, e))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let role: String = row.get(1)?;
    let created: String = row.get(5)?;

    Ok(User {
        id: UserId::parse(id).map_err(|e| conversion_err(0, e))?,
        role: role.parse::<Role>().map_err(|e| conversion_err(1, e))?,
        display_name: row.get(2)?,
        phone: row.get(3)?,
        avatar_url: row.get(4)?,
        created_at: decode_ts(&created).map_err(|e| conversion_err(5, e))?,
    })
}
