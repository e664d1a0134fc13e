//! User directory: roles and display data for permission checks and inbox
//! rendering.

use async_trait::async_trait;

use tidings_shared::UserId;
use tidings_store::User;

use crate::error::ServerError;
use crate::message_log::MessageLog;

#[async_trait]
pub trait Directory: Send + Sync {
    async fn lookup(&self, id: &UserId) -> Result<Option<User>, ServerError>;

    /// Batch lookup. Unknown ids are absent from the result.
    async fn lookup_many(&self, ids: &[UserId]) -> Result<Vec<User>, ServerError>;

    async fn admin_ids(&self) -> Result<Vec<UserId>, ServerError>;
}

/// Directory backed by the `users` table of the message log database.
#[derive(Clone)]
pub struct StoreDirectory {
    log: MessageLog,
}

impl StoreDirectory {
    pub fn new(log: MessageLog) -> Self {
        Self { log }
    }

    /// Insert or update an entry and return it as stored. An existing
    /// entry keeps its original `created_at`.
    pub async fn upsert(&self, user: User) -> Result<User, ServerError> {
        if user.id == UserId::support() {
            return Err(ServerError::Validation(format!(
                "{} is reserved for the support identity",
                user.id
            )));
        }
        self.log
            .write(move |db| {
                db.upsert_user(&user)?;
                db.get_user(&user.id)
            })
            .await
    }
}

#[async_trait]
impl Directory for StoreDirectory {
    async fn lookup(&self, id: &UserId) -> Result<Option<User>, ServerError> {
        let id = id.clone();
        match self.log.read(move |db| db.get_user(&id)).await {
            Ok(user) => Ok(Some(user)),
            Err(ServerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lookup_many(&self, ids: &[UserId]) -> Result<Vec<User>, ServerError> {
        let ids = ids.to_vec();
        self.log.read(move |db| db.get_users(&ids)).await
    }

    async fn admin_ids(&self) -> Result<Vec<UserId>, ServerError> {
        self.log.read(|db| db.admin_ids()).await
    }
}
